//! Shutterbug agent binary
//!
//! Loads configuration, connects to the coordinator and serves commands
//! until the link drops or the process is interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use shutterbug::{
    Acquired, AlignMode, CaptureSession, ControlLink, Dispatcher, DispatcherConfig, DiskSink,
    FrameSource, LinkOptions, RoleCell, SessionOptions, SourceSettings, SyntheticSource,
};
use shutterconf::ShutterConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SYNTHETIC_WIDTH: u32 = 640;
const SYNTHETIC_HEIGHT: u32 = 480;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const LINK_POLL: Duration = Duration::from_millis(250);

/// Remotely controlled RGB-D capture agent
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file read in place of ./shutterbug.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the coordinator and serve commands (default)
    Run(RunArgs),

    /// Print the effective configuration as TOML
    Config,

    /// Open the frame source, grab one frame set, release it
    Check,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Coordinator address (host:port)
    #[arg(long)]
    coordinator: Option<String>,

    /// Directory session folders are created under
    #[arg(long)]
    dataset_root: Option<PathBuf>,

    /// Initial node role
    #[arg(long)]
    role: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = ShutterConfig::load_with_sources_from(cli.config.as_deref())
        .context("failed to load configuration")?;

    init_tracing(&config.infra.telemetry.log_level);
    for file in &sources.files {
        tracing::debug!("config loaded from {}", file.display());
    }
    for var in &sources.env_overrides {
        tracing::debug!("config overridden by {}", var);
    }

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(config, args).await,
        Commands::Config => {
            for file in &sources.files {
                println!("# loaded from {}", file.display());
            }
            print!("{}", config.to_toml());
            Ok(())
        }
        Commands::Check => {
            let mut source = synthetic_source(&config);
            check_source(&mut source, source_settings(&config)?)
        }
    }
}

fn init_tracing(level: &str) {
    let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_names(true)
        .init();
}

fn synthetic_source(config: &ShutterConfig) -> SyntheticSource {
    SyntheticSource::new(SYNTHETIC_WIDTH, SYNTHETIC_HEIGHT, config.bootstrap.synthetic_fps)
}

fn source_settings(config: &ShutterConfig) -> Result<SourceSettings> {
    let align_mode = AlignMode::parse(&config.bootstrap.align_mode).with_context(|| {
        format!(
            "bootstrap.align_mode '{}' is not one of HW, SW, NONE",
            config.bootstrap.align_mode
        )
    })?;
    Ok(SourceSettings {
        align_mode,
        enable_sync: config.bootstrap.enable_sync,
    })
}

/// Check the source delivers a convertible frame set, then hand it back closed.
fn check_source(source: &mut dyn FrameSource, settings: SourceSettings) -> Result<()> {
    source.open(&settings).context("frame source failed to open")?;

    let deadline = Instant::now() + Duration::from_secs(5);
    let outcome = loop {
        match source.try_acquire(Duration::from_millis(100)) {
            Ok(Acquired::Frames(set)) => break set.convert().map_err(anyhow::Error::from),
            Ok(Acquired::Timeout) if Instant::now() < deadline => continue,
            Ok(Acquired::Timeout) => break Err(anyhow::anyhow!("no frames within 5s")),
            Err(e) => break Err(e.into()),
        }
    };
    source.release();

    let pair = outcome.context("frame source check failed")?;
    info!(
        "frame source ok: {}x{} color, {}x{} depth",
        pair.color.width(),
        pair.color.height(),
        pair.depth.width,
        pair.depth.height
    );
    Ok(())
}

async fn run(mut config: ShutterConfig, args: RunArgs) -> Result<()> {
    if let Some(coordinator) = args.coordinator {
        config.infra.link.coordinator = coordinator;
    }
    if let Some(root) = args.dataset_root {
        config.infra.capture.dataset_root = root;
    }
    if let Some(role) = args.role {
        config.bootstrap.role = role;
    }
    config.validate()?;
    if config.bootstrap.role.trim().is_empty() {
        bail!("role must not be empty");
    }

    info!("shutterbug {} starting as {}", env!("CARGO_PKG_VERSION"), config.bootstrap.role);

    let mut source = synthetic_source(&config);
    check_source(&mut source, source_settings(&config)?)?;

    let session = Arc::new(CaptureSession::new(
        Box::new(source),
        Arc::new(DiskSink::new(config.infra.capture.jpeg_quality)),
        SessionOptions::from_config(&config.infra.capture),
    ));
    let role = Arc::new(RoleCell::new(config.bootstrap.role.as_str()));
    let dispatcher = Arc::new(Dispatcher::new(
        DispatcherConfig::from_config(&config),
        Arc::clone(&session),
        role,
    ));

    let addr = config.infra.link.coordinator.clone();
    let options = LinkOptions::from_config(&config.infra.link);
    let mut link = tokio::task::spawn_blocking(move || ControlLink::connect(&addr, &options))
        .await?
        .with_context(|| format!("cannot reach coordinator {}", config.infra.link.coordinator))?;
    link.spawn(dispatcher)?;
    info!("serving commands from {}", link.peer());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(LINK_POLL);
    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res.context("failed to listen for ctrl-c")?;
                info!("interrupted, shutting down");
                break;
            }
            _ = ticker.tick() => {
                if !link.is_alive() {
                    warn!("control link to {} is gone, shutting down", link.peer());
                    break;
                }
            }
        }
    }

    link.stop();

    let drained = tokio::task::spawn_blocking(move || session.shutdown(DRAIN_TIMEOUT)).await?;
    if !drained {
        warn!("capture session did not drain within {:?}", DRAIN_TIMEOUT);
    }

    info!("shutterbug shutdown complete");
    Ok(())
}
