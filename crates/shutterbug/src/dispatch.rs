//! Command dispatcher
//!
//! Turns one decoded message into exactly one side effect and returns before
//! the control link reads the next message. Starting a session only spawns
//! the acquisition thread; it never runs the session on the caller's thread.

use std::path::PathBuf;
use std::process::Command as Process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::SourceSettings;
use crate::link::MessageHandler;
use crate::protocol::{self, Command, Message, ParseOptions, StartArgs};
use crate::role::RoleCell;
use crate::session::{resolve_folder, CaptureSession, StartRequest};
use shutterconf::ShutterConfig;

/// Something that can make the node audible.
pub trait Annunciator: Send + Sync + 'static {
    fn signal(&self, pulses: u8);
}

/// Runs the `beep` utility on a detached thread.
#[derive(Debug, Clone)]
pub struct BeepAnnunciator {
    program: String,
}

impl BeepAnnunciator {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for BeepAnnunciator {
    fn default() -> Self {
        Self::new("beep")
    }
}

impl Annunciator for BeepAnnunciator {
    fn signal(&self, pulses: u8) {
        let program = self.program.clone();
        let spawned = std::thread::Builder::new()
            .name("beep".to_string())
            .spawn(move || {
                let repeats = pulses.to_string();
                let result = Process::new(&program)
                    .args(["-f", "2000", "-r", &repeats, "-d", "100", "-l", "50"])
                    .status();
                match result {
                    Ok(status) if status.success() => {}
                    Ok(status) => warn!("{} exited with {}", program, status),
                    Err(e) => warn!("failed to run {}: {}", program, e),
                }
            });
        if let Err(e) = spawned {
            warn!("failed to spawn beep thread: {}", e);
        }
    }
}

/// Dispatcher settings, lifted out of the full config.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub identity: String,
    pub lenient_ack: bool,
    pub reply_timestamps: bool,
    pub placeholder: String,
    pub dataset_root: PathBuf,
    pub enable_sync: bool,
}

impl DispatcherConfig {
    pub fn from_config(config: &ShutterConfig) -> Self {
        Self {
            identity: config.infra.link.identity.clone(),
            lenient_ack: config.infra.link.lenient_ack,
            reply_timestamps: config.infra.link.reply_timestamps,
            placeholder: config.infra.capture.placeholder.clone(),
            dataset_root: config.infra.capture.dataset_root.clone(),
            enable_sync: config.bootstrap.enable_sync,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_config(&ShutterConfig::default())
    }
}

/// What a dispatched message did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Identity(String),
    Standby { timestamp: String },
    Started { id: Uuid, root: PathBuf },
    Stopped { timestamp: String, was_running: bool },
    RoleSet { previous: String, current: String },
    Signalled { pulses: u8 },
    Rejected(String),
    Ignored,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    session: Arc<CaptureSession>,
    role: Arc<RoleCell>,
    annunciator: Arc<dyn Annunciator>,
    standby: AtomicBool,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, session: Arc<CaptureSession>, role: Arc<RoleCell>) -> Self {
        Self {
            config,
            session,
            role,
            annunciator: Arc::new(BeepAnnunciator::default()),
            standby: AtomicBool::new(false),
        }
    }

    pub fn with_annunciator(mut self, annunciator: Arc<dyn Annunciator>) -> Self {
        self.annunciator = annunciator;
        self
    }

    pub fn session(&self) -> &Arc<CaptureSession> {
        &self.session
    }

    pub fn role(&self) -> &Arc<RoleCell> {
        &self.role
    }

    pub fn is_standby(&self) -> bool {
        self.standby.load(Ordering::Acquire)
    }

    /// Parse and act on one message.
    pub fn dispatch(&self, text: &str) -> Outcome {
        let options = ParseOptions {
            lenient_ack: self.config.lenient_ack,
        };
        match protocol::parse_message(text, options) {
            Message::Ack => {
                debug!("ack, identifying as {}", self.config.identity);
                Outcome::Identity(self.config.identity.clone())
            }
            Message::Exec(cmd) => self.exec(cmd),
            Message::SetRole(role) => {
                let previous = self.role.set(role.as_str());
                info!("mode changed {} -> {}", previous, role);
                Outcome::RoleSet {
                    previous: previous.to_string(),
                    current: role,
                }
            }
            Message::Invalid(e) => {
                warn!("ignoring malformed message {:?}: {}", text, e);
                Outcome::Ignored
            }
            Message::Unknown => {
                debug!("ignoring unknown message {:?}", text);
                Outcome::Ignored
            }
        }
    }

    fn exec(&self, cmd: Command) -> Outcome {
        match cmd {
            Command::Standby => {
                self.standby.store(true, Ordering::Release);
                let timestamp = protocol::timestamp();
                info!("standby at {}", timestamp);
                Outcome::Standby { timestamp }
            }
            Command::Start(args) => self.start(args),
            Command::Stop => {
                let was_running = self.session.stop();
                let timestamp = protocol::timestamp();
                info!("stop at {} (session was running: {})", timestamp, was_running);
                Outcome::Stopped {
                    timestamp,
                    was_running,
                }
            }
            Command::Signal { pulses } => {
                debug!("signalling {} pulse(s)", pulses);
                self.annunciator.signal(pulses);
                Outcome::Signalled { pulses }
            }
            Command::Unrecognized(verb) => {
                warn!("ignoring unrecognized command '{}'", verb);
                Outcome::Ignored
            }
        }
    }

    fn start(&self, args: StartArgs) -> Outcome {
        let role = self.role.get();
        let folder = args.folder_for(&role, &self.config.placeholder);

        let Some(root) = resolve_folder(&self.config.dataset_root, &folder) else {
            warn!("refusing start into folder '{}'", folder);
            return Outcome::Rejected(format!("invalid folder '{folder}'"));
        };

        if let Err(e) = std::fs::create_dir_all(&root) {
            warn!("cannot create {}: {}", root.display(), e);
            return Outcome::Rejected(format!("cannot create {}: {e}", root.display()));
        }

        let request = StartRequest {
            root: root.clone(),
            settings: SourceSettings {
                align_mode: args.align_mode,
                enable_sync: self.config.enable_sync,
            },
        };
        match self.session.start(request) {
            Ok(id) => {
                self.standby.store(false, Ordering::Release);
                info!("start as {} into {}", role, root.display());
                Outcome::Started { id, root }
            }
            Err(e) => {
                warn!("start rejected: {}", e);
                Outcome::Rejected(e.to_string())
            }
        }
    }
}

impl MessageHandler for Dispatcher {
    fn handle(&self, message: &str) -> Option<String> {
        match self.dispatch(message) {
            Outcome::Identity(identity) => Some(identity),
            Outcome::Standby { timestamp } | Outcome::Stopped { timestamp, .. }
                if self.config.reply_timestamps =>
            {
                Some(timestamp)
            }
            _ => None,
        }
    }
}
