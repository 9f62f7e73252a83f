//! Minimal configuration loading for the shutterbug capture agent.
//!
//! # Configuration Philosophy
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): things that cannot change while the
//!   agent runs - coordinator address, dataset root, worker counts, logging.
//!
//! - **Bootstrap** (`BootstrapConfig`): initial values that seed runtime state.
//!   The role is the main one: the coordinator overwrites it with `set,<role>`.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/shutterbug/config.toml` (system)
//! 2. `~/.config/shutterbug/config.toml` (user)
//! 3. `./shutterbug.toml` or the `--config` path (local override)
//! 4. Environment variables (`SHUTTERBUG_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [link]
//! coordinator = "192.168.5.2:51000"
//! framing = "chunk"
//! identity = "Orbbec_main"
//!
//! [capture]
//! dataset_root = "/docker_disk/dataset"
//! save_workers = 4
//! save_queue = 8
//! overflow = "block"
//!
//! [telemetry]
//! log_level = "info"
//!
//! [bootstrap]
//! role = "TX"
//! ```

pub mod bootstrap;
pub mod infra;
pub mod loader;

pub use bootstrap::BootstrapConfig;
pub use infra::{CaptureConfig, Framing, InfraConfig, LinkConfig, OverflowPolicy, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid config value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Complete agent configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShutterConfig {
    /// Infrastructure - cannot change at runtime.
    pub infra: InfraConfig,

    /// Bootstrap - seeds runtime state.
    pub bootstrap: BootstrapConfig,
}

impl ShutterConfig {
    /// Load configuration from all sources, with an optional file taking the
    /// place of the local `./shutterbug.toml`, and report what was applied.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let mut config = loader::from_table(merged, &origin)?;

        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Reject values the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let capture = &self.infra.capture;
        if capture.save_workers == 0 {
            return Err(ConfigError::Invalid {
                field: "capture.save_workers",
                message: "must be at least 1".to_string(),
            });
        }
        if capture.save_queue == 0 {
            return Err(ConfigError::Invalid {
                field: "capture.save_queue",
                message: "must be at least 1".to_string(),
            });
        }
        if capture.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "capture.poll_timeout_ms",
                message: "must be at least 1".to_string(),
            });
        }
        if !(1..=100).contains(&capture.jpeg_quality) {
            return Err(ConfigError::Invalid {
                field: "capture.jpeg_quality",
                message: format!("{} is outside 1..=100", capture.jpeg_quality),
            });
        }
        if capture.placeholder.is_empty() {
            return Err(ConfigError::Invalid {
                field: "capture.placeholder",
                message: "must not be empty".to_string(),
            });
        }
        if self.infra.link.identity.is_empty() {
            return Err(ConfigError::Invalid {
                field: "link.identity",
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> String {
        // Built by hand for stable ordering and comments
        let link = &self.infra.link;
        let capture = &self.infra.capture;
        let mut output = String::new();

        output.push_str("# shutterbug configuration\n\n");

        output.push_str("[link]\n");
        output.push_str(&format!("coordinator = \"{}\"\n", link.coordinator));
        output.push_str(&format!("connect_timeout_ms = {}\n", link.connect_timeout_ms));
        output.push_str(&format!("framing = \"{}\"\n", link.framing.as_str()));
        output.push_str(&format!("lenient_ack = {}\n", link.lenient_ack));
        output.push_str(&format!("reply_timestamps = {}\n", link.reply_timestamps));
        output.push_str(&format!("identity = \"{}\"\n", link.identity));

        output.push_str("\n[capture]\n");
        output.push_str(&format!(
            "dataset_root = \"{}\"\n",
            capture.dataset_root.display()
        ));
        output.push_str(&format!("poll_timeout_ms = {}\n", capture.poll_timeout_ms));
        output.push_str(&format!("save_workers = {}\n", capture.save_workers));
        output.push_str(&format!("save_queue = {}\n", capture.save_queue));
        output.push_str(&format!("overflow = \"{}\"\n", capture.overflow.as_str()));
        output.push_str(&format!("placeholder = \"{}\"\n", capture.placeholder));
        output.push_str(&format!("jpeg_quality = {}\n", capture.jpeg_quality));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "log_level = \"{}\"\n",
            self.infra.telemetry.log_level
        ));

        output.push_str("\n[bootstrap]\n");
        output.push_str(&format!("role = \"{}\"\n", self.bootstrap.role));
        output.push_str(&format!("align_mode = \"{}\"\n", self.bootstrap.align_mode));
        output.push_str(&format!("enable_sync = {}\n", self.bootstrap.enable_sync));
        output.push_str(&format!("synthetic_fps = {}\n", self.bootstrap.synthetic_fps));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ShutterConfig::default();
        assert_eq!(config.infra.link.coordinator, "192.168.5.2:51000");
        assert_eq!(config.infra.capture.poll_timeout_ms, 100);
        assert_eq!(config.bootstrap.role, "TX");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_to_toml_parses_back() {
        let mut config = ShutterConfig::default();
        config.infra.link.framing = Framing::Line;
        config.infra.capture.save_workers = 3;
        config.bootstrap.role = "RX".to_string();

        let rendered = config.to_toml();
        assert!(rendered.contains("[link]"));
        assert!(rendered.contains("[bootstrap]"));

        let reparsed = loader::parse_toml(&rendered, Path::new("rendered.toml")).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[capture]\nsave_workers = 6\n[bootstrap]\nrole = \"RX\"").unwrap();

        let (config, sources) = ShutterConfig::load_with_sources_from(Some(file.path())).unwrap();
        assert_eq!(config.infra.capture.save_workers, 6);
        assert!(sources.files.iter().any(|p| p == file.path()));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = ShutterConfig::default();
        config.infra.capture.save_workers = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "capture.save_workers", .. }));
    }

    #[test]
    fn test_jpeg_quality_bounds() {
        let mut config = ShutterConfig::default();
        config.infra.capture.jpeg_quality = 0;
        assert!(config.validate().is_err());
        config.infra.capture.jpeg_quality = 100;
        assert!(config.validate().is_ok());
    }
}
