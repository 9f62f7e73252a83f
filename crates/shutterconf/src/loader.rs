//! Config file discovery, loading, and environment variable overlay.

use crate::{BootstrapConfig, ConfigError, Framing, InfraConfig, OverflowPolicy, ShutterConfig};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in load order (system, user, local).
///
/// Only returns files that exist.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/shutterbug/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("shutterbug/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("shutterbug.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read one config file into a raw TOML table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_table(&contents, path)
}

fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents
        .parse::<toml::Table>()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Merge `overlay` into `base`. Nested tables merge key by key; everything
/// else in the overlay replaces what the base had.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawConfig {
    link: crate::LinkConfig,
    capture: crate::CaptureConfig,
    telemetry: crate::TelemetryConfig,
    bootstrap: BootstrapConfig,
}

/// Turn a merged table into a typed config.
pub fn from_table(table: toml::Table, origin: &Path) -> Result<ShutterConfig, ConfigError> {
    let raw: RawConfig = table.try_into().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: origin.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut infra = InfraConfig {
        link: raw.link,
        capture: raw.capture,
        telemetry: raw.telemetry,
    };
    infra.capture.dataset_root = expand_path(&infra.capture.dataset_root.to_string_lossy());

    Ok(ShutterConfig {
        infra,
        bootstrap: raw.bootstrap,
    })
}

/// Parse config from a TOML string.
pub fn parse_toml(contents: &str, path: &Path) -> Result<ShutterConfig, ConfigError> {
    from_table(parse_table(contents, path)?, path)
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut ShutterConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |key| env::var(key).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup, so tests do not
/// have to mutate the process environment.
pub fn apply_overrides_from<F>(config: &mut ShutterConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut take = |key: &str| {
        let value = lookup(key);
        if value.is_some() {
            sources.env_overrides.push(key.to_string());
        }
        value
    };

    // Link
    if let Some(v) = take("SHUTTERBUG_COORDINATOR") {
        config.infra.link.coordinator = v;
    }
    if let Some(v) = take("SHUTTERBUG_IDENTITY") {
        config.infra.link.identity = v;
    }
    if let Some(framing) = take("SHUTTERBUG_FRAMING").and_then(|v| Framing::parse(&v)) {
        config.infra.link.framing = framing;
    }

    // Capture
    if let Some(v) = take("SHUTTERBUG_DATASET_ROOT") {
        config.infra.capture.dataset_root = expand_path(&v);
    }
    if let Some(n) = take("SHUTTERBUG_SAVE_WORKERS").and_then(|v| v.parse().ok()) {
        config.infra.capture.save_workers = n;
    }
    if let Some(n) = take("SHUTTERBUG_SAVE_QUEUE").and_then(|v| v.parse().ok()) {
        config.infra.capture.save_queue = n;
    }
    if let Some(policy) = take("SHUTTERBUG_OVERFLOW").and_then(|v| OverflowPolicy::parse(&v)) {
        config.infra.capture.overflow = policy;
    }

    // Telemetry
    if let Some(v) = take("SHUTTERBUG_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
    }
    // Also support RUST_LOG
    if let Some(v) = take("RUST_LOG") {
        config.infra.telemetry.log_level = v;
    }

    // Bootstrap
    if let Some(v) = take("SHUTTERBUG_ROLE") {
        config.bootstrap.role = v;
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/test/path");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().contains("test/path"));
    }

    #[test]
    fn test_expand_path_absolute() {
        let expanded = expand_path("/absolute/path");
        assert_eq!(expanded, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_discover_puts_cli_path_last() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let files = discover_config_files_with_override(Some(file.path()));
        assert_eq!(files.last().map(PathBuf::as_path), Some(file.path()));

        let missing = Path::new("/nonexistent/shutterbug.toml");
        let files = discover_config_files_with_override(Some(missing));
        assert!(!files.iter().any(|f| f == missing));
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
[capture]
dataset_root = "/data/sets"
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.infra.capture.dataset_root, PathBuf::from("/data/sets"));
        assert_eq!(config.infra.capture.poll_timeout_ms, 100);
        assert_eq!(config.infra.link.coordinator, "192.168.5.2:51000");
        assert_eq!(config.bootstrap.role, "TX");
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
[link]
coordinator = "10.0.0.7:6000"
framing = "line"
lenient_ack = false
identity = "cam_left"

[capture]
save_workers = 2
save_queue = 32
overflow = "drop"
placeholder = "@@"
jpeg_quality = 75

[telemetry]
log_level = "debug"

[bootstrap]
role = "RX"
enable_sync = false
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();

        assert_eq!(config.infra.link.coordinator, "10.0.0.7:6000");
        assert_eq!(config.infra.link.framing, Framing::Line);
        assert!(!config.infra.link.lenient_ack);
        assert_eq!(config.infra.link.identity, "cam_left");
        assert_eq!(config.infra.capture.save_workers, 2);
        assert_eq!(config.infra.capture.save_queue, 32);
        assert_eq!(config.infra.capture.overflow, OverflowPolicy::Drop);
        assert_eq!(config.infra.capture.placeholder, "@@");
        assert_eq!(config.infra.capture.jpeg_quality, 75);
        assert_eq!(config.infra.telemetry.log_level, "debug");
        assert_eq!(config.bootstrap.role, "RX");
        assert!(!config.bootstrap.enable_sync);
    }

    #[test]
    fn test_bad_enum_value_is_parse_error() {
        let toml = r#"
[link]
framing = "length-prefixed"
"#;
        let err = parse_toml(toml, Path::new("bad.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_merge_tables_is_deep() {
        let mut base: toml::Table = r#"
[link]
coordinator = "a:1"
identity = "base"
"#
        .parse()
        .unwrap();
        let overlay: toml::Table = r#"
[link]
identity = "overlay"
"#
        .parse()
        .unwrap();

        merge_tables(&mut base, overlay);
        let config = from_table(base, Path::new("merged")).unwrap();
        assert_eq!(config.infra.link.coordinator, "a:1");
        assert_eq!(config.infra.link.identity, "overlay");
    }

    #[test]
    fn test_env_overrides_are_recorded() {
        let vars: HashMap<&str, &str> = [
            ("SHUTTERBUG_COORDINATOR", "127.0.0.1:9"),
            ("SHUTTERBUG_SAVE_WORKERS", "7"),
            ("SHUTTERBUG_OVERFLOW", "drop"),
            ("SHUTTERBUG_SAVE_QUEUE", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = ShutterConfig::default();
        let mut sources = ConfigSources::default();
        apply_overrides_from(&mut config, &mut sources, |k| {
            vars.get(k).map(|v| v.to_string())
        });

        assert_eq!(config.infra.link.coordinator, "127.0.0.1:9");
        assert_eq!(config.infra.capture.save_workers, 7);
        assert_eq!(config.infra.capture.overflow, OverflowPolicy::Drop);
        assert_eq!(config.infra.capture.save_queue, 8);
        assert!(sources.env_overrides.contains(&"SHUTTERBUG_SAVE_WORKERS".to_string()));
    }
}
