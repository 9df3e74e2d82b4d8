use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

const DEFAULT_REST_PORT: u16 = 4300;
const DEFAULT_BRIDGE_PORT: u16 = 4301;
const DEFAULT_DISPATCH_POLL_SECS: u64 = 5;
const DEFAULT_TTL_SWEEP_SECS: u64 = 3600;
const DEFAULT_BLOB_SWEEP_SECS: u64 = 3600;

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// REST server port (default: 4300).
    rest_port: Option<u16>,
    /// Real-time bridge TCP listener port (default: 4301).
    bridge_port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,agentrelay=trace" (default: "info").
    log: Option<String>,
    /// Shared secret used to derive bridge auth tokens (§4.G).
    bridge_shared_secret: Option<String>,
    /// When true, the bridge accepts any token and the REST auth
    /// middleware grants admin to every request. Local development only.
    dev_bypass: Option<bool>,
    /// Dispatcher poll interval in seconds (default: 5).
    dispatch_poll_secs: Option<u64>,
    /// Mailbox TTL sweep interval in seconds (default: 3600).
    ttl_sweep_secs: Option<u64>,
    /// Blob expiry sweep interval in seconds (default: 3600).
    blob_sweep_secs: Option<u64>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub rest_port: u16,
    pub bridge_port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    pub bridge_shared_secret: Option<String>,
    pub dev_bypass: bool,
    pub dispatch_poll_interval: Duration,
    pub ttl_sweep_interval: Duration,
    pub blob_sweep_interval: Duration,
}

impl DaemonConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rest_port: Option<u16>,
        bridge_port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        bridge_shared_secret: Option<String>,
        dev_bypass: bool,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let rest_port = rest_port.or(toml.rest_port).unwrap_or(DEFAULT_REST_PORT);
        let bridge_port = bridge_port.or(toml.bridge_port).unwrap_or(DEFAULT_BRIDGE_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let bridge_shared_secret = bridge_shared_secret
            .or_else(|| std::env::var("AGENTRELAY_BRIDGE_SECRET").ok())
            .or(toml.bridge_shared_secret)
            .filter(|s| !s.is_empty());

        let dev_bypass = dev_bypass
            || std::env::var("AGENTRELAY_DEV_BYPASS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
            || toml.dev_bypass.unwrap_or(false);

        let dispatch_poll_interval = Duration::from_secs(
            toml.dispatch_poll_secs.unwrap_or(DEFAULT_DISPATCH_POLL_SECS),
        );
        let ttl_sweep_interval = Duration::from_secs(toml.ttl_sweep_secs.unwrap_or(DEFAULT_TTL_SWEEP_SECS));
        let blob_sweep_interval =
            Duration::from_secs(toml.blob_sweep_secs.unwrap_or(DEFAULT_BLOB_SWEEP_SECS));

        Self {
            rest_port,
            bridge_port,
            data_dir,
            log,
            bridge_shared_secret,
            dev_bypass,
            dispatch_poll_interval,
            ttl_sweep_interval,
            blob_sweep_interval,
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("agentrelay");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("agentrelay");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("agentrelay");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("agentrelay");
        }
    }
    PathBuf::from(".agentrelay")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_no_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DaemonConfig::new(None, None, Some(dir.path().to_path_buf()), None, None, false);
        assert_eq!(cfg.rest_port, DEFAULT_REST_PORT);
        assert_eq!(cfg.bridge_port, DEFAULT_BRIDGE_PORT);
        assert!(!cfg.dev_bypass);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DaemonConfig::new(
            Some(9000),
            Some(9001),
            Some(dir.path().to_path_buf()),
            Some("debug".to_string()),
            Some("secret".to_string()),
            true,
        );
        assert_eq!(cfg.rest_port, 9000);
        assert_eq!(cfg.bridge_port, 9001);
        assert_eq!(cfg.log, "debug");
        assert_eq!(cfg.bridge_shared_secret.as_deref(), Some("secret"));
        assert!(cfg.dev_bypass);
    }
}
