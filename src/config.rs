//! Client configuration file parser.
//!
//! Flat `key = value` format, `#` starts a comment line.  Unknown keys are
//! ignored so one file can be shared between client versions.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CamError, Result};

// Defaults
const HOST:             &str = "192.168.42.1";
const PORT:             u16  = 80;
const HTTP_TIMEOUT:     u64  = 10;
const POLL_INTERVAL_MS: u64  = 500;
const COMMAND_TIMEOUT:  u64  = 60;
const LIST_PAGE_SIZE:   u32  = 50;
const STALL_TIMEOUT:    u64  = 30;
const TAIL_PERCENT:     u8   = 97;

/// Which camera collaborator the client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// Open Spherical Camera HTTP API over the camera's WiFi.
    Osc,
    /// Camera storage mounted as a local directory (USB mass storage).
    Storage,
}

impl Default for BackendType {
    fn default() -> Self { BackendType::Osc }
}

/// Full client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // ── Backend ───────────────────────────────────────────────────────────────
    pub backend: BackendType,
    /// OSC camera host (the camera's own access point address by default).
    pub camera_host: String,
    pub camera_port: u16,
    /// Per-request timeout for OSC commands, in seconds.
    pub http_timeout: u64,
    /// Interval between `/osc/commands/status` polls.
    pub poll_interval_ms: u64,
    /// Give up on an `inProgress` OSC command after this many seconds.
    pub command_timeout: u64,
    pub list_page_size: u32,
    /// Mount point of the camera storage for [`BackendType::Storage`].
    pub storage_root: PathBuf,
    // ── Transfers ─────────────────────────────────────────────────────────────
    pub download_dir: PathBuf,
    /// Seconds without progress before a stall warning.
    pub stall_timeout: u64,
    /// Near-completion threshold (percent) above which every byte change is shown.
    pub tail_percent: u8,
    // ── Process ───────────────────────────────────────────────────────────────
    pub log_syslog: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend:          BackendType::Osc,
            camera_host:      HOST.to_string(),
            camera_port:      PORT,
            http_timeout:     HTTP_TIMEOUT,
            poll_interval_ms: POLL_INTERVAL_MS,
            command_timeout:  COMMAND_TIMEOUT,
            list_page_size:   LIST_PAGE_SIZE,
            storage_root:     PathBuf::new(),
            download_dir:     PathBuf::from("./"),
            stall_timeout:    STALL_TIMEOUT,
            tail_percent:     TAIL_PERCENT,
            log_syslog:       false,
        }
    }
}

impl ClientConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout)
    }
}

fn parse_bool(val: &str) -> bool {
    val == "true" || val == "1" || val == "yes"
}

/// Parse the text of a `camctl.conf` file on top of the defaults.
pub fn parse_config(content: &str) -> ClientConfig {
    let mut cfg = ClientConfig::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, '=');
        let key = match parts.next() {
            Some(k) => k.trim().to_ascii_lowercase(),
            None => continue,
        };
        let val = match parts.next() {
            Some(v) => v.trim().to_string(),
            None => continue,
        };
        if val.is_empty() {
            continue;
        }

        match key.as_str() {
            "camera_host"      => cfg.camera_host      = val,
            "camera_port"      => cfg.camera_port      = val.parse().unwrap_or(PORT),
            "http_timeout"     => cfg.http_timeout     = val.parse().unwrap_or(HTTP_TIMEOUT),
            "poll_interval_ms" => cfg.poll_interval_ms = val.parse().unwrap_or(POLL_INTERVAL_MS),
            "command_timeout"  => cfg.command_timeout  = val.parse().unwrap_or(COMMAND_TIMEOUT),
            "list_page_size"   => cfg.list_page_size   = val.parse().unwrap_or(LIST_PAGE_SIZE),
            "storage_root"     => cfg.storage_root     = PathBuf::from(&val),
            "download_dir"     => cfg.download_dir     = PathBuf::from(&val),
            "stall_timeout"    => cfg.stall_timeout    = val.parse().unwrap_or(STALL_TIMEOUT),
            "tail_percent"     => cfg.tail_percent     = val.parse().unwrap_or(TAIL_PERCENT),
            "log_syslog"       => cfg.log_syslog       = parse_bool(&val),
            "backend" => {
                cfg.backend = match val.to_ascii_lowercase().as_str() {
                    "storage" | "usb" => BackendType::Storage,
                    _                 => BackendType::Osc,
                };
            }
            _ => {} // ignore unknown keys
        }
    }

    cfg
}

/// Load `path`.  When `required` is false a missing file yields the defaults.
pub fn load_config(path: &Path, required: bool) -> Result<ClientConfig> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(parse_config(&content)),
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            Ok(ClientConfig::default())
        }
        Err(e) => Err(CamError::Config(format!("cannot read {}: {e}", path.display()))),
    }
}

/// Validate that the loaded values are usable.
pub fn validate_config(cfg: &ClientConfig) -> Result<()> {
    if cfg.tail_percent == 0 || cfg.tail_percent > 100 {
        return Err(CamError::Config(format!(
            "tail_percent must be between 1 and 100, got {}",
            cfg.tail_percent
        )));
    }
    if cfg.stall_timeout == 0 {
        return Err(CamError::Config("stall_timeout must be positive".into()));
    }
    match cfg.backend {
        BackendType::Osc => {
            if cfg.camera_host.is_empty() {
                return Err(CamError::Config("camera_host is required for the osc backend".into()));
            }
        }
        BackendType::Storage => {
            if cfg.storage_root.as_os_str().is_empty() {
                return Err(CamError::Config(
                    "storage_root is required for the storage backend".into()
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let cfg = parse_config("");
        assert_eq!(cfg.backend, BackendType::Osc);
        assert_eq!(cfg.camera_host, "192.168.42.1");
        assert_eq!(cfg.stall_timeout, 30);
        assert_eq!(cfg.tail_percent, 97);
        assert!(validate_config(&cfg).is_ok());
    }

    #[test]
    fn parses_keys_and_skips_comments() {
        let text = "\
# camera on the bench
backend = storage
storage_root = /media/cam
STALL_TIMEOUT = 45
tail_percent=99
log_syslog = yes
mystery = 1
";
        let cfg = parse_config(text);
        assert_eq!(cfg.backend, BackendType::Storage);
        assert_eq!(cfg.storage_root, PathBuf::from("/media/cam"));
        assert_eq!(cfg.stall_timeout(), Duration::from_secs(45));
        assert_eq!(cfg.tail_percent, 99);
        assert!(cfg.log_syslog);
    }

    #[test]
    fn bad_numbers_fall_back_to_defaults() {
        let cfg = parse_config("camera_port = eighty\ntail_percent = 300");
        assert_eq!(cfg.camera_port, 80);
        assert_eq!(cfg.tail_percent, 97);
    }

    #[test]
    fn validation_rejects_out_of_range() {
        let cfg = ClientConfig { tail_percent: 0, ..ClientConfig::default() };
        assert!(validate_config(&cfg).is_err());
        let cfg = ClientConfig { stall_timeout: 0, ..ClientConfig::default() };
        assert!(validate_config(&cfg).is_err());
        let cfg = ClientConfig { backend: BackendType::Storage, ..ClientConfig::default() };
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn missing_optional_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.conf");
        assert!(load_config(&path, false).is_ok());
        assert!(load_config(&path, true).is_err());
    }
}
