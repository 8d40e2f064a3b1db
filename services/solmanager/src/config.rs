//! Gateway configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/solmanager/solmanager.toml`.
//!
//! The keys are flat, matching the names the rest of the deployment uses
//! (`managerconnectionmode`, `solmanager_tcpport_solserver`, ...).
//!
//! # Required fields
//! - `solmanager_token` (control-API auth)
//! - `solserver_host`, `solserver_token` (upstream publish)
//!
//! Everything else has a default.  TLS for the control API is enabled
//! when BOTH `solmanager_certificate` and `solmanager_private_key` are
//! set; otherwise the listener is plain TCP (test deployments).

use serde::Deserialize;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// How the gateway reaches the Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Serial,
    JsonServer,
}

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub manager: ManagerConfig,
    pub control: ControlConfig,
    pub solserver: SolserverConfig,
    pub periods: Periods,
    pub files: FilesConfig,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub mode: ConnectionMode,
    /// Serial device of the Manager API port (serial mode).
    pub serialport: String,
    /// Peer host accepting raw commands (jsonserver mode).
    pub jsonserver_host: String,
    /// Inbound notification listener port (jsonserver mode).
    pub jsonserver_port: u16,
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub port: u16,
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub token: String,
}

impl ControlConfig {
    /// TLS material, when both halves are configured.
    pub fn tls_pair(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.certificate, &self.private_key) {
            (Some(c), Some(k)) => Some((c.clone(), k.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SolserverConfig {
    pub host: String,
    pub token: String,
}

/// Cadences, in minutes.
#[derive(Debug, Clone, Copy)]
pub struct Periods {
    pub pubfile_min: u64,
    pub pubserver_min: u64,
    pub snapshot_min: u64,
    pub stats_min: u64,
    /// Accepted for compatibility; the gateway has no pull-commands loop.
    pub pollcmds_min: u64,
}

#[derive(Debug, Clone)]
pub struct FilesConfig {
    pub backup: PathBuf,
    pub stats: PathBuf,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    serialport: Option<String>,
    managerconnectionmode: Option<String>,
    jsonserver_host: Option<String>,
    solmanager_tcpport_jsonserver: Option<u16>,
    solmanager_tcpport_solserver: Option<u16>,
    solmanager_certificate: Option<String>,
    solmanager_private_key: Option<String>,
    solmanager_token: Option<String>,
    solserver_host: Option<String>,
    solserver_token: Option<String>,
    period_pubfile_min: Option<u64>,
    period_pubserver_min: Option<u64>,
    period_snapshot_min: Option<u64>,
    period_stats_min: Option<u64>,
    period_pollcmds_min: Option<u64>,
    backupfile: Option<String>,
    statsfile: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from the default path `/etc/solmanager/solmanager.toml`.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from_path(Path::new("/etc/solmanager/solmanager.toml"))
}

/// Load config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let mode = match raw.managerconnectionmode.as_deref() {
        None | Some("serial") => ConnectionMode::Serial,
        Some("jsonserver") => ConnectionMode::JsonServer,
        Some(other) => {
            return Err(ConfigError::InvalidValue(format!(
                "managerconnectionmode must be 'serial' or 'jsonserver', got '{}'",
                other
            )));
        }
    };

    let token = raw
        .solmanager_token
        .ok_or_else(|| ConfigError::MissingField("solmanager_token".to_owned()))?;
    if token.is_empty() {
        return Err(ConfigError::InvalidValue(
            "solmanager_token must not be empty".to_owned(),
        ));
    }
    let solserver_host = raw
        .solserver_host
        .ok_or_else(|| ConfigError::MissingField("solserver_host".to_owned()))?;
    let solserver_token = raw
        .solserver_token
        .ok_or_else(|| ConfigError::MissingField("solserver_token".to_owned()))?;

    let periods = Periods {
        pubfile_min: nonzero("period_pubfile_min", raw.period_pubfile_min.unwrap_or(1))?,
        pubserver_min: nonzero("period_pubserver_min", raw.period_pubserver_min.unwrap_or(1))?,
        snapshot_min: nonzero("period_snapshot_min", raw.period_snapshot_min.unwrap_or(60))?,
        stats_min: nonzero("period_stats_min", raw.period_stats_min.unwrap_or(60))?,
        pollcmds_min: raw.period_pollcmds_min.unwrap_or(10),
    };

    Ok(Config {
        manager: ManagerConfig {
            mode,
            serialport: raw.serialport.unwrap_or_else(|| "/dev/ttyUSB3".to_owned()),
            jsonserver_host: raw
                .jsonserver_host
                .unwrap_or_else(|| "127.0.0.1:8080".to_owned()),
            jsonserver_port: raw.solmanager_tcpport_jsonserver.unwrap_or(8081),
        },
        control: ControlConfig {
            port: raw.solmanager_tcpport_solserver.unwrap_or(8082),
            certificate: raw.solmanager_certificate.map(PathBuf::from),
            private_key: raw.solmanager_private_key.map(PathBuf::from),
            token,
        },
        solserver: SolserverConfig {
            host: solserver_host,
            token: solserver_token,
        },
        periods,
        files: FilesConfig {
            backup: PathBuf::from(
                raw.backupfile
                    .unwrap_or_else(|| "/var/lib/solmanager/solmanager.backup".to_owned()),
            ),
            stats: PathBuf::from(
                raw.statsfile
                    .unwrap_or_else(|| "/var/lib/solmanager/solmanager.stats".to_owned()),
            ),
        },
    })
}

fn nonzero(key: &str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "{} must be >= 1 minute",
            key
        )));
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
