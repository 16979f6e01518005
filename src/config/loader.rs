//! Configuration loading from disk and environment.
//!
//! Precedence: command line > environment (`RS_*`) > file. The command-line
//! overlay is applied by the binary; this module handles file + environment.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::config::schema::ServerConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Env(String),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Env(e) => write!(f, "Environment error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Parse the TOML file (defaults when `path` is None) and overlay `RS_*`
/// environment variables, without validating. The binary applies its
/// command-line overlay on top before validation.
pub fn read_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
            toml::from_str(&content).map_err(ConfigError::Parse)?
        }
        None => ServerConfig::default(),
    };

    apply_env(&mut config)?;
    Ok(config)
}

/// Load a complete configuration: file + environment, validated.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let config = read_config(path)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Overlay `RS_*` environment variables onto a parsed configuration.
pub fn apply_env(config: &mut ServerConfig) -> Result<(), ConfigError> {
    set(&mut config.server.server_id, "RS_SERVER_ID")?;
    set(&mut config.server.verbosity, "RS_VERBOSITY")?;
    set_bool(&mut config.server.resolve_hosts, "RS_RESOLVE_HOSTS")?;
    set(&mut config.server.max_clients, "RS_MAX_CLIENTS")?;
    set(&mut config.server.max_clients_per_ip, "RS_MAX_CLIENTS_PER_IP")?;
    set(&mut config.server.client_timeout_secs, "RS_CLIENT_TIMEOUT")?;
    set(&mut config.server.time_win_limit, "RS_TIME_WIN_LIMIT")?;

    set_opt(&mut config.ring.dir, "RS_RING_DIR")?;
    set(&mut config.ring.size, "RS_RING_SIZE")?;
    set(&mut config.ring.pkt_size, "RS_PKT_SIZE")?;
    set_bool(&mut config.ring.memory_map, "RS_MEMORY_MAP_RING")?;
    set_bool(&mut config.ring.volatile, "RS_VOLATILE_RING")?;
    set(&mut config.ring.auto_recovery, "RS_AUTO_RECOVERY")?;

    set_list(&mut config.access.match_ips, "RS_MATCH_IPS")?;
    set_list(&mut config.access.reject_ips, "RS_REJECT_IPS")?;
    set_list(&mut config.access.write_ips, "RS_WRITE_IPS")?;
    set_list(&mut config.access.trusted_ips, "RS_TRUSTED_IPS")?;

    set_opt(&mut config.tls.cert_file, "RS_TLS_CERT_FILE")?;
    set_opt(&mut config.tls.key_file, "RS_TLS_KEY_FILE")?;
    set_bool(&mut config.tls.verify_client_cert, "RS_TLS_VERIFY_CLIENT_CERT")?;

    set_opt(&mut config.web.root, "RS_WEB_ROOT")?;
    if let Some(headers) = var("RS_HTTP_HEADERS")? {
        config.web.http_headers = headers.split('|').map(str::to_string).collect();
    }

    set_opt(&mut config.archive.dir, "RS_ARCHIVE_DIR")?;
    set(&mut config.archive.idle_timeout_secs, "RS_ARCHIVE_IDLE_TIMEOUT")?;

    set_opt(&mut config.transfer_log.dir, "RS_TLOG_DIR")?;
    set_opt(&mut config.transfer_log.prefix, "RS_TLOG_PREFIX")?;
    set(&mut config.transfer_log.interval_hours, "RS_TLOG_INTERVAL_HOURS")?;
    set_bool(&mut config.transfer_log.tx_log, "RS_TLOG_TX")?;
    set_bool(&mut config.transfer_log.rx_log, "RS_TLOG_RX")?;

    // Comma-separated list of ports, each becoming a default endpoint
    if let Some(ports) = var("RS_LISTEN")? {
        config.listen = ports
            .split(',')
            .map(|p| crate::config::schema::ListenConfig {
                port: p.trim().to_string(),
                ..Default::default()
            })
            .collect();
    }

    // A single scanner job can come from the environment; it replaces any
    // configured scanners
    if let Some(dir) = var("RS_SCAN_DIR")? {
        let mut scan = crate::config::schema::ScanConfig {
            dir,
            ..Default::default()
        };
        set_opt(&mut scan.state_file, "RS_SCAN_STATE_FILE")?;
        set_opt(&mut scan.match_pattern, "RS_SCAN_MATCH")?;
        set_opt(&mut scan.reject_pattern, "RS_SCAN_REJECT")?;
        set_bool(&mut scan.init_current_state, "RS_SCAN_INIT_CURRENT_STATE")?;
        config.scan = vec![scan];
    }

    set(&mut config.observability.log_level, "RS_LOG_LEVEL")?;
    set_bool(&mut config.observability.metrics_enabled, "RS_METRICS_ENABLED")?;
    set(&mut config.observability.metrics_address, "RS_METRICS_ADDRESS")?;

    Ok(())
}

fn var(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(v) => Ok(Some(v)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::Env(format!("{}: {}", key, e))),
    }
}

fn set<T: FromStr>(field: &mut T, key: &str) -> Result<(), ConfigError> {
    if let Some(v) = var(key)? {
        *field = v
            .parse()
            .map_err(|_| ConfigError::Env(format!("{}: cannot parse '{}'", key, v)))?;
    }
    Ok(())
}

fn set_opt(field: &mut Option<String>, key: &str) -> Result<(), ConfigError> {
    if let Some(v) = var(key)? {
        *field = if v.is_empty() { None } else { Some(v) };
    }
    Ok(())
}

fn set_bool(field: &mut bool, key: &str) -> Result<(), ConfigError> {
    if let Some(v) = var(key)? {
        *field = match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                return Err(ConfigError::Env(format!(
                    "{}: cannot parse '{}' as boolean",
                    key, v
                )))
            }
        };
    }
    Ok(())
}

fn set_list(field: &mut Vec<String>, key: &str) -> Result<(), ConfigError> {
    if let Some(v) = var(key)? {
        *field = v.split(',').map(|s| s.trim().to_string()).collect();
    }
    Ok(())
}
