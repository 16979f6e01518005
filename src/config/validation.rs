//! Configuration validation logic.

use crate::config::schema::ServerConfig;
use crate::net::policy::IpNet;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation error: {}", self.0)
    }
}

/// Validate a ServerConfig for semantic correctness.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    // 1. The ring must live somewhere
    if config.ring.dir.is_none() && !config.ring.volatile {
        errors.push(ValidationError(
            "ring.dir is not set and ring is not volatile".to_string(),
        ));
    }
    if config.ring.pkt_size == 0 {
        errors.push(ValidationError("ring.pkt_size must be > 0".to_string()));
    } else if (config.ring.pkt_size as u64) > config.ring.size {
        errors.push(ValidationError(
            "ring.pkt_size must not exceed ring.size".to_string(),
        ));
    }
    if config.ring.auto_recovery > 2 {
        errors.push(ValidationError(
            "ring.auto_recovery must be 0, 1 or 2".to_string(),
        ));
    }

    // 2. Scalar ranges
    if !(0.0..=1.0).contains(&config.server.time_win_limit) {
        errors.push(ValidationError(
            "server.time_win_limit must be between 0.0 and 1.0".to_string(),
        ));
    }
    if config.transfer_log.dir.is_some() && config.transfer_log.interval_hours <= 0.0 {
        errors.push(ValidationError(
            "transfer_log.interval_hours must be > 0".to_string(),
        ));
    }

    // 3. TLS endpoints need a certificate and key
    let any_tls = config.listen.iter().any(|l| l.tls);
    if any_tls && (config.tls.cert_file.is_none() || config.tls.key_file.is_none()) {
        errors.push(ValidationError(
            "a TLS endpoint is configured but tls.cert_file or tls.key_file is missing"
                .to_string(),
        ));
    }

    // 4. Policy lists must parse
    for (name, list) in [
        ("access.match_ips", &config.access.match_ips),
        ("access.reject_ips", &config.access.reject_ips),
        ("access.write_ips", &config.access.write_ips),
        ("access.trusted_ips", &config.access.trusted_ips),
    ] {
        for entry in list {
            if let Err(e) = entry.parse::<IpNet>() {
                errors.push(ValidationError(format!("{} entry '{}': {}", name, entry, e)));
            }
        }
    }
    for entry in &config.access.limit_ips {
        if let Err(e) = entry.net.parse::<IpNet>() {
            errors.push(ValidationError(format!(
                "access.limit_ips entry '{}': {}",
                entry.net, e
            )));
        }
        if let Err(e) = regex::Regex::new(&entry.streams) {
            errors.push(ValidationError(format!(
                "access.limit_ips pattern '{}': {}",
                entry.streams, e
            )));
        }
    }

    // 5. Listener ports: numeric TCP port or a UNIX socket path
    for l in &config.listen {
        if l.port.is_empty() {
            errors.push(ValidationError("listen.port must not be empty".to_string()));
        } else if !l.port.contains('/') {
            match l.port.parse::<u32>() {
                Ok(p) if (1..=65535).contains(&p) => {}
                _ => errors.push(ValidationError(format!(
                    "listen.port '{}' is neither a TCP port nor a socket path",
                    l.port
                ))),
            }
        }
        for p in &l.protocols {
            if !matches!(p.as_str(), "DataLink" | "SeedLink" | "HTTP") {
                errors.push(ValidationError(format!("unknown listen protocol '{}'", p)));
            }
        }
        for f in &l.families {
            if !matches!(f.as_str(), "IPv4" | "IPv6" | "UNIX") {
                errors.push(ValidationError(format!("unknown listen family '{}'", f)));
            }
        }
    }

    // 6. Scanner jobs
    for s in &config.scan {
        if s.dir.is_empty() {
            errors.push(ValidationError("scan.dir must not be empty".to_string()));
        }
        for (name, pat) in [("match", &s.match_pattern), ("reject", &s.reject_pattern)] {
            if let Some(pat) = pat {
                if let Err(e) = regex::Regex::new(pat) {
                    errors.push(ValidationError(format!(
                        "scan.{} pattern '{}': {}",
                        name, pat, e
                    )));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
