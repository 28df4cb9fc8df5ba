//! Service settings read from the environment

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::forwarding::{ForwarderCommand, SupervisorConfig, DEFAULT_MAX_STOPPED_RULES};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("Invalid listen address {host}:{port}")]
    ListenAddr { host: String, port: u16 },
}

impl ConfigError {
    fn invalid(var: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            var,
            reason: reason.into(),
        }
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub allow_origins: Vec<String>,
    pub debug: bool,
    pub log_level: String,
    /// `None` disables the file sink
    pub log_file: Option<PathBuf>,
    pub forwarder: ForwarderCommand,
    pub startup_probe: Duration,
    pub stop_grace: Duration,
    pub sample_timeout: Duration,
    pub max_stopped_rules: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            allow_origins: vec!["http://localhost:5173".into()],
            debug: false,
            log_level: "info".into(),
            log_file: Some(PathBuf::from("logs/portmapping.log")),
            forwarder: ForwarderCommand::default(),
            startup_probe: Duration::from_millis(200),
            stop_grace: Duration::from_millis(3000),
            sample_timeout: Duration::from_millis(2000),
            max_stopped_rules: DEFAULT_MAX_STOPPED_RULES,
        }
    }
}

impl ServiceConfig {
    /// Read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("HOST") {
            config.host = host.trim().to_string();
        }
        if let Some(port) = lookup("PORT") {
            config.port = parse_number("PORT", &port)?;
        }
        if let Some(origins) = lookup("ALLOW_ORIGINS") {
            config.allow_origins = parse_list("ALLOW_ORIGINS", &origins)?;
        }
        if let Some(debug) = lookup("DEBUG") {
            config.debug = parse_bool("DEBUG", &debug)?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level.trim().to_lowercase();
        }
        if let Some(file) = lookup("LOG_FILE") {
            let file = file.trim();
            config.log_file = (!file.is_empty()).then(|| PathBuf::from(file));
        }
        if let Some(program) = lookup("SOCAT_PATH") {
            let program = program.trim();
            if program.is_empty() {
                return Err(ConfigError::invalid("SOCAT_PATH", "must not be empty"));
            }
            config.forwarder.program = program.to_string();
        }
        if let Some(args) = lookup("FORWARDER_ARGS") {
            config.forwarder.args = serde_json::from_str(&args)
                .map_err(|e| ConfigError::invalid("FORWARDER_ARGS", e.to_string()))?;
        }
        if let Some(ms) = lookup("STARTUP_PROBE_MS") {
            config.startup_probe = Duration::from_millis(parse_number("STARTUP_PROBE_MS", &ms)?);
        }
        if let Some(ms) = lookup("STOP_GRACE_MS") {
            config.stop_grace = Duration::from_millis(parse_number("STOP_GRACE_MS", &ms)?);
        }
        if let Some(ms) = lookup("SAMPLE_TIMEOUT_MS") {
            config.sample_timeout = Duration::from_millis(parse_number("SAMPLE_TIMEOUT_MS", &ms)?);
        }
        if let Some(max) = lookup("MAX_STOPPED_RULES") {
            config.max_stopped_rules = parse_number("MAX_STOPPED_RULES", &max)?;
        }

        Ok(config)
    }

    /// Effective log filter directive
    pub fn log_directive(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        format!("{}:{}", host, self.port)
            .parse()
            .or_else(|_| format!("[{}]:{}", host, self.port).parse())
            .map_err(|_| ConfigError::ListenAddr {
                host: self.host.clone(),
                port: self.port,
            })
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            command: self.forwarder.clone(),
            startup_probe: self.startup_probe,
            stop_grace: self.stop_grace,
        }
    }
}

fn parse_number<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(var, format!("{:?}: {}", value, e)))
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::invalid(var, format!("{:?} is not a boolean", other))),
    }
}

/// `["a", "b"]` or `a,b`
fn parse_list(var: &'static str, value: &str) -> Result<Vec<String>, ConfigError> {
    let value = value.trim();
    if value.starts_with('[') {
        return serde_json::from_str(value).map_err(|e| ConfigError::invalid(var, e.to_string()));
    }
    Ok(value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8000);
        assert_eq!(config.allow_origins, vec!["http://localhost:5173"]);
        assert_eq!(config.log_file, Some(PathBuf::from("logs/portmapping.log")));
        assert_eq!(config.forwarder.program, "socat");
        assert_eq!(config.stop_grace, Duration::from_secs(3));
        assert_eq!(config.max_stopped_rules, 256);
        assert_eq!(config.log_directive(), "info");
    }

    #[test]
    fn test_allow_origins_json_and_comma_list() {
        let config =
            config_from(&[("ALLOW_ORIGINS", r#"["http://a.test", "http://b.test"]"#)]).unwrap();
        assert_eq!(config.allow_origins, vec!["http://a.test", "http://b.test"]);

        let config = config_from(&[("ALLOW_ORIGINS", "http://a.test, http://b.test,")]).unwrap();
        assert_eq!(config.allow_origins, vec!["http://a.test", "http://b.test"]);

        assert!(config_from(&[("ALLOW_ORIGINS", "[not json")]).is_err());
    }

    #[test]
    fn test_invalid_values_name_the_variable() {
        let err = config_from(&[("PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("PORT"));

        let err = config_from(&[("STOP_GRACE_MS", "-1")]).unwrap_err();
        assert!(err.to_string().contains("STOP_GRACE_MS"));

        let err = config_from(&[("DEBUG", "maybe")]).unwrap_err();
        assert!(err.to_string().contains("DEBUG"));
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "9000"),
            ("DEBUG", "true"),
            ("LOG_FILE", ""),
            ("SOCAT_PATH", "/usr/local/bin/socat"),
            ("FORWARDER_ARGS", r#"["-d", "TCP-LISTEN:{local_port}"]"#),
            ("MAX_STOPPED_RULES", "8"),
        ])
        .unwrap();

        assert_eq!(config.listen_addr().unwrap().to_string(), "127.0.0.1:9000");
        assert_eq!(config.log_directive(), "debug");
        assert_eq!(config.log_file, None);
        assert_eq!(config.supervisor().command.program, "/usr/local/bin/socat");
        assert_eq!(config.forwarder.args, vec!["-d", "TCP-LISTEN:{local_port}"]);
        assert_eq!(config.max_stopped_rules, 8);
    }

    #[test]
    fn test_ipv6_listen_addr() {
        let config = config_from(&[("HOST", "::1")]).unwrap();
        assert_eq!(config.listen_addr().unwrap().to_string(), "[::1]:8000");

        let config = config_from(&[("HOST", "localhost")]).unwrap();
        assert!(config.listen_addr().is_err());
    }
}
