//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use echoroute_core::protocol_constants::{DEFAULT_RTP_PORT, DEFAULT_SCREAM_PORT};

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP port for Scream ingress.
    /// Override: `ECHOROUTE_SCREAM_PORT`
    pub scream_port: u16,

    /// UDP port for RTP ingress.
    /// Override: `ECHOROUTE_RTP_PORT`
    pub rtp_port: u16,

    /// Path to the desired-state YAML applied at startup.
    /// Override: `ECHOROUTE_STATE_FILE`
    pub state_file: Option<PathBuf>,

    /// Re-read and re-apply the state file on this interval (seconds).
    /// Unset disables watching; the reconciler makes re-applies of an
    /// unchanged file free.
    pub watch_interval_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            scream_port: DEFAULT_SCREAM_PORT,
            rtp_port: DEFAULT_RTP_PORT,
            state_file: None,
            watch_interval_secs: None,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("ECHOROUTE_SCREAM_PORT") {
            if let Ok(port) = val.parse() {
                self.scream_port = port;
            }
        }

        if let Ok(val) = std::env::var("ECHOROUTE_RTP_PORT") {
            if let Ok(port) = val.parse() {
                self.rtp_port = port;
            }
        }

        if let Ok(val) = std::env::var("ECHOROUTE_STATE_FILE") {
            if !val.is_empty() {
                self.state_file = Some(PathBuf::from(val));
            }
        }
    }

    /// Converts to echoroute-core's engine configuration.
    pub fn to_engine_config(&self) -> echoroute_core::EngineConfig {
        echoroute_core::EngineConfig {
            scream_port: self.scream_port,
            rtp_port: self.rtp_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_use_standard_ports() {
        let config = ServerConfig::default();
        assert_eq!(config.scream_port, 16401);
        assert_eq!(config.rtp_port, 40000);
        assert!(config.state_file.is_none());
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "scream_port: 17000\nstate_file: /tmp/state.yaml").unwrap();

        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.scream_port, 17000);
        assert_eq!(config.rtp_port, 40000, "unset field keeps its default");
        assert_eq!(
            config.state_file.as_deref(),
            Some(Path::new("/tmp/state.yaml"))
        );
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "scream_port: [not a port]").unwrap();
        assert!(ServerConfig::load(Some(file.path())).is_err());
    }
}
