// crates/drudge-daemon/src/config.rs
//
// Runtime configuration for the Drudge daemon.
// Loaded from a TOML file or populated with defaults; CLI flags override
// individual values afterwards.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use drudge_core::{DrudgeError, Endpoint};
use drudge_rpc::StreamMode;
use drudge_telemetry::TelemetryConfig;
use serde::Deserialize;

/// Failure to load the config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Runtime configuration for the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// HTTP listen address serving REST and RPC traffic.
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// Transport of the internal RPC listener: "tcp" or "unix".
    #[serde(default = "default_rpc_transport")]
    pub rpc_transport: String,

    /// Address (or socket path) of the internal RPC listener.
    #[serde(default = "default_rpc_address")]
    pub rpc_address: String,

    /// Prefix for the REST routes.
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Directory of API documents served under /openapi/.
    #[serde(default)]
    pub docs_dir: Option<String>,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// "buffered" or "incremental".
    #[serde(default)]
    pub stream_mode: StreamMode,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_http_addr() -> String {
    drudge_rpc::config::DEFAULT_HTTP_ADDR.to_string()
}

fn default_rpc_transport() -> String {
    "tcp".to_string()
}

fn default_rpc_address() -> String {
    drudge_rpc::config::DEFAULT_RPC_ADDR.to_string()
}

fn default_base_path() -> String {
    drudge_rpc::config::DEFAULT_BASE_PATH.to_string()
}

fn default_service_name() -> String {
    drudge_rpc::config::DEFAULT_SERVICE_NAME.to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    drudge_rpc::config::DEFAULT_SHUTDOWN_GRACE.as_secs()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            rpc_transport: default_rpc_transport(),
            rpc_address: default_rpc_address(),
            base_path: default_base_path(),
            docs_dir: None,
            service_name: default_service_name(),
            stream_mode: StreamMode::default(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file at the given path.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &contents)
    }

    /// Load `path`, or `None` when the file does not exist. A file that
    /// exists but cannot be read or parsed is still an error.
    pub fn load_optional(path: &str) -> Result<Option<Self>, ConfigError> {
        match Self::load(path) {
            Ok(config) => Ok(Some(config)),
            Err(ConfigError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn parse(path: &str, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// The internal RPC endpoint. An unknown transport is a config error.
    pub fn rpc_endpoint(&self) -> Result<Endpoint, DrudgeError> {
        Endpoint::parse(&self.rpc_transport, expand_tilde(&self.rpc_address))
    }

    pub fn docs_path(&self) -> Option<PathBuf> {
        self.docs_dir.as_deref().map(|dir| PathBuf::from(expand_tilde(dir)))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use drudge_core::TransportKind;
    use drudge_telemetry::{LogFormat, TraceExporter};

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = DaemonConfig::parse("empty.toml", "").unwrap();
        assert_eq!(config.http_addr, "127.0.0.1:8080");
        assert_eq!(config.rpc_address, "127.0.0.1:8081");
        assert_eq!(config.base_path, "/");
        assert_eq!(config.stream_mode, StreamMode::Buffered);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(10));
        assert_eq!(config.telemetry, TelemetryConfig::default());
    }

    #[test]
    fn test_full_file() {
        let config = DaemonConfig::parse(
            "drudge.toml",
            r#"
                http_addr = "0.0.0.0:9000"
                rpc_transport = "unix"
                rpc_address = "/tmp/drudge.sock"
                base_path = "/api"
                stream_mode = "incremental"
                shutdown_grace_secs = 3

                [telemetry]
                format = "json"
                tracing = { kind = "open_telemetry", sample_ratio = 0.5 }
            "#,
        )
        .unwrap();
        assert_eq!(config.http_addr, "0.0.0.0:9000");
        assert_eq!(config.base_path, "/api");
        assert_eq!(config.stream_mode, StreamMode::Incremental);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(3));
        assert_eq!(config.telemetry.format, LogFormat::Json);
        assert_eq!(config.telemetry.filter, "info");
        assert_eq!(
            config.telemetry.tracing,
            TraceExporter::OpenTelemetry { sample_ratio: 0.5 }
        );

        let endpoint = config.rpc_endpoint().unwrap();
        assert_eq!(endpoint.transport(), TransportKind::Unix);
        assert_eq!(endpoint.address(), "/tmp/drudge.sock");
    }

    #[test]
    fn test_unknown_transport_is_config_error() {
        let config = DaemonConfig {
            rpc_transport: "udp".to_string(),
            ..DaemonConfig::default()
        };
        assert!(config.rpc_endpoint().unwrap_err().is_config());
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = DaemonConfig::parse("bad.toml", "http_addr = ").unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_missing_file() {
        let err = DaemonConfig::load("/nonexistent/drudge.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_missing_file_is_optional() {
        assert!(DaemonConfig::load_optional("/nonexistent/drudge.toml")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_malformed_file_is_not_optional() {
        let path = std::env::temp_dir().join(format!("drudge-bad-{}.toml", std::process::id()));
        fs::write(&path, "http_addr = [").unwrap();
        let result = DaemonConfig::load_optional(&path.display().to_string());
        fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_unreadable_path_is_not_optional() {
        // A directory exists but cannot be read as a file.
        let dir = std::env::temp_dir();
        let result = DaemonConfig::load_optional(&dir.display().to_string());
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_expand_tilde_leaves_plain_paths() {
        assert_eq!(expand_tilde("/var/run/x.sock"), "/var/run/x.sock");
        assert_eq!(expand_tilde("relative/path"), "relative/path");
    }
}
