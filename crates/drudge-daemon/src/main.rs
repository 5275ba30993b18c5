// crates/drudge-daemon/src/main.rs
//
// Binary entrypoint for the Drudge daemon.
//
// Parses CLI arguments, loads configuration, installs logging/tracing,
// builds the example service and serves it over RPC and REST until Ctrl-C.

mod config;
mod example;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use config::{expand_tilde, ConfigError, DaemonConfig};
use drudge_core::DrudgeError;
use drudge_rpc::{CancellationToken, Options, StreamMode};
use drudge_telemetry::{LogFormat, MetricRegistry};

/// Drudge daemon: one HTTP port for gRPC and REST clients.
#[derive(Parser, Debug)]
#[command(name = "drudge-daemon", version = "0.1.0", about = "Drudge RPC/REST daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "~/.drudge/config.toml")]
    config: String,

    /// HTTP listen address; overrides the config file.
    #[arg(long)]
    addr: Option<String>,

    /// Internal RPC transport ("tcp" or "unix"); overrides the config file.
    #[arg(long)]
    rpc_transport: Option<String>,

    /// Internal RPC address or socket path; overrides the config file.
    #[arg(long)]
    rpc_address: Option<String>,

    /// Prefix for REST routes; overrides the config file.
    #[arg(long)]
    base_path: Option<String>,

    /// Streaming response mode: buffered or incremental.
    #[arg(long, value_parser = parse_stream_mode)]
    stream_mode: Option<StreamMode>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

fn parse_stream_mode(value: &str) -> Result<StreamMode, String> {
    match value {
        "buffered" => Ok(StreamMode::Buffered),
        "incremental" => Ok(StreamMode::Incremental),
        other => Err(format!("unknown stream mode '{other}'")),
    }
}

impl Args {
    /// CLI flags override values from the config file.
    fn apply(&self, config: &mut DaemonConfig) {
        if let Some(addr) = &self.addr {
            config.http_addr = addr.clone();
        }
        if let Some(transport) = &self.rpc_transport {
            config.rpc_transport = transport.clone();
        }
        if let Some(address) = &self.rpc_address {
            config.rpc_address = address.clone();
        }
        if let Some(base_path) = &self.base_path {
            config.base_path = base_path.clone();
        }
        if let Some(mode) = self.stream_mode {
            config.stream_mode = mode;
        }
        if self.json_logs {
            config.telemetry.format = LogFormat::Json;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // The subscriber depends on the file, so the outcome is logged after
    // installing it.
    let config_path = expand_tilde(&args.config);
    let (daemon_config, from_file) = match resolve_config(&args, &config_path) {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _telemetry = match drudge_telemetry::install(
        &daemon_config.service_name,
        &daemon_config.telemetry,
    ) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to install telemetry: {e}");
            return ExitCode::FAILURE;
        }
    };

    if from_file {
        tracing::info!("Loaded configuration from {}", config_path);
    } else {
        tracing::warn!("No config file at {}. Using defaults.", config_path);
    }

    tracing::info!("Drudge Daemon v0.1.0");
    tracing::info!("HTTP endpoint: {}", daemon_config.http_addr);
    tracing::info!(
        "RPC endpoint: {}://{}",
        daemon_config.rpc_transport,
        daemon_config.rpc_address
    );
    tracing::info!("Base path: {}", daemon_config.base_path);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl-C, shutting down"),
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        }
        ctrl_c.cancel();
    });

    match serve(&daemon_config, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(fatal = e.is_fatal(), "Daemon exited with error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// The config file at `path` with CLI overrides applied. Only a missing file
/// falls back to defaults; the flag reports whether the file was used.
fn resolve_config(args: &Args, path: &str) -> Result<(DaemonConfig, bool), ConfigError> {
    let loaded = DaemonConfig::load_optional(path)?;
    let from_file = loaded.is_some();
    let mut config = loaded.unwrap_or_default();
    args.apply(&mut config);
    Ok((config, from_file))
}

async fn serve(daemon_config: &DaemonConfig, cancel: CancellationToken) -> Result<(), DrudgeError> {
    let registry = Arc::new(MetricRegistry::new());
    let service = example::example_service(&registry)?;

    let mut options = Options::new(service);
    options.addr = daemon_config.http_addr.clone();
    options.rpc = daemon_config.rpc_endpoint()?;
    options.base_path = daemon_config.base_path.clone();
    options.docs_dir = daemon_config.docs_path();
    options.service_name = daemon_config.service_name.clone();
    options.stream_mode = daemon_config.stream_mode;
    options.shutdown_grace = daemon_config.shutdown_grace();
    options.registry = registry;

    drudge_rpc::run(options, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "drudge-daemon",
            "--addr",
            "0.0.0.0:9090",
            "--base-path",
            "/api",
            "--stream-mode",
            "incremental",
            "--json-logs",
        ]);
        let mut config = DaemonConfig::default();
        args.apply(&mut config);
        assert_eq!(config.http_addr, "0.0.0.0:9090");
        assert_eq!(config.base_path, "/api");
        assert_eq!(config.rpc_address, "127.0.0.1:8081");
        assert_eq!(config.stream_mode, StreamMode::Incremental);
        assert_eq!(config.telemetry.format, LogFormat::Json);
    }

    #[test]
    fn test_missing_config_uses_defaults_with_overrides() {
        let args = Args::parse_from(["drudge-daemon", "--addr", "0.0.0.0:9090"]);
        let (config, from_file) = resolve_config(&args, "/nonexistent/drudge.toml").unwrap();
        assert!(!from_file);
        assert_eq!(config.http_addr, "0.0.0.0:9090");
        assert_eq!(config.base_path, "/");
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let path = std::env::temp_dir().join(format!("drudge-main-{}.toml", std::process::id()));
        std::fs::write(&path, "stream_mode = \"chunked\"").unwrap();
        let args = Args::parse_from(["drudge-daemon"]);
        let result = resolve_config(&args, &path.display().to_string());
        std::fs::remove_file(&path).unwrap();
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("drudge-main-"));
    }

    #[test]
    fn test_bad_stream_mode_rejected() {
        let result = Args::try_parse_from(["drudge-daemon", "--stream-mode", "chunked"]);
        assert!(result.is_err());
    }
}
