// crates/drudge-rpc/src/config.rs
//
// Options for `run`: listen addresses, TLS material, the service, caller
// interceptors and the ambient pieces (metric registry, lifecycle observer,
// forward-response hooks).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use drudge_core::{DrudgeError, Endpoint};
use drudge_telemetry::MetricRegistry;
use tokio_rustls::rustls::ServerConfig;

use crate::dial::ClientTls;
use crate::interceptor::{StreamInterceptor, UnaryInterceptor};
use crate::lifecycle::LifecycleObserver;
use crate::router::normalize_base_path;
use crate::service::ServiceDefinition;
use crate::stream::{ForwardResponseHook, StreamMode};

pub const DEFAULT_BASE_PATH: &str = "/";
pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_RPC_ADDR: &str = "127.0.0.1:8081";
pub const DEFAULT_SERVICE_NAME: &str = "drudge";
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// TLS material. Each side is optional and independent.
#[derive(Clone, Default)]
pub struct TransportCredentials {
    /// Terminates TLS on the RPC listener.
    pub rpc_server: Option<Arc<ServerConfig>>,
    /// Terminates TLS on the HTTP listener.
    pub http_server: Option<Arc<ServerConfig>>,
    /// Used by the loopback client; required when `rpc_server` is set.
    pub loopback_client: Option<ClientTls>,
}

impl std::fmt::Debug for TransportCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportCredentials")
            .field("rpc_server", &self.rpc_server.is_some())
            .field("http_server", &self.http_server.is_some())
            .field("loopback_client", &self.loopback_client)
            .finish()
    }
}

/// Everything `run` needs.
#[derive(Clone)]
pub struct Options {
    /// Path prefix for the gateway routes.
    pub base_path: String,
    /// HTTP listen address (`host:port`).
    pub addr: String,
    pub rpc: Endpoint,
    pub credentials: TransportCredentials,
    pub service: Option<ServiceDefinition>,
    /// Caller interceptors; they run before the built-in ones.
    pub unary_interceptors: Vec<Arc<dyn UnaryInterceptor>>,
    pub stream_interceptors: Vec<Arc<dyn StreamInterceptor>>,
    /// Directory served under `/openapi/`.
    pub docs_dir: Option<PathBuf>,
    /// Names the server in spans and logs.
    pub service_name: String,
    pub stream_mode: StreamMode,
    /// Upper bound on graceful shutdown of each listener.
    pub shutdown_grace: Duration,
    pub response_hooks: Vec<Arc<dyn ForwardResponseHook>>,
    pub observer: Option<Arc<dyn LifecycleObserver>>,
    pub registry: Arc<MetricRegistry>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            base_path: DEFAULT_BASE_PATH.to_string(),
            addr: DEFAULT_HTTP_ADDR.to_string(),
            rpc: Endpoint::tcp(DEFAULT_RPC_ADDR),
            credentials: TransportCredentials::default(),
            service: None,
            unary_interceptors: Vec::new(),
            stream_interceptors: Vec::new(),
            docs_dir: None,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            stream_mode: StreamMode::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            response_hooks: Vec::new(),
            observer: None,
            registry: Arc::new(MetricRegistry::new()),
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("base_path", &self.base_path)
            .field("addr", &self.addr)
            .field("rpc", &self.rpc)
            .field("credentials", &self.credentials)
            .field("service", &self.service)
            .field("unary_interceptors", &self.unary_interceptors.len())
            .field("stream_interceptors", &self.stream_interceptors.len())
            .field("docs_dir", &self.docs_dir)
            .field("service_name", &self.service_name)
            .field("stream_mode", &self.stream_mode)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("response_hooks", &self.response_hooks.len())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl Options {
    pub fn new(service: ServiceDefinition) -> Self {
        Self {
            service: Some(service),
            ..Self::default()
        }
    }

    pub fn with_service(mut self, service: ServiceDefinition) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_unary_interceptor(mut self, interceptor: Arc<dyn UnaryInterceptor>) -> Self {
        self.unary_interceptors.push(interceptor);
        self
    }

    pub fn with_stream_interceptor(mut self, interceptor: Arc<dyn StreamInterceptor>) -> Self {
        self.stream_interceptors.push(interceptor);
        self
    }

    pub fn with_response_hook(mut self, hook: Arc<dyn ForwardResponseHook>) -> Self {
        self.response_hooks.push(hook);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Check everything that can be checked before opening a socket.
    pub fn validate(&self) -> Result<(), DrudgeError> {
        if self.service.is_none() {
            return Err(DrudgeError::Config(
                "no service registered; a service definition is required".to_string(),
            ));
        }
        normalize_base_path(&self.base_path)?;
        if self.addr.is_empty() {
            return Err(DrudgeError::Config("HTTP listen address is empty".to_string()));
        }
        if self.rpc.address().is_empty() {
            return Err(DrudgeError::Config("RPC listen address is empty".to_string()));
        }
        if self.service_name.is_empty() {
            return Err(DrudgeError::Config("service name is empty".to_string()));
        }
        if self.credentials.rpc_server.is_some() && self.credentials.loopback_client.is_none() {
            return Err(DrudgeError::Config(
                "RPC listener uses TLS but no loopback client TLS config was given".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ServiceDefinition {
        ServiceDefinition::builder("test.Empty").build().unwrap()
    }

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.base_path, "/");
        assert_eq!(options.addr, "127.0.0.1:8080");
        assert_eq!(options.rpc, Endpoint::tcp("127.0.0.1:8081"));
        assert_eq!(options.service_name, "drudge");
        assert_eq!(options.stream_mode, StreamMode::Buffered);
        assert_eq!(options.shutdown_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_missing_service_is_config_error() {
        let err = Options::default().validate().unwrap_err();
        assert!(err.is_config());
        assert!(Options::new(service()).validate().is_ok());
    }

    #[test]
    fn test_bad_base_path_rejected() {
        let mut options = Options::new(service());
        options.base_path = "api".to_string();
        assert!(options.validate().unwrap_err().is_config());
    }
}
