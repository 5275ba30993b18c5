// crates/drudge-rpc/src/router.rs
//
// Protocol router for the HTTP listener.
//
// HTTP/2 requests with a gRPC content type go straight to the RPC service;
// everything else is REST: CORS handling, HTTP tracing, the gateway routes
// under the base path, `/metrics`, `/metrics/list` and `/openapi`.
//
// CORS reflects any origin.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::{from_fn, from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use drudge_core::DrudgeError;
use drudge_telemetry::MetricRegistry;
use http::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_METHOD, CONTENT_TYPE, ORIGIN,
};
use http::{Method, StatusCode, Version};
use http_body::Body as HttpBody;
use tonic::codegen::BoxFuture;
use tower::util::BoxCloneService;
use tower::{Layer, ServiceExt};
use tower_http::services::ServeDir;
use tracing::Instrument;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::dial::LoopbackClient;
use crate::gateway::{gateway_routes, not_found};
use crate::server::RpcService;
use crate::service::ServiceDefinition;
use crate::stream::StreamForwarder;

pub const METRICS_PATH: &str = "/metrics";
pub const METRICS_LIST_PATH: &str = "/metrics/list";
pub const DOCS_PATH: &str = "/openapi";

const PREFLIGHT_HEADERS: &str = "Content-Type,Accept";
const PREFLIGHT_METHODS: &str = "GET,HEAD,POST,PUT,DELETE";

/// The REST side of the router, with its middleware applied.
pub type RestService = BoxCloneService<Request, Response, Infallible>;

/// True when a request must be served by the RPC engine.
pub fn is_rpc_request<B>(request: &http::Request<B>) -> bool {
    request.version() == Version::HTTP_2
        && request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(is_grpc_content_type)
}

fn is_grpc_content_type(content_type: &str) -> bool {
    match content_type.strip_prefix("application/grpc") {
        Some(rest) => rest.is_empty() || rest.starts_with('+') || rest.starts_with(';'),
        None => false,
    }
}

// ---- protocol router ----

/// Dispatches each request to the RPC service or the REST stack.
#[derive(Clone)]
pub struct ProtocolRouter {
    rpc: RpcService,
    rest: RestService,
}

impl std::fmt::Debug for ProtocolRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRouter")
            .field("rpc", &self.rpc)
            .finish_non_exhaustive()
    }
}

impl ProtocolRouter {
    pub fn new(rpc: RpcService, rest: RestService) -> Self {
        Self { rpc, rest }
    }
}

impl<B> tower_service::Service<http::Request<B>> for ProtocolRouter
where
    B: HttpBody<Data = bytes::Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        if is_rpc_request(&request) {
            let rpc = self.rpc.clone();
            Box::pin(async move {
                let response = rpc.oneshot(request).await?;
                Ok(response.map(Body::new))
            })
        } else {
            let rest = self.rest.clone();
            Box::pin(async move { rest.oneshot(request.map(Body::new)).await })
        }
    }
}

// ---- REST stack ----

/// Settings for the REST side of the HTTP listener.
#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_path: String,
    pub registry: Arc<MetricRegistry>,
    pub docs_dir: Option<PathBuf>,
    pub service_name: String,
}

/// `base_path` without its trailing slash; empty for the root.
pub fn normalize_base_path(base_path: &str) -> Result<String, DrudgeError> {
    let trimmed = base_path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    if !trimmed.starts_with('/') || trimmed.contains(['*', ':', '{', '}']) {
        return Err(DrudgeError::Config(format!("invalid base path '{base_path}'")));
    }
    Ok(trimmed.to_string())
}

fn is_reserved_path(path: &str) -> bool {
    path == METRICS_PATH
        || path == METRICS_LIST_PATH
        || path == DOCS_PATH
        || path.starts_with("/openapi/")
}

/// Build the REST service: gateway routes under the base path, metrics,
/// docs and a JSON 404 fallback, behind CORS and HTTP tracing.
pub fn rest_service(
    config: &RestConfig,
    service: &ServiceDefinition,
    client: &LoopbackClient,
    forwarder: &StreamForwarder,
) -> Result<RestService, DrudgeError> {
    let base = normalize_base_path(&config.base_path)?;
    if is_reserved_path(&base) {
        return Err(DrudgeError::Config(format!(
            "base path '{}' collides with a built-in route",
            config.base_path
        )));
    }
    for entry in service.methods() {
        let Some(rule) = entry.descriptor().rule() else {
            continue;
        };
        let path = format!("{base}{}", rule.router_path()?);
        if is_reserved_path(&path) {
            return Err(DrudgeError::Config(format!(
                "route {} {} of {} collides with a built-in route",
                rule.method(),
                path,
                entry.descriptor().path()
            )));
        }
    }

    let gateway = gateway_routes(service, client, forwarder)?;
    let mut router = Router::new()
        .route(METRICS_PATH, get(metrics_text))
        .route(METRICS_LIST_PATH, get(metrics_list))
        .with_state(Arc::clone(&config.registry));
    router = if base.is_empty() {
        router.merge(gateway)
    } else {
        router.nest(&base, gateway)
    };
    if let Some(dir) = &config.docs_dir {
        router = router.nest_service(DOCS_PATH, ServeDir::new(dir));
    }
    router = router.fallback(not_found);

    Ok(with_http_middleware(router, &config.service_name))
}

/// Wrap `router` with CORS and, outermost, HTTP tracing.
pub fn with_http_middleware(router: Router, service_name: &str) -> RestService {
    let service_name: Arc<str> = Arc::from(service_name);
    let with_cors = from_fn(cors).layer(router);
    BoxCloneService::new(from_fn_with_state(service_name, http_trace).layer(with_cors))
}

async fn cors(request: Request, next: Next) -> Response {
    let Some(origin) = request
        .headers()
        .get(ORIGIN)
        .filter(|origin| !origin.is_empty())
        .cloned()
    else {
        return next.run(request).await;
    };

    let preflight = request.method() == Method::OPTIONS
        && request
            .headers()
            .get(ACCESS_CONTROL_REQUEST_METHOD)
            .is_some_and(|method| !method.is_empty());
    if preflight {
        tracing::info!(path = %request.uri().path(), "Preflight request");
        let mut response = Response::new(Body::empty());
        let headers = response.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(PREFLIGHT_HEADERS),
        );
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(PREFLIGHT_METHODS),
        );
        return response;
    }

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    response
}

async fn http_trace(State(service_name): State<Arc<str>>, request: Request, next: Next) -> Response {
    let path = request.uri().path();
    if path == METRICS_PATH || path == METRICS_LIST_PATH {
        return next.run(request).await;
    }

    let span = tracing::info_span!(
        "drudge.http",
        otel.kind = "server",
        otel.name = %format!("{} {}", request.method(), path),
        http.method = %request.method(),
        http.target = %path,
        drudge.server = %service_name,
        http.status_code = tracing::field::Empty,
    );
    span.set_parent(drudge_telemetry::extract_from_headers(request.headers()));

    let response = next.run(request).instrument(span.clone()).await;
    span.record("http.status_code", response.status().as_u16());
    response
}

async fn metrics_text(State(registry): State<Arc<MetricRegistry>>) -> Response {
    match registry.gather_text() {
        Ok(text) => (
            [(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"))],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

async fn metrics_list(State(registry): State<Arc<MetricRegistry>>) -> Response {
    Json(registry.list()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use drudge_telemetry::MetricDescriptor;

    fn request(method: Method, uri: &str) -> http::request::Builder {
        http::Request::builder().method(method).uri(uri)
    }

    fn plain_rest() -> RestService {
        let registry = Arc::new(MetricRegistry::new());
        registry
            .register_counter(MetricDescriptor::new("jobs_total", "Jobs run"))
            .unwrap();
        let router = Router::new()
            .route("/v1/ping", get(|| async { "pong" }))
            .route(METRICS_LIST_PATH, get(metrics_list))
            .with_state(registry)
            .fallback(not_found);
        with_http_middleware(router, "test")
    }

    #[test]
    fn test_rpc_detection() {
        let grpc = request(Method::POST, "/pkg.Svc/Call")
            .version(Version::HTTP_2)
            .header(CONTENT_TYPE, "application/grpc+json")
            .body(())
            .unwrap();
        assert!(is_rpc_request(&grpc));

        let http1 = request(Method::POST, "/pkg.Svc/Call")
            .version(Version::HTTP_11)
            .header(CONTENT_TYPE, "application/grpc")
            .body(())
            .unwrap();
        assert!(!is_rpc_request(&http1));

        let json = request(Method::POST, "/v1/items")
            .version(Version::HTTP_2)
            .header(CONTENT_TYPE, "application/json")
            .body(())
            .unwrap();
        assert!(!is_rpc_request(&json));

        assert!(is_grpc_content_type("application/grpc"));
        assert!(is_grpc_content_type("application/grpc;charset=utf-8"));
        assert!(!is_grpc_content_type("application/grpc-web"));
    }

    #[tokio::test]
    async fn test_preflight_short_circuits() {
        let req = request(Method::OPTIONS, "/v1/ping")
            .header(ORIGIN, "https://app.example")
            .header(ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let response = plain_rest().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example");
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_HEADERS], "Content-Type,Accept");
        let methods = headers[ACCESS_CONTROL_ALLOW_METHODS].to_str().unwrap();
        for method in ["GET", "HEAD", "POST", "PUT", "DELETE"] {
            assert!(methods.split(',').any(|m| m == method));
        }
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_simple_request_gets_allow_origin() {
        let req = request(Method::GET, "/v1/ping")
            .header(ORIGIN, "https://app.example")
            .body(Body::empty())
            .unwrap();
        let response = plain_rest().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example");

        let req = request(Method::GET, "/v1/ping").body(Body::empty()).unwrap();
        let response = plain_rest().oneshot(req).await.unwrap();
        assert!(response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[tokio::test]
    async fn test_unknown_path_is_json_not_found() {
        let req = request(Method::GET, "/v1/missing").body(Body::empty()).unwrap();
        let response = plain_rest().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"]["grpc_code"], 5);
        assert_eq!(body["error"]["http_code"], 404);
    }

    #[tokio::test]
    async fn test_metrics_list_lists_registrations() {
        let req = request(Method::GET, METRICS_LIST_PATH).body(Body::empty()).unwrap();
        let response = plain_rest().oneshot(req).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["jobs_total"]["description"], "Jobs run");
    }

    #[test]
    fn test_base_path_normalization() {
        assert_eq!(normalize_base_path("/").unwrap(), "");
        assert_eq!(normalize_base_path("").unwrap(), "");
        assert_eq!(normalize_base_path("/api/").unwrap(), "/api");
        assert!(normalize_base_path("api").is_err());
        assert!(normalize_base_path("/api/:v").is_err());
        assert!(is_reserved_path("/metrics"));
        assert!(is_reserved_path("/openapi/index.html"));
        assert!(!is_reserved_path("/v1/metrics"));
    }
}
