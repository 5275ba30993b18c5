// crates/drudge-rpc/src/gateway.rs
//
// REST-to-RPC translation gateway.
//
// Every method with an HTTP rule gets an axum route. The handler builds the
// request message from the JSON body, query string and path captures,
// forwards selected headers as RPC metadata, calls the method over the
// loopback client, and writes the response (or an error envelope) as JSON.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, Request};
use axum::response::Response;
use axum::routing::{MethodFilter, MethodRouter};
use axum::Router;
use drudge_core::{
    parse_grpc_timeout, BodyRule, DrudgeError, ErrorBody, HttpRule, MethodDescriptor, MethodKind,
};
use http::header::{HeaderName, CONTENT_TYPE, HOST};
use http::{HeaderMap, StatusCode};
use serde_json::{Map, Value};
use tonic::metadata::MetadataMap;
use tonic::Status;

use crate::dial::LoopbackClient;
use crate::service::ServiceDefinition;
use crate::stream::{json_content_type, StreamForwarder};

/// Largest JSON body accepted by a gateway route.
pub const MAX_REQUEST_BODY: usize = 4 * 1024 * 1024;

/// Prefix for metadata carried in HTTP headers, both directions.
pub const METADATA_HEADER_PREFIX: &str = "grpc-metadata-";

/// Headers forwarded to the RPC call unchanged.
const FORWARDED_HEADERS: &[&str] = &["authorization", "traceparent", "tracestate", "x-request-id"];

// ---- routes ----

struct GatewayRoute {
    descriptor: Arc<MethodDescriptor>,
    rule: HttpRule,
    client: LoopbackClient,
    forwarder: StreamForwarder,
}

/// Build the REST routes for every method of `service` that has an HTTP
/// rule. Routes are rooted at `/`; the caller nests them under the base path.
pub fn gateway_routes(
    service: &ServiceDefinition,
    client: &LoopbackClient,
    forwarder: &StreamForwarder,
) -> Result<Router, DrudgeError> {
    let mut by_path: BTreeMap<String, MethodRouter> = BTreeMap::new();
    let mut shapes: HashMap<String, String> = HashMap::new();
    let mut bound: Vec<(String, http::Method)> = Vec::new();

    for entry in service.methods() {
        let descriptor = entry.descriptor();
        let Some(rule) = descriptor.rule() else {
            continue;
        };
        let invalid = |reason: String| DrudgeError::InvalidRoute {
            template: rule.template().to_string(),
            reason,
        };

        let path = rule.router_path()?;
        let method = rule.method().clone();
        if bound.iter().any(|(p, m)| *p == path && *m == method) {
            return Err(invalid(format!("{method} {path} is bound by more than one method")));
        }
        // Captures at the same position must share a name.
        let shape = route_shape(&path);
        match shapes.get(&shape) {
            Some(existing) if *existing != path => {
                return Err(invalid(format!("conflicts with route {existing}")));
            }
            _ => {
                shapes.insert(shape, path.clone());
            }
        }
        let filter = MethodFilter::try_from(method.clone()).map_err(|e| invalid(e.to_string()))?;
        bound.push((path.clone(), method));

        let route = Arc::new(GatewayRoute {
            descriptor: Arc::clone(descriptor),
            rule: rule.clone(),
            client: client.clone(),
            forwarder: forwarder.clone(),
        });
        let handler = move |params: Option<Path<HashMap<String, String>>>,
                            Query(query): Query<Vec<(String, String)>>,
                            request: Request| {
            let route = Arc::clone(&route);
            async move {
                let params = params.map(|Path(params)| params).unwrap_or_default();
                route.handle(params, query, request).await
            }
        };

        tracing::debug!(
            method = %rule.method(),
            path = %path,
            rpc = %descriptor.path(),
            "Registered gateway route"
        );
        let method_router = by_path.remove(&path).unwrap_or_else(MethodRouter::new);
        by_path.insert(path, method_router.on(filter, handler));
    }

    Ok(by_path
        .into_iter()
        .fold(Router::new(), |router, (path, method_router)| {
            router.route(&path, method_router)
        }))
}

fn route_shape(path: &str) -> String {
    path.split('/')
        .map(|segment| if segment.starts_with(':') { ":" } else { segment })
        .collect::<Vec<_>>()
        .join("/")
}

impl GatewayRoute {
    async fn handle(
        &self,
        params: HashMap<String, String>,
        query: Vec<(String, String)>,
        request: Request,
    ) -> Response {
        let (parts, body) = request.into_parts();

        let body = match self.rule.body() {
            BodyRule::All => match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    return error_response(&Status::invalid_argument(format!(
                        "failed to read request body: {e}"
                    )))
                }
            },
            BodyRule::None => None,
        };

        let message = match build_message(body.as_deref(), &query, &params) {
            Ok(message) => message,
            Err(status) => return error_response(&status),
        };

        let (metadata, timeout) = forwarded_metadata(&parts.headers);
        let mut rpc_request = tonic::Request::new(message);
        *rpc_request.metadata_mut() = metadata;
        if let Some(timeout) = timeout {
            rpc_request.set_timeout(timeout);
        }

        let path = self.descriptor.path();
        tracing::debug!(http.method = %parts.method, http.path = %parts.uri.path(), rpc = %path, "Gateway call");

        match self.descriptor.kind() {
            MethodKind::Unary => match self.client.unary(&path, rpc_request).await {
                Ok(response) => self.unary_response(response),
                Err(status) => error_response(&status),
            },
            MethodKind::ServerStreaming => {
                match self.client.server_streaming(&path, rpc_request).await {
                    Ok(response) => {
                        let headers = response_headers(response.metadata());
                        self.forwarder.forward(headers, response.into_inner()).await
                    }
                    Err(status) => error_response(&status),
                }
            }
        }
    }

    fn unary_response(&self, response: tonic::Response<Value>) -> Response {
        let (metadata, message, _) = response.into_parts();
        let mut headers = response_headers(&metadata);
        headers.insert(CONTENT_TYPE, json_content_type());

        let hooked = self
            .forwarder
            .header_hooks(&mut headers)
            .and_then(|()| self.forwarder.message_hooks(&message));
        if let Err(status) = hooked {
            return error_response(&status);
        }

        match serde_json::to_vec(&message) {
            Ok(body) => {
                let mut response = Response::new(Body::from(body));
                *response.headers_mut() = headers;
                response
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to marshal response");
                error_response(&Status::internal("failed to marshal response"))
            }
        }
    }
}

// ---- request message ----

/// Merge body, query and path values into the request message.
///
/// Query parameters only apply when the rule binds no body. Path values
/// override anything set before them.
pub fn build_message(
    body: Option<&[u8]>,
    query: &[(String, String)],
    params: &HashMap<String, String>,
) -> Result<Value, Status> {
    let mut message = match body {
        Some(bytes) if !bytes.is_empty() => serde_json::from_slice::<Value>(bytes)
            .map_err(|e| Status::invalid_argument(format!("invalid JSON body: {e}")))?,
        _ => Value::Object(Map::new()),
    };

    if body.is_none() {
        for (name, value) in query {
            set_field(&mut message, name, coerce_scalar(value), true)?;
        }
    }

    let mut names: Vec<&String> = params.keys().collect();
    names.sort();
    for name in names {
        set_field(&mut message, name, coerce_scalar(&params[name]), false)?;
    }
    Ok(message)
}

/// Numbers and booleans bind as JSON scalars; everything else as a string.
fn coerce_scalar(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Number(_) | Value::Bool(_))) => value,
        _ => Value::String(raw.to_string()),
    }
}

/// Set the dotted field `name` in `message`. With `append`, a second value
/// for the same field turns it into an array.
fn set_field(message: &mut Value, name: &str, value: Value, append: bool) -> Result<(), Status> {
    let mut current = message;
    let mut segments = name.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segment.is_empty() {
            return Err(Status::invalid_argument(format!("invalid field name '{name}'")));
        }
        let Value::Object(object) = current else {
            return Err(Status::invalid_argument(format!(
                "field '{name}' conflicts with a non-object value"
            )));
        };
        if segments.peek().is_none() {
            match object.get_mut(segment) {
                Some(Value::Array(items)) if append => items.push(value),
                Some(existing) if append => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                _ => {
                    object.insert(segment.to_string(), value);
                }
            }
            return Ok(());
        }
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Ok(())
}

// ---- headers ----

/// Metadata and deadline derived from inbound HTTP headers.
pub fn forwarded_metadata(headers: &HeaderMap) -> (MetadataMap, Option<std::time::Duration>) {
    let mut forwarded = HeaderMap::new();
    let mut timeout = None;

    for (name, value) in headers {
        let name_str = name.as_str();
        if FORWARDED_HEADERS.contains(&name_str) {
            forwarded.append(name.clone(), value.clone());
        } else if let Some(key) = name_str.strip_prefix(METADATA_HEADER_PREFIX) {
            match HeaderName::from_bytes(key.as_bytes()) {
                Ok(key) if !key.as_str().is_empty() => {
                    forwarded.append(key, value.clone());
                }
                _ => tracing::debug!(header = %name_str, "Dropping malformed metadata header"),
            }
        } else if name == HOST {
            forwarded.append(HeaderName::from_static("x-forwarded-host"), value.clone());
        } else if name_str == drudge_core::context::GRPC_TIMEOUT_HEADER {
            timeout = value.to_str().ok().and_then(parse_grpc_timeout);
        }
    }

    (MetadataMap::from_headers(forwarded), timeout)
}

fn is_reserved_response_header(name: &str) -> bool {
    name.starts_with("grpc-")
        || matches!(
            name,
            "content-type" | "date" | "te" | "trailer" | "content-length" | "transfer-encoding"
        )
}

/// HTTP headers for RPC response metadata: each key `k` becomes
/// `Grpc-Metadata-k`. Protocol headers are not forwarded.
pub fn response_headers(metadata: &MetadataMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in metadata.clone().into_headers().iter() {
        if is_reserved_response_header(name.as_str()) {
            continue;
        }
        let prefixed = format!("{METADATA_HEADER_PREFIX}{}", name.as_str());
        match HeaderName::from_bytes(prefixed.as_bytes()) {
            Ok(prefixed) => {
                headers.append(prefixed, value.clone());
            }
            Err(e) => tracing::debug!(header = %name, error = %e, "Dropping response metadata"),
        }
    }
    headers
}

/// A complete JSON error response for `status`, `{"error": {...}}`.
pub fn error_response(status: &Status) -> Response {
    let body = ErrorBody::from(status);
    let code = body.error.http_status();
    let mut headers = response_headers(status.metadata());
    headers.insert(CONTENT_TYPE, json_content_type());

    let bytes = serde_json::to_vec(&body).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to marshal error envelope");
        Vec::new()
    });
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = code;
    *response.headers_mut() = headers;
    response
}

/// Error envelope for REST paths that match no route.
pub async fn not_found() -> Response {
    error_response(&Status::not_found(
        StatusCode::NOT_FOUND
            .canonical_reason()
            .unwrap_or("Not Found"),
    ))
}
