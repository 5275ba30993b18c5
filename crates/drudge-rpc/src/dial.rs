// crates/drudge-rpc/src/dial.rs
//
// Loopback client: a tonic channel from the gateway to the RPC listener in
// the same process. The channel connects through a custom connector so the
// same code path covers TCP, Unix sockets and TLS.

use std::sync::Arc;

use drudge_core::{DrudgeError, Endpoint, TransportKind};
use futures::stream::MapErr;
use futures::TryStreamExt;
use http::uri::PathAndQuery;
use http::Uri;
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tonic::transport::Channel;
use tonic::{Request, Response, Status, Streaming};
use tracing::Instrument;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::codec::JsonCodec;
use crate::transport::Connection;

/// Messages of a loopback server-streaming call. Transport failures surface
/// as UNAVAILABLE.
pub type LoopbackStream = MapErr<Streaming<Value>, fn(Status) -> Status>;

/// TLS settings for the loopback connection.
#[derive(Clone)]
pub struct ClientTls {
    config: Arc<ClientConfig>,
    server_name: String,
}

impl ClientTls {
    /// `server_name` must match a name in the RPC listener's certificate.
    pub fn new(config: Arc<ClientConfig>, server_name: impl Into<String>) -> Self {
        Self {
            config,
            server_name: server_name.into(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }
}

impl std::fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTls")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// A connected client for the in-process RPC listener.
#[derive(Clone, Debug)]
pub struct LoopbackClient {
    channel: Channel,
    target: Endpoint,
}

impl LoopbackClient {
    /// Connect to `target`. Fails if the listener cannot be reached.
    pub async fn dial(target: &Endpoint, tls: Option<ClientTls>) -> Result<Self, DrudgeError> {
        let authority = match target.transport() {
            TransportKind::Tcp => target.dial_address(),
            TransportKind::Unix => "localhost".to_string(),
        };
        let dial_error = |reason: String| DrudgeError::Dial {
            address: target.to_string(),
            reason,
        };

        let uri = format!("http://{authority}");
        let endpoint = tonic::transport::Endpoint::from_shared(uri)
            .map_err(|e| dial_error(e.to_string()))?;

        let connect_target = target.clone();
        let connector = tls.map(|tls| (TlsConnector::from(tls.config), tls.server_name));
        let channel = endpoint
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let target = connect_target.clone();
                let connector = connector.clone();
                async move {
                    let tls = connector.as_ref().map(|(c, name)| (c, name.as_str()));
                    let conn = Connection::connect(&target, tls).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(conn))
                }
            }))
            .await
            .map_err(|e| dial_error(e.to_string()))?;

        tracing::info!(endpoint = %target, "Loopback client connected");
        Ok(Self {
            channel,
            target: target.clone(),
        })
    }

    pub fn target(&self) -> &Endpoint {
        &self.target
    }

    /// Invoke a unary method by its RPC path (`/pkg.Service/Method`).
    pub async fn unary(&self, path: &str, request: Request<Value>) -> Result<Response<Value>, Status> {
        let (request, span) = client_span(path, request);
        let path = method_path(path)?;
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        async move {
            grpc.ready()
                .await
                .map_err(|e| Status::unavailable(format!("loopback not ready: {e}")))?;
            grpc.unary(request, path, JsonCodec)
                .await
                .map_err(transport_status)
        }
        .instrument(span)
        .await
    }

    /// Invoke a server-streaming method; the returned stream yields each
    /// message and ends with the call's final status.
    pub async fn server_streaming(
        &self,
        path: &str,
        request: Request<Value>,
    ) -> Result<Response<LoopbackStream>, Status> {
        let (request, span) = client_span(path, request);
        let path = method_path(path)?;
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        async move {
            grpc.ready()
                .await
                .map_err(|e| Status::unavailable(format!("loopback not ready: {e}")))?;
            let response = grpc
                .server_streaming(request, path, JsonCodec)
                .await
                .map_err(transport_status)?;
            Ok(response.map(|stream| stream.map_err(transport_status as fn(Status) -> Status)))
        }
        .instrument(span)
        .await
    }
}

/// Open a client span under the current one and inject its context into the
/// outgoing metadata.
fn client_span(path: &str, mut request: Request<Value>) -> (Request<Value>, tracing::Span) {
    let span = tracing::info_span!("drudge.loopback", otel.kind = "client", rpc.path = %path);
    drudge_telemetry::inject_into_metadata(&span.context(), request.metadata_mut());
    (request, span)
}

/// Statuses decoded from the RPC listener's trailers carry no source; one the
/// client built from a local error does. A local error means the loopback
/// connection failed, which REST callers see as UNAVAILABLE.
pub(crate) fn transport_status(status: Status) -> Status {
    let Some(source) = std::error::Error::source(&status) else {
        return status;
    };
    tracing::warn!(code = ?status.code(), error = %source, "Loopback transport failed");
    Status::unavailable(format!("loopback transport failed: {}", status.message()))
}

fn method_path(path: &str) -> Result<PathAndQuery, Status> {
    PathAndQuery::try_from(path)
        .map_err(|e| Status::internal(format!("invalid method path '{path}': {e}")))
}
