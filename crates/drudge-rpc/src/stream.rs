// crates/drudge-rpc/src/stream.rs
//
// Streaming response forwarder: turns a server-streaming RPC into one HTTP
// response whose body is a JSON array of `{"result": ...}` chunks, ending
// with at most one `{"error": ...}` chunk.
//
// Buffered mode collects the whole stream before answering, so the status
// line always reflects a terminal error. Incremental mode waits for the
// first stream event to choose the status, then writes each chunk as its own
// body frame; a later error can only be reported in-band.

use std::sync::Arc;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use drudge_core::StreamChunk;
use futures::{Stream, StreamExt};
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

/// Frames buffered between the pump task and the HTTP body.
const INCREMENTAL_BUFFER: usize = 16;

/// How a server-streaming response is written to the REST client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    #[default]
    Buffered,
    Incremental,
}

/// Caller hook run while forwarding a response to a REST client.
///
/// `on_headers` runs once before the first message is read and may add
/// response headers. `on_message` runs for every message. An error from
/// either ends the response with an error chunk.
pub trait ForwardResponseHook: Send + Sync {
    fn on_headers(&self, _headers: &mut HeaderMap) -> Result<(), Status> {
        Ok(())
    }

    fn on_message(&self, _message: &Value) -> Result<(), Status> {
        Ok(())
    }
}

type Hooks = Arc<[Arc<dyn ForwardResponseHook>]>;

fn run_message_hooks(hooks: &Hooks, message: &Value) -> Result<(), Status> {
    for hook in hooks.iter() {
        if let Err(status) = hook.on_message(message) {
            tracing::info!(code = ?status.code(), error = %status.message(), "Forward response hook failed");
            return Err(status);
        }
    }
    Ok(())
}

pub(crate) fn json_content_type() -> HeaderValue {
    HeaderValue::from_static("application/json")
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to marshal response chunk");
        br#"{"error":{"grpc_code":13,"http_code":500,"message":"failed to marshal response","http_status":"Internal Server Error","details":[]}}"#.to_vec()
    })
}

fn json_response(status: StatusCode, headers: HeaderMap, body: impl Into<Body>) -> Response {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Writes server-streaming RPC results as REST responses.
#[derive(Clone)]
pub struct StreamForwarder {
    mode: StreamMode,
    hooks: Hooks,
}

impl std::fmt::Debug for StreamForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamForwarder")
            .field("mode", &self.mode)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl Default for StreamForwarder {
    fn default() -> Self {
        Self::new(StreamMode::default(), Vec::new())
    }
}

impl StreamForwarder {
    pub fn new(mode: StreamMode, hooks: Vec<Arc<dyn ForwardResponseHook>>) -> Self {
        Self {
            mode,
            hooks: hooks.into(),
        }
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub(crate) fn header_hooks(&self, headers: &mut HeaderMap) -> Result<(), Status> {
        for hook in self.hooks.iter() {
            if let Err(status) = hook.on_headers(headers) {
                tracing::info!(code = ?status.code(), error = %status.message(), "Forward response hook failed");
                return Err(status);
            }
        }
        Ok(())
    }

    pub(crate) fn message_hooks(&self, message: &Value) -> Result<(), Status> {
        run_message_hooks(&self.hooks, message)
    }

    /// Forward `stream` with `headers` (already derived from the call's
    /// response metadata).
    pub async fn forward<S>(&self, mut headers: HeaderMap, stream: S) -> Response
    where
        S: Stream<Item = Result<Value, Status>> + Send + Unpin + 'static,
    {
        headers.insert(CONTENT_TYPE, json_content_type());
        if let Err(status) = self.header_hooks(&mut headers) {
            return error_only(headers, &status);
        }
        match self.mode {
            StreamMode::Buffered => self.forward_buffered(headers, stream).await,
            StreamMode::Incremental => self.forward_incremental(headers, stream).await,
        }
    }

    async fn forward_buffered<S>(&self, headers: HeaderMap, mut stream: S) -> Response
    where
        S: Stream<Item = Result<Value, Status>> + Unpin,
    {
        let mut chunks = Vec::new();
        let mut status = StatusCode::OK;

        while let Some(item) = stream.next().await {
            let failure = match item {
                Ok(message) => match self.message_hooks(&message) {
                    Ok(()) => {
                        chunks.push(StreamChunk::Result(message));
                        continue;
                    }
                    Err(status) => status,
                },
                Err(status) => status,
            };
            let chunk = StreamChunk::from_status(&failure);
            if let StreamChunk::Error(envelope) = &chunk {
                status = envelope.http_status();
            }
            chunks.push(chunk);
            break;
        }

        if chunks.is_empty() {
            let chunk = StreamChunk::empty_response();
            if let StreamChunk::Error(envelope) = &chunk {
                status = envelope.http_status();
            }
            chunks.push(chunk);
        }

        json_response(status, headers, encode(&chunks))
    }

    async fn forward_incremental<S>(&self, headers: HeaderMap, mut stream: S) -> Response
    where
        S: Stream<Item = Result<Value, Status>> + Send + Unpin + 'static,
    {
        // The status line waits for the first event.
        let first = match stream.next().await {
            None => return error_only(headers, &empty_status()),
            Some(Err(status)) => return error_only(headers, &status),
            Some(Ok(message)) => message,
        };
        if let Err(status) = self.message_hooks(&first) {
            return error_only(headers, &status);
        }

        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(INCREMENTAL_BUFFER);
        let hooks = Arc::clone(&self.hooks);
        tokio::spawn(async move {
            let mut frame = b"[".to_vec();
            frame.extend(encode(&StreamChunk::Result(first)));
            if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                tracing::info!("Failed to send response: client went away");
                return;
            }

            while let Some(item) = stream.next().await {
                let (chunk, last) = match item {
                    Ok(message) => match run_message_hooks(&hooks, &message) {
                        Ok(()) => (StreamChunk::Result(message), false),
                        Err(status) => (StreamChunk::from_status(&status), true),
                    },
                    Err(status) => (StreamChunk::from_status(&status), true),
                };
                let mut frame = b",".to_vec();
                frame.extend(encode(&chunk));
                if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                    tracing::info!("Failed to send response: client went away");
                    return;
                }
                if last {
                    break;
                }
            }

            if tx.send(Ok(Bytes::from_static(b"]"))).await.is_err() {
                tracing::info!("Failed to send response: client went away");
            }
        });

        json_response(
            StatusCode::OK,
            headers,
            Body::from_stream(ReceiverStream::new(rx)),
        )
    }
}

fn empty_status() -> Status {
    Status::unknown("empty response")
}

/// A complete response holding a single error chunk.
fn error_only(headers: HeaderMap, status: &Status) -> Response {
    let chunk = StreamChunk::from_status(status);
    let code = match &chunk {
        StreamChunk::Error(envelope) => envelope.http_status(),
        StreamChunk::Result(_) => StatusCode::OK,
    };
    json_response(code, headers, encode(&[chunk]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::json;

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn messages(items: Vec<Result<Value, Status>>) -> impl Stream<Item = Result<Value, Status>> + Send + Unpin + 'static {
        stream::iter(items)
    }

    struct RejectNegative;

    impl ForwardResponseHook for RejectNegative {
        fn on_headers(&self, headers: &mut HeaderMap) -> Result<(), Status> {
            headers.insert("x-hooked", HeaderValue::from_static("yes"));
            Ok(())
        }

        fn on_message(&self, message: &Value) -> Result<(), Status> {
            match message["n"].as_i64() {
                Some(n) if n < 0 => Err(Status::out_of_range("negative")),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_clean_stream_wraps_every_message() {
        for mode in [StreamMode::Buffered, StreamMode::Incremental] {
            let forwarder = StreamForwarder::new(mode, Vec::new());
            let response = forwarder
                .forward(
                    HeaderMap::new(),
                    messages(vec![Ok(json!({"n": 1})), Ok(json!({"n": 2})), Ok(json!({"n": 3}))]),
                )
                .await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
            assert_eq!(
                body_json(response).await,
                json!([{"result": {"n": 1}}, {"result": {"n": 2}}, {"result": {"n": 3}}])
            );
        }
    }

    #[tokio::test]
    async fn test_error_chunk_is_last() {
        for mode in [StreamMode::Buffered, StreamMode::Incremental] {
            let forwarder = StreamForwarder::new(mode, Vec::new());
            let response = forwarder
                .forward(
                    HeaderMap::new(),
                    messages(vec![
                        Ok(json!({"n": 1})),
                        Err(Status::not_found("gone")),
                        Ok(json!({"n": 2})),
                    ]),
                )
                .await;
            let expected_status = match mode {
                StreamMode::Buffered => StatusCode::NOT_FOUND,
                StreamMode::Incremental => StatusCode::OK,
            };
            assert_eq!(response.status(), expected_status);
            let body = body_json(response).await;
            let chunks = body.as_array().unwrap();
            assert_eq!(chunks.len(), 2);
            assert_eq!(chunks[0], json!({"result": {"n": 1}}));
            assert_eq!(chunks[1]["error"]["grpc_code"], 5);
            assert_eq!(chunks[1]["error"]["http_code"], 404);
            assert_eq!(chunks[1]["error"]["message"], "gone");
            assert_eq!(chunks[1]["error"]["http_status"], "Not Found");
        }
    }

    #[tokio::test]
    async fn test_empty_stream_reports_empty_response() {
        for mode in [StreamMode::Buffered, StreamMode::Incremental] {
            let forwarder = StreamForwarder::new(mode, Vec::new());
            let response = forwarder.forward(HeaderMap::new(), messages(Vec::new())).await;
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            let body = body_json(response).await;
            assert_eq!(body.as_array().unwrap().len(), 1);
            assert_eq!(body[0]["error"]["message"], "empty response");
            assert_eq!(body[0]["error"]["grpc_code"], 2);
        }
    }

    #[tokio::test]
    async fn test_incremental_first_event_error_sets_status() {
        let forwarder = StreamForwarder::new(StreamMode::Incremental, Vec::new());
        let response = forwarder
            .forward(HeaderMap::new(), messages(vec![Err(Status::permission_denied("no"))]))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body[0]["error"]["http_code"], 403);
    }

    #[tokio::test]
    async fn test_hooks_add_headers_and_stop_stream() {
        let hooks: Vec<Arc<dyn ForwardResponseHook>> = vec![Arc::new(RejectNegative)];
        let forwarder = StreamForwarder::new(StreamMode::Buffered, hooks);
        let response = forwarder
            .forward(
                HeaderMap::new(),
                messages(vec![Ok(json!({"n": 1})), Ok(json!({"n": -1})), Ok(json!({"n": 2}))]),
            )
            .await;
        assert_eq!(response.headers()["x-hooked"], "yes");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body.as_array().unwrap().len(), 2);
        assert_eq!(body[1]["error"]["grpc_code"], 11);
    }
}
