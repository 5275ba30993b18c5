// crates/drudge-rpc/src/server.rs
//
// RPC service: a hand-written tonic service that routes `/{service}/{method}`
// paths of a runtime `ServiceDefinition` through the interceptor chain.
//
// No proto codegen is involved. Messages are JSON documents carried in
// standard gRPC framing by `JsonCodec`; tonic's server helpers handle the
// framing, trailers and status encoding.

use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use drudge_core::{CallContext, MethodDescriptor};
use http_body::Body as HttpBody;
use serde_json::Value;
use tonic::codegen::BoxFuture;
use tonic::server::{Grpc, ServerStreamingService, UnaryService};
use tonic::Status;

use crate::codec::JsonCodec;
use crate::interceptor::{InterceptorChain, MessageStream, StreamHandler, UnaryHandler};
use crate::service::{MethodHandler, ServiceDefinition};
use crate::transport::{panic_message, FatalSlot, PeerAddr};

/// The tonic-compatible service hosting one `ServiceDefinition`.
#[derive(Clone)]
pub struct RpcService {
    service: Arc<ServiceDefinition>,
    chain: InterceptorChain,
    fatal: FatalSlot,
}

impl std::fmt::Debug for RpcService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcService")
            .field("service", &self.service.name())
            .field("chain", &self.chain)
            .finish()
    }
}

impl RpcService {
    pub fn new(service: Arc<ServiceDefinition>, chain: InterceptorChain) -> Self {
        Self {
            service,
            chain,
            fatal: FatalSlot::new(),
        }
    }

    /// Record panics raised by handler streams in `fatal`.
    pub fn with_fatal_slot(mut self, fatal: FatalSlot) -> Self {
        self.fatal = fatal;
        self
    }

    pub fn service(&self) -> &ServiceDefinition {
        &self.service
    }
}

impl<B> tower_service::Service<http::Request<B>> for RpcService
where
    B: HttpBody + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    B::Data: Send,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let service = Arc::clone(&self.service);
        let chain = self.chain.clone();
        let fatal = self.fatal.clone();

        Box::pin(async move {
            let Some(entry) = service.method(req.uri().path()).cloned() else {
                tracing::debug!(path = %req.uri().path(), "Unknown RPC method");
                return Ok(unimplemented_response());
            };

            let mut grpc = Grpc::new(JsonCodec);
            let response = match entry.handler() {
                MethodHandler::Unary(handler) => {
                    let call = UnaryCall {
                        descriptor: Arc::clone(entry.descriptor()),
                        handler: Arc::clone(handler),
                        chain,
                    };
                    grpc.unary(call, req).await
                }
                MethodHandler::ServerStreaming(handler) => {
                    let call = StreamCall {
                        descriptor: Arc::clone(entry.descriptor()),
                        handler: Arc::clone(handler),
                        chain,
                        fatal,
                    };
                    grpc.server_streaming(call, req).await
                }
            };
            Ok(response)
        })
    }
}

fn unimplemented_response() -> http::Response<tonic::body::BoxBody> {
    let mut response = http::Response::new(tonic::body::empty_body());
    let headers = response.headers_mut();
    headers.insert(
        Status::GRPC_STATUS,
        (tonic::Code::Unimplemented as i32).into(),
    );
    headers.insert(
        http::header::CONTENT_TYPE,
        tonic::metadata::GRPC_CONTENT_TYPE,
    );
    response
}

fn call_context(
    descriptor: Arc<MethodDescriptor>,
    request: tonic::Request<Value>,
) -> (CallContext, Value) {
    let peer = request.extensions().get::<PeerAddr>().map(|p| p.0.clone());
    let (metadata, _extensions, message) = request.into_parts();
    (CallContext::new(descriptor, metadata).with_peer(peer), message)
}

// ---- unary ----

struct UnaryCall {
    descriptor: Arc<MethodDescriptor>,
    handler: Arc<dyn UnaryHandler>,
    chain: InterceptorChain,
}

impl UnaryService<Value> for UnaryCall {
    type Response = Value;
    type Future = BoxFuture<tonic::Response<Value>, Status>;

    fn call(&mut self, request: tonic::Request<Value>) -> Self::Future {
        let (ctx, message) = call_context(Arc::clone(&self.descriptor), request);
        let handler = Arc::clone(&self.handler);
        let chain = self.chain.clone();

        Box::pin(async move {
            let response_metadata = ctx.response_metadata().clone();
            let _cancel_on_drop = ctx.cancellation().clone().drop_guard();
            let message = chain.call_unary(ctx, message, handler.as_ref()).await?;
            let mut response = tonic::Response::new(message);
            *response.metadata_mut() = response_metadata.take();
            Ok(response)
        })
    }
}

// ---- server streaming ----

struct StreamCall {
    descriptor: Arc<MethodDescriptor>,
    handler: Arc<dyn StreamHandler>,
    chain: InterceptorChain,
    fatal: FatalSlot,
}

impl ServerStreamingService<Value> for StreamCall {
    type Response = Value;
    type ResponseStream = GuardedStream;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: tonic::Request<Value>) -> Self::Future {
        let (ctx, message) = call_context(Arc::clone(&self.descriptor), request);
        let handler = Arc::clone(&self.handler);
        let chain = self.chain.clone();
        let method = self.descriptor.path();
        let fatal = self.fatal.clone();

        Box::pin(async move {
            let response_metadata = ctx.response_metadata().clone();
            let guard = ctx.cancellation().clone().drop_guard();
            let stream = chain.call_stream(ctx, message, handler.as_ref()).await?;
            let mut response = tonic::Response::new(GuardedStream {
                inner: stream,
                method,
                fatal,
                finished: false,
                _guard: guard,
            });
            *response.metadata_mut() = response_metadata.take();
            Ok(response)
        })
    }
}

/// Response stream that cancels the call's token when the client goes away.
///
/// A panic while polling the handler's stream ends the call with INTERNAL and
/// raises the fatal slot.
pub struct GuardedStream {
    inner: MessageStream,
    method: String,
    fatal: FatalSlot,
    finished: bool,
    _guard: tokio_util::sync::DropGuard,
}

impl futures::Stream for GuardedStream {
    type Item = Result<Value, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        let this = &mut *self;
        match std::panic::catch_unwind(AssertUnwindSafe(|| this.inner.as_mut().poll_next(cx))) {
            Ok(poll) => poll,
            Err(payload) => {
                this.finished = true;
                let message = panic_message(payload.as_ref());
                tracing::error!(method = %this.method, panic = %message, "Stream handler panicked");
                this.fatal.raise(message);
                Poll::Ready(Some(Err(Status::internal("stream handler panicked"))))
            }
        }
    }
}
