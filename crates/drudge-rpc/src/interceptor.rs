// crates/drudge-rpc/src/interceptor.rs
//
// Interceptor chain engine.
//
// A chain is an ordered, immutable list of interceptors of one kind. Index 0
// is outermost: its pre-call logic runs first and its post-call logic runs
// last. Each interceptor receives a `Next` holding the rest of the chain and
// the terminal handler; not calling it short-circuits everything inside.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use drudge_core::CallContext;
use futures::Stream;
use serde_json::Value;
use tokio::time::Sleep;
use tonic::{Code, Status};

/// Stream of response messages produced by a server-streaming handler.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Value, Status>> + Send + 'static>>;

/// Terminal unary handler, invoked after every interceptor.
#[async_trait]
pub trait UnaryHandler: Send + Sync {
    async fn call(&self, ctx: CallContext, request: Value) -> Result<Value, Status>;
}

/// Terminal server-streaming handler.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn call(&self, ctx: CallContext, request: Value) -> Result<MessageStream, Status>;
}

#[async_trait]
pub trait UnaryInterceptor: Send + Sync {
    fn name(&self) -> &str;

    async fn intercept(
        &self,
        ctx: CallContext,
        request: Value,
        next: UnaryNext<'_>,
    ) -> Result<Value, Status>;
}

#[async_trait]
pub trait StreamInterceptor: Send + Sync {
    fn name(&self) -> &str;

    /// Post-stream logic belongs in [`on_stream_end`] on the returned stream.
    async fn intercept(
        &self,
        ctx: CallContext,
        request: Value,
        next: StreamNext<'_>,
    ) -> Result<MessageStream, Status>;
}

/// Remainder of a unary chain.
pub struct UnaryNext<'a> {
    rest: &'a [Arc<dyn UnaryInterceptor>],
    handler: &'a dyn UnaryHandler,
}

impl UnaryNext<'_> {
    pub async fn run(self, ctx: CallContext, request: Value) -> Result<Value, Status> {
        match self.rest.split_first() {
            Some((head, rest)) => {
                head.intercept(
                    ctx,
                    request,
                    UnaryNext {
                        rest,
                        handler: self.handler,
                    },
                )
                .await
            }
            None => match ctx.remaining() {
                Some(remaining) => {
                    tokio::time::timeout(remaining, self.handler.call(ctx, request))
                        .await
                        .unwrap_or_else(|_| Err(Status::deadline_exceeded("deadline exceeded")))
                }
                None => self.handler.call(ctx, request).await,
            },
        }
    }
}

/// Remainder of a streaming chain.
pub struct StreamNext<'a> {
    rest: &'a [Arc<dyn StreamInterceptor>],
    handler: &'a dyn StreamHandler,
}

impl StreamNext<'_> {
    pub async fn run(self, ctx: CallContext, request: Value) -> Result<MessageStream, Status> {
        match self.rest.split_first() {
            Some((head, rest)) => {
                head.intercept(
                    ctx,
                    request,
                    StreamNext {
                        rest,
                        handler: self.handler,
                    },
                )
                .await
            }
            None => {
                let Some(remaining) = ctx.remaining() else {
                    return self.handler.call(ctx, request).await;
                };
                let opened = tokio::time::timeout(remaining, self.handler.call(ctx.clone(), request))
                    .await
                    .unwrap_or_else(|_| Err(Status::deadline_exceeded("deadline exceeded")))?;
                let left = ctx.remaining().unwrap_or(Duration::ZERO);
                Ok(Box::pin(DeadlineStream::new(opened, left)))
            }
        }
    }
}

/// Immutable pair of unary and streaming chains for one server.
#[derive(Clone)]
pub struct InterceptorChain {
    unary: Arc<[Arc<dyn UnaryInterceptor>]>,
    stream: Arc<[Arc<dyn StreamInterceptor>]>,
}

impl Default for InterceptorChain {
    fn default() -> Self {
        ChainBuilder::default().build()
    }
}

impl InterceptorChain {
    pub fn builder() -> ChainBuilder {
        ChainBuilder::default()
    }

    pub async fn call_unary(
        &self,
        ctx: CallContext,
        request: Value,
        handler: &dyn UnaryHandler,
    ) -> Result<Value, Status> {
        UnaryNext {
            rest: &self.unary,
            handler,
        }
        .run(ctx, request)
        .await
    }

    pub async fn call_stream(
        &self,
        ctx: CallContext,
        request: Value,
        handler: &dyn StreamHandler,
    ) -> Result<MessageStream, Status> {
        StreamNext {
            rest: &self.stream,
            handler,
        }
        .run(ctx, request)
        .await
    }

    pub fn unary_names(&self) -> Vec<&str> {
        self.unary.iter().map(|i| i.name()).collect()
    }

    pub fn stream_names(&self) -> Vec<&str> {
        self.stream.iter().map(|i| i.name()).collect()
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("unary", &self.unary_names())
            .field("stream", &self.stream_names())
            .finish()
    }
}

/// Interceptors appended after every caller-supplied entry.
#[derive(Clone, Default)]
pub struct DefaultTail {
    pub unary: Vec<Arc<dyn UnaryInterceptor>>,
    pub stream: Vec<Arc<dyn StreamInterceptor>>,
}

/// Collects caller interceptors in execution order.
#[derive(Default)]
pub struct ChainBuilder {
    unary: Vec<Arc<dyn UnaryInterceptor>>,
    stream: Vec<Arc<dyn StreamInterceptor>>,
}

impl ChainBuilder {
    pub fn unary(mut self, interceptor: Arc<dyn UnaryInterceptor>) -> Self {
        self.unary.push(interceptor);
        self
    }

    pub fn stream(mut self, interceptor: Arc<dyn StreamInterceptor>) -> Self {
        self.stream.push(interceptor);
        self
    }

    pub fn unary_all(mut self, interceptors: impl IntoIterator<Item = Arc<dyn UnaryInterceptor>>) -> Self {
        self.unary.extend(interceptors);
        self
    }

    pub fn stream_all(
        mut self,
        interceptors: impl IntoIterator<Item = Arc<dyn StreamInterceptor>>,
    ) -> Self {
        self.stream.extend(interceptors);
        self
    }

    /// Caller entries first, then `tail`.
    pub fn build_with(self, tail: DefaultTail) -> InterceptorChain {
        self.unary_all(tail.unary).stream_all(tail.stream).build()
    }

    /// Caller entries only.
    pub fn build(self) -> InterceptorChain {
        InterceptorChain {
            unary: self.unary.into(),
            stream: self.stream.into(),
        }
    }
}

/// How a stream ended, as seen by [`on_stream_end`] callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOutcome {
    pub code: Code,
    pub messages: u64,
}

/// Run `on_end` exactly once when `stream` finishes: at clean end (`Ok`), at
/// the first error (that error's code), or when dropped early (`Cancelled`).
pub fn on_stream_end<F>(stream: MessageStream, on_end: F) -> MessageStream
where
    F: FnOnce(StreamOutcome) + Send + 'static,
{
    Box::pin(ObservedStream {
        inner: stream,
        messages: 0,
        on_end: Some(Box::new(on_end)),
    })
}

struct ObservedStream {
    inner: MessageStream,
    messages: u64,
    on_end: Option<Box<dyn FnOnce(StreamOutcome) + Send>>,
}

impl ObservedStream {
    fn finish(&mut self, code: Code) {
        if let Some(on_end) = self.on_end.take() {
            on_end(StreamOutcome {
                code,
                messages: self.messages,
            });
        }
    }
}

impl Stream for ObservedStream {
    type Item = Result<Value, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.on_end.is_none() {
            return Poll::Ready(None);
        }
        let polled = this.inner.as_mut().poll_next(cx);
        match &polled {
            Poll::Ready(Some(Ok(_))) => this.messages += 1,
            Poll::Ready(Some(Err(status))) => this.finish(status.code()),
            Poll::Ready(None) => this.finish(Code::Ok),
            Poll::Pending => {}
        }
        polled
    }
}

impl Drop for ObservedStream {
    fn drop(&mut self) {
        self.finish(Code::Cancelled);
    }
}

/// Ends a stream with `DEADLINE_EXCEEDED` once its deadline passes.
struct DeadlineStream {
    inner: MessageStream,
    sleep: Pin<Box<Sleep>>,
    done: bool,
}

impl DeadlineStream {
    fn new(inner: MessageStream, remaining: Duration) -> Self {
        Self {
            inner,
            sleep: Box::pin(tokio::time::sleep(remaining)),
            done: false,
        }
    }
}

impl Stream for DeadlineStream {
    type Item = Result<Value, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if let Poll::Ready(item) = this.inner.as_mut().poll_next(cx) {
            if item.is_none() {
                this.done = true;
            }
            return Poll::Ready(item);
        }
        if this.sleep.as_mut().poll(cx).is_ready() {
            this.done = true;
            return Poll::Ready(Some(Err(Status::deadline_exceeded("deadline exceeded"))));
        }
        Poll::Pending
    }
}
