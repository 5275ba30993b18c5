// crates/drudge-rpc/src/lib.rs
//
// drudge-rpc: one HTTP listener serving gRPC-framed JSON RPCs and a REST
// gateway derived from the same methods.
//
// Modules:
// - service: runtime service definitions (methods, HTTP rules, handlers)
// - codec: JSON message codec for gRPC framing
// - interceptor / middleware: call chain engine and the default tail
// - server: RPC dispatch service
// - transport / dial: listeners, accept loop, loopback client
// - gateway / stream: REST translation and streaming response forwarding
// - router: protocol demultiplexing, CORS, HTTP tracing, metrics routes
// - lifecycle / runtime: coordinated startup and shutdown

pub mod codec;
pub mod config;
pub mod dial;
pub mod gateway;
pub mod interceptor;
pub mod lifecycle;
pub mod middleware;
pub mod router;
pub mod runtime;
pub mod server;
pub mod service;
pub mod stream;
pub mod transport;

pub use codec::JsonCodec;
pub use config::{Options, TransportCredentials};
pub use dial::{ClientTls, LoopbackClient, LoopbackStream};
pub use interceptor::{
    on_stream_end, ChainBuilder, DefaultTail, InterceptorChain, MessageStream, StreamHandler,
    StreamInterceptor, StreamNext, StreamOutcome, UnaryHandler, UnaryInterceptor, UnaryNext,
};
pub use lifecycle::{
    Component, ComponentLifecycle, LifecycleObserver, LifecycleState, RecordingObserver,
    Transition,
};
pub use middleware::{code_to_level, default_tail};
pub use router::{is_rpc_request, ProtocolRouter};
pub use runtime::run;
pub use server::RpcService;
pub use service::{MethodEntry, MethodHandler, ServiceBuilder, ServiceDefinition};
pub use stream::{ForwardResponseHook, StreamForwarder, StreamMode};
pub use transport::{FatalSlot, Listener};

pub use drudge_core::{
    CallContext, DrudgeError, Endpoint, HttpRule, MethodKind, TransportKind, Validate,
};
pub use tokio_util::sync::CancellationToken;
