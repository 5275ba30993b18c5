// crates/drudge-core/src/lib.rs
//
// Core types shared by the Drudge crates: endpoints, method descriptors, the
// per-call context, RPC status mapping and the JSON error envelope.

pub mod context;
pub mod descriptor;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod status;

pub use context::{parse_grpc_timeout, CallContext, ResponseMetadata, TagSet};
pub use descriptor::{BodyRule, HttpRule, MethodDescriptor, MethodKind, RequestValidator, Validate};
pub use endpoint::{Endpoint, TransportKind};
pub use envelope::{status_with_details, ErrorBody, ErrorEnvelope, StreamChunk, TypedPayload};
pub use error::DrudgeError;
pub use status::{code_name, http_status_from_code, http_status_from_raw, status_text};
