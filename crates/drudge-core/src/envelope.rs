// crates/drudge-core/src/envelope.rs
//
// JSON error envelopes and stream chunks produced by the REST gateway.
//
// An `ErrorEnvelope` is derived deterministically from a `tonic::Status`: the
// HTTP code comes from the status mapping, and the details are decoded from
// the status' binary `google.rpc.Status` payload.

use bytes::Bytes;
use http::StatusCode;
use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tonic::{Code, Status};

use crate::status::{http_status_from_raw, status_text};

/// A typed opaque payload attached to an error, `google.protobuf.Any` style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedPayload {
    pub type_url: String,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
}

impl TypedPayload {
    pub fn new(type_url: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            type_url: type_url.into(),
            value: value.into(),
        }
    }
}

/// In-band error description written by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub grpc_code: i32,
    pub http_code: i32,
    pub message: String,
    pub http_status: String,
    pub details: Vec<TypedPayload>,
}

impl ErrorEnvelope {
    pub fn from_status(status: &Status) -> Self {
        let grpc_code = status.code() as i32;
        let http = http_status_from_raw(grpc_code);
        Self {
            grpc_code,
            http_code: i32::from(http.as_u16()),
            message: status.message().to_string(),
            http_status: status_text(http).to_string(),
            details: decode_details(status.details()),
        }
    }

    /// Envelope for a stream that ended without producing anything.
    pub fn empty_response() -> Self {
        Self::from_status(&Status::unknown("empty response"))
    }

    pub fn http_status(&self) -> StatusCode {
        http_status_from_raw(self.grpc_code)
    }
}

/// Body of a failed non-streaming REST call: `{"error": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorEnvelope,
}

impl From<&Status> for ErrorBody {
    fn from(status: &Status) -> Self {
        Self {
            error: ErrorEnvelope::from_status(status),
        }
    }
}

/// One element of a streamed REST response array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamChunk {
    Result(Value),
    Error(ErrorEnvelope),
}

impl StreamChunk {
    pub fn from_status(status: &Status) -> Self {
        StreamChunk::Error(ErrorEnvelope::from_status(status))
    }

    pub fn empty_response() -> Self {
        StreamChunk::Error(ErrorEnvelope::empty_response())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamChunk::Error(_))
    }
}

// ---- google.rpc.Status wire encoding ----

#[derive(Clone, PartialEq, prost::Message)]
struct RpcStatus {
    #[prost(int32, tag = "1")]
    code: i32,
    #[prost(string, tag = "2")]
    message: String,
    #[prost(message, repeated, tag = "3")]
    details: Vec<AnyPayload>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct AnyPayload {
    #[prost(string, tag = "1")]
    type_url: String,
    #[prost(bytes = "vec", tag = "2")]
    value: Vec<u8>,
}

fn decode_details(raw: &[u8]) -> Vec<TypedPayload> {
    if raw.is_empty() {
        return Vec::new();
    }
    match RpcStatus::decode(raw) {
        Ok(decoded) => decoded
            .details
            .into_iter()
            .map(|any| TypedPayload::new(any.type_url, any.value))
            .collect(),
        Err(e) => {
            tracing::debug!(error = %e, "status details are not a google.rpc.Status payload");
            Vec::new()
        }
    }
}

/// Build a status carrying typed details that survive the RPC hop and show
/// up in the gateway's error envelope.
pub fn status_with_details(
    code: Code,
    message: impl Into<String>,
    details: &[TypedPayload],
) -> Status {
    let message = message.into();
    let encoded = RpcStatus {
        code: code as i32,
        message: message.clone(),
        details: details
            .iter()
            .map(|d| AnyPayload {
                type_url: d.type_url.clone(),
                value: d.value.clone(),
            })
            .collect(),
    }
    .encode_to_vec();
    Status::with_details(code, message, Bytes::from(encoded))
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
