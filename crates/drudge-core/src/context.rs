// crates/drudge-core/src/context.rs
//
// Per-invocation call context handed to interceptors and handlers.
//
// A context is cheap to clone: clones share the response metadata, tags and
// cancellation token of the invocation that created it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{Ascii, MetadataKey, MetadataMap, MetadataValue};
use tonic::Status;
use tracing::Span;

use crate::descriptor::MethodDescriptor;

/// Header carrying the caller's deadline.
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Request tags shared by every clone of a call context.
#[derive(Debug, Clone, Default)]
pub struct TagSet(Arc<Mutex<BTreeMap<String, String>>>);

impl TagSet {
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.0.lock().insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.0.lock().get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.0.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags = self.0.lock();
        let mut first = true;
        for (key, value) in tags.iter() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }
        Ok(())
    }
}

/// Response metadata, written by handlers and sent back with the response.
#[derive(Debug, Clone, Default)]
pub struct ResponseMetadata(Arc<Mutex<MetadataMap>>);

impl ResponseMetadata {
    pub fn append(&self, key: &str, value: &str) -> Result<(), Status> {
        let key = MetadataKey::<Ascii>::from_bytes(key.as_bytes())
            .map_err(|_| Status::internal(format!("invalid metadata key: {key}")))?;
        let value = MetadataValue::try_from(value)
            .map_err(|_| Status::internal(format!("invalid metadata value for {key}")))?;
        self.0.lock().append(key, value);
        Ok(())
    }

    /// Move the collected entries out, leaving the map empty.
    pub fn take(&self) -> MetadataMap {
        std::mem::take(&mut *self.0.lock())
    }
}

/// Everything an interceptor or handler may know about the current call.
#[derive(Clone)]
pub struct CallContext {
    method: Arc<MethodDescriptor>,
    metadata: MetadataMap,
    response_metadata: ResponseMetadata,
    tags: TagSet,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
    peer: Option<String>,
    span: Span,
}

impl CallContext {
    /// Build a context for an inbound call. The deadline is taken from the
    /// `grpc-timeout` metadata entry when present and well formed.
    pub fn new(method: Arc<MethodDescriptor>, metadata: MetadataMap) -> Self {
        let deadline = metadata
            .get(GRPC_TIMEOUT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_grpc_timeout)
            .map(|timeout| Instant::now() + timeout);
        Self {
            method,
            metadata,
            response_metadata: ResponseMetadata::default(),
            tags: TagSet::default(),
            deadline,
            cancellation: CancellationToken::new(),
            peer: None,
            span: Span::none(),
        }
    }

    pub fn with_peer(mut self, peer: Option<String>) -> Self {
        self.peer = peer;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    pub fn method_arc(&self) -> Arc<MethodDescriptor> {
        Arc::clone(&self.method)
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }

    /// First value for `key`, if it is valid ASCII.
    pub fn metadata_value(&self, key: &str) -> Option<String> {
        self.metadata
            .get(key)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// All values for `key`, in arrival order.
    pub fn metadata_values(&self, key: &str) -> Vec<String> {
        self.metadata
            .get_all(key)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect()
    }

    pub fn response_metadata(&self) -> &ResponseMetadata {
        &self.response_metadata
    }

    /// Append a response metadata entry.
    pub fn set_response_metadata(&self, key: &str, value: &str) -> Result<(), Status> {
        self.response_metadata.append(key, value)
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.set(key, value);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `Some(Duration::ZERO)` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn set_span(&mut self, span: Span) {
        self.span = span;
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("method", &self.method.path())
            .field("deadline", &self.deadline)
            .field("peer", &self.peer)
            .field("tags", &self.tags)
            .finish()
    }
}

/// Parse a `grpc-timeout` value: up to eight ASCII digits followed by one of
/// `H M S m u n`.
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 || !value.is_ascii() {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount.checked_mul(3600)?),
        "M" => Duration::from_secs(amount.checked_mul(60)?),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::MethodKind;

    fn method() -> Arc<MethodDescriptor> {
        Arc::new(MethodDescriptor::new("acme.v1.Users", "Get", MethodKind::Unary))
    }

    #[test]
    fn test_parse_grpc_timeout_units() {
        assert_eq!(parse_grpc_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_grpc_timeout("2M"), Some(Duration::from_secs(120)));
        assert_eq!(parse_grpc_timeout("3S"), Some(Duration::from_secs(3)));
        assert_eq!(parse_grpc_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_grpc_timeout("10u"), Some(Duration::from_micros(10)));
        assert_eq!(parse_grpc_timeout("99n"), Some(Duration::from_nanos(99)));
    }

    #[test]
    fn test_parse_grpc_timeout_rejects_garbage() {
        for bad in ["", "S", "10", "10x", "123456789S", "-1S", "1.5S"] {
            assert_eq!(parse_grpc_timeout(bad), None, "{bad:?}");
        }
    }

    #[test]
    fn test_deadline_from_metadata() {
        let mut md = MetadataMap::new();
        md.insert(GRPC_TIMEOUT_HEADER, MetadataValue::from_static("5S"));
        let ctx = CallContext::new(method(), md);
        let remaining = ctx.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(5));
        assert!(remaining > Duration::from_secs(4));

        let ctx = CallContext::new(method(), MetadataMap::new());
        assert!(ctx.deadline().is_none());
    }

    #[test]
    fn test_clones_share_tags_and_response_metadata() {
        let ctx = CallContext::new(method(), MetadataMap::new());
        let clone = ctx.clone();
        clone.set_tag("peer.address", "10.0.0.1:4000");
        clone.set_response_metadata("x-trace", "abc").unwrap();

        assert_eq!(ctx.tags().get("peer.address").as_deref(), Some("10.0.0.1:4000"));
        let md = ctx.response_metadata().take();
        assert_eq!(md.get("x-trace").unwrap().to_str().unwrap(), "abc");
        assert!(clone.response_metadata().take().is_empty());
    }

    #[test]
    fn test_invalid_response_metadata_is_internal() {
        let ctx = CallContext::new(method(), MetadataMap::new());
        let err = ctx.set_response_metadata("bad key", "v").unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
    }

    #[test]
    fn test_tag_display_is_sorted() {
        let tags = TagSet::default();
        tags.set("b", "2");
        tags.set("a", "1");
        assert_eq!(tags.to_string(), "a=1 b=2");
    }
}
