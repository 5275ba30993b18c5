// crates/drudge-telemetry/src/propagation.rs
//
// W3C trace-context propagation over RPC metadata and HTTP headers.

use http::HeaderMap;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tonic::metadata::{Ascii, KeyRef, MetadataKey, MetadataMap, MetadataValue};

struct MetadataExtractor<'a>(&'a MetadataMap);

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0
            .keys()
            .map(|key| match key {
                KeyRef::Ascii(k) => k.as_str(),
                KeyRef::Binary(k) => k.as_str(),
            })
            .collect()
    }
}

struct MetadataInjector<'a>(&'a mut MetadataMap);

impl Injector for MetadataInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        let Ok(key) = MetadataKey::<Ascii>::from_bytes(key.as_bytes()) else {
            return;
        };
        if let Ok(value) = MetadataValue::try_from(value.as_str()) {
            self.0.insert(key, value);
        }
    }
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

/// Remote parent context carried by inbound RPC metadata.
pub fn extract_from_metadata(metadata: &MetadataMap) -> Context {
    TraceContextPropagator::new().extract(&MetadataExtractor(metadata))
}

/// Remote parent context carried by inbound HTTP headers.
pub fn extract_from_headers(headers: &HeaderMap) -> Context {
    TraceContextPropagator::new().extract(&HeaderExtractor(headers))
}

/// Write `cx` into outbound RPC metadata as `traceparent`/`tracestate`.
pub fn inject_into_metadata(cx: &Context, metadata: &mut MetadataMap) {
    TraceContextPropagator::new().inject_context(cx, &mut MetadataInjector(metadata));
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::TraceContextExt;

    const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    #[test]
    fn test_extract_from_metadata() {
        let mut md = MetadataMap::new();
        md.insert("traceparent", MetadataValue::from_static(TRACEPARENT));
        let cx = extract_from_metadata(&md);
        let span = cx.span();
        let sc = span.span_context();
        assert!(sc.is_remote());
        assert_eq!(sc.trace_id().to_string(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(sc.span_id().to_string(), "00f067aa0ba902b7");
    }

    #[test]
    fn test_extract_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("traceparent", TRACEPARENT.parse().unwrap());
        let cx = extract_from_headers(&headers);
        assert!(cx.span().span_context().is_valid());
    }

    #[test]
    fn test_missing_header_yields_invalid_context() {
        let cx = extract_from_metadata(&MetadataMap::new());
        assert!(!cx.span().span_context().is_valid());
    }

    #[test]
    fn test_inject_then_extract_keeps_trace_id() {
        let mut inbound = MetadataMap::new();
        inbound.insert("traceparent", MetadataValue::from_static(TRACEPARENT));
        let cx = extract_from_metadata(&inbound);

        let mut outbound = MetadataMap::new();
        inject_into_metadata(&cx, &mut outbound);
        assert_eq!(
            outbound.get("traceparent").unwrap().to_str().unwrap(),
            TRACEPARENT
        );
    }
}
