// crates/drudge-core/src/error.rs
//
// Runtime-level error type for the Drudge server. Per-call failures travel as
// `tonic::Status` and are rendered into error envelopes by the gateway; only
// startup, transport, and fatal serving failures surface as `DrudgeError`.

use thiserror::Error;

/// Errors returned to the caller of the runtime entry points.
#[derive(Debug, Error)]
pub enum DrudgeError {
    /// Invalid or incomplete configuration detected at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A metric with the same name is already registered.
    #[error("Metric already registered: {0}")]
    DuplicateMetric(String),

    /// Transport kind other than `tcp` or `unix`.
    #[error("Unsupported transport kind: {0}")]
    UnsupportedTransport(String),

    /// An HTTP binding rule could not be turned into a route.
    #[error("Invalid route template '{template}': {reason}")]
    InvalidRoute { template: String, reason: String },

    /// A listener could not be opened.
    #[error("Failed to listen on {address}: {source}")]
    Listen {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The loopback client could not reach the RPC listener.
    #[error("Failed to dial {address}: {reason}")]
    Dial { address: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    /// A serving task panicked or was aborted. The process should exit.
    #[error("Fatal serving error: {0}")]
    Fatal(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DrudgeError {
    /// True for errors raised while validating configuration, before any
    /// listener is opened.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            DrudgeError::Config(_)
                | DrudgeError::DuplicateMetric(_)
                | DrudgeError::UnsupportedTransport(_)
                | DrudgeError::InvalidRoute { .. }
        )
    }

    /// True when the process must terminate.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DrudgeError::Fatal(_))
    }
}

impl From<serde_json::Error> for DrudgeError {
    fn from(err: serde_json::Error) -> Self {
        DrudgeError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_class() {
        assert!(DrudgeError::Config("missing service".into()).is_config());
        assert!(DrudgeError::DuplicateMetric("x".into()).is_config());
        assert!(DrudgeError::UnsupportedTransport("udp".into()).is_config());
        assert!(!DrudgeError::Fatal("boom".into()).is_config());
        assert!(DrudgeError::Fatal("boom".into()).is_fatal());
    }

    #[test]
    fn test_display_includes_source() {
        let err = DrudgeError::Listen {
            address: "127.0.0.1:1".into(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(err.to_string(), "Failed to listen on 127.0.0.1:1: in use");
    }
}
