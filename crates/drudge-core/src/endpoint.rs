// crates/drudge-core/src/endpoint.rs
//
// Listen/dial endpoints. An endpoint pairs a transport kind with an address
// and is immutable once constructed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DrudgeError;

/// Network transport used by a listener or dialer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Unix,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Unix => "unix",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = DrudgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(TransportKind::Tcp),
            "unix" => Ok(TransportKind::Unix),
            other => Err(DrudgeError::UnsupportedTransport(other.to_string())),
        }
    }
}

/// A transport plus an address: `host:port` for TCP, a filesystem path for
/// Unix sockets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    transport: TransportKind,
    address: String,
}

impl Endpoint {
    pub fn new(transport: TransportKind, address: impl Into<String>) -> Self {
        Self {
            transport,
            address: address.into(),
        }
    }

    pub fn tcp(address: impl Into<String>) -> Self {
        Self::new(TransportKind::Tcp, address)
    }

    pub fn unix(path: impl Into<String>) -> Self {
        Self::new(TransportKind::Unix, path)
    }

    /// Build from configuration text, e.g. `("tcp", ":8081")`.
    pub fn parse(transport: &str, address: impl Into<String>) -> Result<Self, DrudgeError> {
        Ok(Self::new(transport.parse()?, address))
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Address to bind. A bare `:port` binds every interface.
    pub fn listen_address(&self) -> String {
        match self.transport {
            TransportKind::Tcp if self.address.starts_with(':') => {
                format!("0.0.0.0{}", self.address)
            }
            _ => self.address.clone(),
        }
    }

    /// Address to connect to. A bare `:port`, or an unspecified host, dials
    /// the local machine.
    pub fn dial_address(&self) -> String {
        match self.transport {
            TransportKind::Tcp => {
                if self.address.starts_with(':') {
                    format!("127.0.0.1{}", self.address)
                } else if let Some(port) = self.address.strip_prefix("0.0.0.0:") {
                    format!("127.0.0.1:{port}")
                } else if let Some(port) = self.address.strip_prefix("[::]:") {
                    format!("[::1]:{port}")
                } else {
                    self.address.clone()
                }
            }
            TransportKind::Unix => self.address.clone(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.transport, self.address)
    }
}
