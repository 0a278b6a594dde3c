//! Client-facing proxy negotiators
//!
//! Provides:
//! - SOCKS5 negotiation (RFC 1928, CONNECT only, no authentication)
//! - HTTP CONNECT and plain-HTTP forwarding with absolute-URI rewrite
//!
//! Negotiators consume the client's opening bytes and produce the dial
//! target; the surrounding proxy decides what happens next (dialling the
//! tunnel, sending the post-connect reply, starting the relay).

mod http;
mod socks5;

pub use http::{negotiate_http, HttpRequest, RequestKind};
pub use socks5::negotiate_socks5;

use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddrType(u8),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Request head exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Failed to reach {target}: {source}")]
    DialFailed {
        target: String,
        source: std::io::Error,
    },
}
