//! The cipher-framed tunnel
//!
//! Provides:
//! - `FramedStream`: a transparent encrypting duplex over any byte stream,
//!   handling the one-time IV exchange in each direction
//! - `relay`: the full-duplex byte pump between two streams

mod relay;
mod stream;

pub use relay::{relay, RelayOutcome};
pub use stream::FramedStream;

use thiserror::Error;

/// Tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Peer closed before sending a complete IV")]
    HandshakeTruncated,

    #[error("Relay IO error: {0}")]
    Relay(#[from] std::io::Error),
}
