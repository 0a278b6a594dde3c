//! Full-duplex relay between the client-facing and peer-facing streams
//!
//! One 8 KiB buffer per direction, no queueing: backpressure is the TCP
//! socket buffers. A clean EOF on one side propagates as a write shutdown
//! to the other and the remaining direction keeps pumping. Errors tear
//! both sides down immediately; a stream-cipher position cannot be
//! rewound, so nothing mid-stream is ever retried.

use super::TunnelError;
use crate::stats::ConnGuard;
use crate::RELAY_BUF_SIZE;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::trace;

/// How a relay ended
#[derive(Debug, Default, Clone, Copy)]
pub struct RelayOutcome {
    /// Bytes pumped peer → client
    pub bytes_in: u64,
    /// Bytes pumped client → peer
    pub bytes_out: u64,
    /// Whether the idle timeout ended the relay
    pub timed_out: bool,
}

/// Pump bytes between `client` and `peer` until both directions reach EOF,
/// the idle timeout fires, shutdown is signalled, or an IO error occurs.
///
/// `client` is the client-facing side: client→peer traffic counts as
/// `bytes_out`, peer→client as `bytes_in`, mirrored into `conn`.
pub async fn relay<A, B>(
    client: A,
    peer: B,
    idle_timeout: Duration,
    conn: &ConnGuard,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<RelayOutcome, TunnelError>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut peer_rd, mut peer_wr) = tokio::io::split(peer);

    let mut client_buf = vec![0u8; RELAY_BUF_SIZE];
    let mut peer_buf = vec![0u8; RELAY_BUF_SIZE];

    let mut client_open = true;
    let mut peer_open = true;
    let mut outcome = RelayOutcome::default();

    while client_open || peer_open {
        tokio::select! {
            read = client_rd.read(&mut client_buf), if client_open => match read? {
                0 => {
                    trace!("client side EOF, half-closing peer");
                    client_open = false;
                    let _ = peer_wr.shutdown().await;
                }
                n => {
                    peer_wr.write_all(&client_buf[..n]).await?;
                    peer_wr.flush().await?;
                    conn.add_bytes_out(n as u64);
                    outcome.bytes_out += n as u64;
                }
            },
            read = peer_rd.read(&mut peer_buf), if peer_open => match read? {
                0 => {
                    trace!("peer side EOF, half-closing client");
                    peer_open = false;
                    let _ = client_wr.shutdown().await;
                }
                n => {
                    client_wr.write_all(&peer_buf[..n]).await?;
                    client_wr.flush().await?;
                    conn.add_bytes_in(n as u64);
                    outcome.bytes_in += n as u64;
                }
            },
            // Re-armed on every loop turn, so this only fires after
            // idle_timeout of total silence.
            _ = sleep(idle_timeout) => {
                trace!("relay idle timeout");
                outcome.timed_out = true;
                break;
            }
            _ = shutdown.changed() => {
                trace!("relay stopped by shutdown");
                break;
            }
        }
    }

    Ok(outcome)
}
