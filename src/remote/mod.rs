//! Remote proxy endpoint
//!
//! Accepts cipher-framed tunnels, decodes the address header, dials the
//! requested origin, and relays. The only authentication is implicit:
//! a peer without the password decrypts to a header that cannot parse,
//! which is logged and closed.

use crate::config::Config;
use crate::crypto::Cipher;
use crate::protocol::Address;
use crate::proxy::ProxyError;
use crate::stats::{ConnGuard, ConnRegistry, ConnState};
use crate::tunnel::{relay, FramedStream};
use crate::{Error, Result, StatsSnapshot};
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Decision hook consulted before the origin dial.
///
/// The default allows everything; deployments that need a destination
/// allow-list implement this and install it with
/// [`RemoteProxy::with_policy`].
#[async_trait]
pub trait DialPolicy: Send + Sync {
    async fn allow(&self, target: &Address) -> bool;
}

/// The default policy: dial anything the header asks for.
pub struct AllowAll;

#[async_trait]
impl DialPolicy for AllowAll {
    async fn allow(&self, _target: &Address) -> bool {
        true
    }
}

/// The origin-side endpoint of the tunnel.
pub struct RemoteProxy {
    config: Arc<Config>,
    registry: ConnRegistry,
    policy: Arc<dyn DialPolicy>,
    shutdown_tx: watch::Sender<bool>,
}

impl RemoteProxy {
    pub fn new(config: Config) -> Self {
        let registry = ConnRegistry::new(config.max_connections);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            registry,
            policy: Arc::new(AllowAll),
            shutdown_tx,
        }
    }

    /// Install a destination policy consulted before every origin dial.
    pub fn with_policy(mut self, policy: Arc<dyn DialPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Handle to the connection registry (the monitoring data source).
    pub fn registry(&self) -> ConnRegistry {
        self.registry.clone()
    }

    /// Point-in-time statistics for `/api/stats` consumers.
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.registry.snapshot()
    }

    /// Stop accepting, tear down relays, and let `run` return. Calling
    /// this more than once is a no-op after the first.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Bind the listener and serve until `shutdown` is called.
    pub async fn run(&self) -> Result<()> {
        let listen_addr = format!("0.0.0.0:{}", self.config.server_port);
        let listener = TcpListener::bind(&listen_addr)
            .await
            .map_err(|e| Error::Bind {
                addr: listen_addr.clone(),
                source: e,
            })?;
        info!("remote proxy listening on {}", listen_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => self.admit(&mut tasks, stream, peer_addr),
                        Err(e) => error!("accept error: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("shutting down");
                    break;
                }
                Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("connection task panicked: {}", e);
                        }
                    }
                }
            }
        }

        drop(listener);
        crate::local::drain(&mut tasks).await;
        Ok(())
    }

    fn admit(&self, tasks: &mut JoinSet<()>, stream: TcpStream, peer_addr: SocketAddr) {
        let guard = match self.registry.register(peer_addr) {
            Some(guard) => guard,
            None => {
                warn!("connection limit reached, dropping {}", peer_addr);
                return;
            }
        };

        debug!("new tunnel from {}", peer_addr);

        let config = Arc::clone(&self.config);
        let policy = Arc::clone(&self.policy);
        let shutdown = self.shutdown_tx.subscribe();
        tasks.spawn(async move {
            if let Err(e) = handle_tunnel(config, policy, guard, stream, shutdown).await {
                debug!("tunnel from {} ended: {}", peer_addr, e);
            }
        });
    }
}

async fn handle_tunnel(
    config: Arc<Config>,
    policy: Arc<dyn DialPolicy>,
    guard: ConnGuard,
    stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    stream.set_nodelay(true).ok();

    let cipher = Cipher::new(&config.password, config.method)?;
    let mut tunnel = FramedStream::new(stream, cipher);

    // First decrypted bytes must be the address header. Anything that does
    // not parse means the peer does not hold our password.
    let address = match timeout(
        config.connect_timeout(),
        Address::read_from(&mut tunnel),
    )
    .await?
    {
        Ok(address) => address,
        Err(e) => {
            warn!("rejecting tunnel: {}", e);
            return Err(e.into());
        }
    };

    if !policy.allow(&address).await {
        warn!("policy refused dial to {}", address);
        return Ok(());
    }

    guard.set_target(address.clone());
    guard.set_state(ConnState::Connecting);

    let origin = match dial_origin(&config, &address).await {
        Ok(origin) => origin,
        Err(e) => {
            // No reply on the tunnel; the local side observes EOF.
            warn!("failed to reach {}: {}", address, e);
            return Err(e);
        }
    };
    origin.set_nodelay(true).ok();

    debug!("connected to {}", address);

    guard.set_state(ConnState::Relaying);
    let outcome = relay(
        tunnel,
        origin,
        config.idle_timeout(),
        &guard,
        &mut shutdown,
    )
    .await?;
    guard.set_state(ConnState::Closing);

    debug!(
        "done with {}: {} bytes out, {} bytes in{}",
        address,
        outcome.bytes_out,
        outcome.bytes_in,
        if outcome.timed_out { " (idle timeout)" } else { "" }
    );

    Ok(())
}

/// Dial the origin the header asked for. Hostnames resolve here, at the
/// egress.
async fn dial_origin(config: &Config, address: &Address) -> Result<TcpStream> {
    let attempt = async {
        match address {
            Address::Ipv4(ip, port) => {
                TcpStream::connect(SocketAddr::new(IpAddr::V4(*ip), *port)).await
            }
            Address::Ipv6(ip, port) => {
                TcpStream::connect(SocketAddr::new(IpAddr::V6(*ip), *port)).await
            }
            Address::Domain(domain, port) => {
                TcpStream::connect((domain.as_str(), *port)).await
            }
        }
    };

    match timeout(config.connect_timeout(), attempt).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::DialFailed {
            target: address.to_string(),
            source: e,
        }
        .into()),
        Err(_) => Err(ProxyError::DialFailed {
            target: address.to_string(),
            source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        }
        .into()),
    }
}
