//! Local proxy endpoint
//!
//! Accepts SOCKS5 (and optionally HTTP) clients, negotiates the dial
//! target, opens the cipher-framed tunnel to the remote proxy, writes the
//! address header, and relays.

use crate::config::Config;
use crate::crypto::Cipher;
use crate::proxy::{negotiate_http, negotiate_socks5, ProxyError, RequestKind};
use crate::stats::{ConnGuard, ConnRegistry, ConnState};
use crate::tunnel::{relay, FramedStream};
use crate::{Error, Result, StatsSnapshot, DRAIN_TIMEOUT};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Which listener a client arrived on
#[derive(Debug, Clone, Copy)]
enum ClientKind {
    Socks5,
    Http,
}

/// The client-side endpoint of the tunnel.
pub struct LocalProxy {
    config: Arc<Config>,
    registry: ConnRegistry,
    shutdown_tx: watch::Sender<bool>,
}

impl LocalProxy {
    pub fn new(config: Config) -> Self {
        let registry = ConnRegistry::new(config.max_connections);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            registry,
            shutdown_tx,
        }
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

    /// Bind the listeners and serve until `shutdown` is called.
    pub async fn run(&self) -> Result<()> {
        let socks_addr = format!("{}:{}", self.config.local_host, self.config.local_port);
        let socks_listener = TcpListener::bind(&socks_addr)
            .await
            .map_err(|e| Error::Bind {
                addr: socks_addr.clone(),
                source: e,
            })?;
        info!("SOCKS5 proxy listening on {}", socks_addr);

        let http_listener = match self.config.http_port {
            Some(port) => {
                let addr = format!("{}:{}", self.config.local_host, port);
                let listener = TcpListener::bind(&addr).await.map_err(|e| Error::Bind {
                    addr: addr.clone(),
                    source: e,
                })?;
                info!("HTTP proxy listening on {}", addr);
                Some(listener)
            }
            None => None,
        };

        info!(
            "forwarding via {}:{}",
            self.config.server_host, self.config.server_port
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                accepted = socks_listener.accept() => {
                    self.admit(&mut tasks, accepted, ClientKind::Socks5);
                }
                accepted = accept_on(http_listener.as_ref()) => {
                    self.admit(&mut tasks, accepted, ClientKind::Http);
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

        drop(socks_listener);
        drop(http_listener);
        drain(&mut tasks).await;
        Ok(())
    }

    fn admit(
        &self,
        tasks: &mut JoinSet<()>,
        accepted: io::Result<(TcpStream, SocketAddr)>,
        kind: ClientKind,
    ) {
        let (stream, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!("accept error: {}", e);
                return;
            }
        };

        let guard = match self.registry.register(peer_addr) {
            Some(guard) => guard,
            None => {
                // At capacity: close without a reply.
                warn!("connection limit reached, dropping {}", peer_addr);
                return;
            }
        };

        debug!("new {:?} client from {}", kind, peer_addr);

        let config = Arc::clone(&self.config);
        let shutdown = self.shutdown_tx.subscribe();
        tasks.spawn(async move {
            if let Err(e) = handle_connection(config, guard, stream, kind, shutdown).await {
                debug!("connection from {} ended: {}", peer_addr, e);
            }
        });
    }
}

/// Accept on an optional listener; absent listeners never resolve.
async fn accept_on(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Wait for in-flight connections, then abandon whatever is left.
pub(crate) async fn drain(tasks: &mut JoinSet<()>) {
    if tasks.is_empty() {
        return;
    }
    info!("draining {} connection(s)", tasks.len());
    let drained = timeout(DRAIN_TIMEOUT, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("drain timed out, aborting {} task(s)", tasks.len());
        tasks.abort_all();
    }
}

async fn handle_connection(
    config: Arc<Config>,
    guard: ConnGuard,
    mut client: TcpStream,
    kind: ClientKind,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let connect_timeout = config.connect_timeout();

    let (address, initial_data, confirm_connect) = match kind {
        ClientKind::Socks5 => {
            let address = timeout(connect_timeout, negotiate_socks5(&mut client)).await??;
            (address, Bytes::new(), false)
        }
        ClientKind::Http => {
            let request = timeout(connect_timeout, negotiate_http(&mut client)).await??;
            let confirm = request.kind == RequestKind::Connect;
            (request.address, request.initial_data, confirm)
        }
    };

    guard.set_target(address.clone());
    guard.set_state(ConnState::Connecting);

    let remote = dial_remote(&config).await?;
    remote.set_nodelay(true).ok();

    let cipher = Cipher::new(&config.password, config.method)?;
    let mut tunnel = FramedStream::new(remote, cipher);

    // The IV goes out implicitly ahead of this first write.
    tunnel.write_all(&address.encode()?).await?;
    if !initial_data.is_empty() {
        tunnel.write_all(&initial_data).await?;
    }
    tunnel.flush().await?;

    if confirm_connect {
        client
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await?;
    }

    guard.set_state(ConnState::Relaying);
    let outcome = relay(
        client,
        tunnel,
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

/// Dial the remote proxy, retrying per the configured policy.
async fn dial_remote(config: &Config) -> Result<TcpStream> {
    let target = format!("{}:{}", config.server_host, config.server_port);
    let mut attempt: u8 = 0;

    loop {
        let result = timeout(config.connect_timeout(), TcpStream::connect(&target)).await;
        let err = match result {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => e,
            Err(_) => io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        };

        if config.auto_reconnect && attempt < config.retry_times {
            attempt += 1;
            warn!(
                "failed to reach {} ({}), retry {}/{} in {}s",
                target, err, attempt, config.retry_times, config.retry_interval_sec
            );
            sleep(std::time::Duration::from_secs(u64::from(
                config.retry_interval_sec,
            )))
            .await;
        } else {
            return Err(ProxyError::DialFailed {
                target,
                source: err,
            }
            .into());
        }
    }
}
