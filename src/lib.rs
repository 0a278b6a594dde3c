//! # JumpTiger
//!
//! An encrypting TCP tunnel. Local applications speak SOCKS5 (or HTTP
//! CONNECT / plain HTTP) to a local proxy, which relays their streams over
//! a single cipher-framed TCP connection per session to a remote proxy.
//! The remote end decrypts, dials the requested origin, and proxies bytes
//! bidirectionally.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  SOCKS5 / HTTP   ┌────────────┐   IV ‖ AES-CFB stream   ┌─────────────┐  TCP   ┌────────┐
//! │  client  │ ───────────────► │ LocalProxy │ ──────────────────────► │ RemoteProxy │ ─────► │ origin │
//! └──────────┘                  └────────────┘  AddrHeader ‖ payload   └─────────────┘        └────────┘
//! ```
//!
//! The wire format is deliberately minimal for interoperability with the
//! legacy ecosystem: the first 16 bytes in each direction are the IV, the
//! remainder is a single CFB keystream. There is no length framing and no
//! MAC; the only authentication is that a peer without the password
//! produces garbage.

pub mod config;
pub mod crypto;
pub mod local;
pub mod protocol;
pub mod proxy;
pub mod remote;
pub mod stats;
pub mod tunnel;

pub use config::Config;
pub use local::LocalProxy;
pub use remote::RemoteProxy;
pub use stats::StatsSnapshot;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Relay buffer size per direction
pub const RELAY_BUF_SIZE: usize = 8 * 1024;

/// Maximum HTTP request head accepted by the HTTP negotiator
pub const MAX_HTTP_HEADER: usize = 16 * 1024;

/// How long `run` waits for in-flight connections after shutdown
pub const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Timed out")]
    Timeout,
}

impl Error {
    /// Process exit code for this error: 1 for configuration problems,
    /// 2 for bind failures, 3 for anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 1,
            Error::Bind { .. } => 2,
            _ => 3,
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

/// Validate the configuration, then run a local proxy until shutdown.
pub async fn run_local(config: Config) -> Result<()> {
    config.validate()?;
    let proxy = LocalProxy::new(config);
    proxy.run().await
}

/// Validate the configuration, then run a remote proxy until shutdown.
pub async fn run_remote(config: Config) -> Result<()> {
    config.validate()?;
    let proxy = RemoteProxy::new(config);
    proxy.run().await
}
