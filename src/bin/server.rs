//! JumpTiger remote proxy
//!
//! Runs the origin-side endpoint: accepts cipher-framed tunnels from local
//! proxies, decodes the destination header, and dials out on their behalf.

use anyhow::{Context, Result};
use clap::Parser;
use jumptiger::{Config, RemoteProxy};
use std::sync::Arc;
use tracing::{error, info};

/// JumpTiger remote proxy - tunnel server and origin dialler
#[derive(Parser, Debug)]
#[command(name = "jumptiger-server")]
#[command(about = "JumpTiger remote proxy - tunnel server and origin dialler")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Listen port (overrides config)
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Password (overrides config)
    #[arg(short = 'k', long)]
    password: Option<String>,

    /// Idle timeout in seconds (overrides config)
    #[arg(short = 't', long)]
    timeout: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<jumptiger::Error>()
        .map(jumptiger::Error::exit_code)
        .unwrap_or(3)
}

async fn run(args: Args) -> Result<()> {
    let mut config = load_config(&args)?;

    if let Some(port) = args.port {
        config.server_port = port;
    }
    if let Some(password) = args.password {
        config.password = password;
    }
    if let Some(timeout) = args.timeout {
        config.timeout_sec = timeout;
    }

    config.validate()?;

    info!("JumpTiger remote proxy v{}", jumptiger::VERSION);
    info!("method: {:?}", config.method);

    let proxy = Arc::new(RemoteProxy::new(config));

    let signal_proxy = Arc::clone(&proxy);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            signal_proxy.shutdown();
        }
    });

    proxy.run().await?;
    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    if std::path::Path::new(&args.config).exists() {
        return Config::load(&args.config).context("Failed to load configuration");
    }
    if args.password.is_some() {
        info!("config file {} not found, using defaults", args.config);
        return Ok(Config::default());
    }
    Err(jumptiger::Error::Config(format!("config file not found: {}", args.config)).into())
}
