#![forbid(unsafe_code)]

//! Shadowsocks AEAD relay server: TCP and UDP listeners speaking the
//! AEAD-variant wire protocol, behind a thin CLI/config/logging shell.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ss_server::{Config, Server};

/// Shutdown grace period after cancellation before remaining tasks are
/// abandoned and logged (spec default: 500ms).
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "ss-server", about = "Shadowsocks AEAD relay server")]
struct Cli {
    /// Path to the server's TOML configuration file.
    #[arg(short, long, default_value = "ss-server.toml")]
    config: PathBuf,

    /// Override the configured listen address.
    #[arg(long)]
    address: Option<SocketAddr>,

    /// Override the configured cipher (aes-128-gcm, aes-256-gcm, chacha20-ietf-poly1305).
    #[arg(long)]
    cipher: Option<String>,

    /// Override the configured pre-shared password.
    #[arg(long)]
    password: Option<String>,

    /// Log each connection's resolved target address.
    #[arg(long)]
    log_addresses: bool,

    /// Increase log verbosity (repeatable: -v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all but error-level logs. Takes precedence over `-v`.
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    /// Layer CLI flags over a loaded `Config`, the same precedence order
    /// as the environment-variable overrides: file, then env, then flags.
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(address) = self.address {
            config.address = address;
        }
        if let Some(cipher) = &self.cipher {
            config.cipher_name = cipher.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if self.log_addresses {
            config.log_addresses = true;
        }
    }

    fn log_filter(&self) -> &'static str {
        if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = Config::from_file(&cli.config)?;
    cli.apply_overrides(&mut config);
    config.validate()?;
    info!(address = %config.address, method = %config.cipher_name, "loaded configuration");

    let server = Server::bind(&config).await?;
    let shutdown = CancellationToken::new();

    let serve_shutdown = shutdown.clone();
    let serve_task = tokio::spawn(server.serve(serve_shutdown));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.cancel();

    match tokio::time::timeout(SHUTDOWN_GRACE, serve_task).await {
        Ok(Ok(())) => info!("shutdown complete"),
        Ok(Err(e)) => error!(error = %e, "server task panicked during shutdown"),
        Err(_) => warn!(grace_ms = SHUTDOWN_GRACE.as_millis(), "shutdown grace period elapsed, abandoning remaining tasks"),
    }

    Ok(())
}
