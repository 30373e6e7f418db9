//! Command line interface for running the relay, taking one-off backups and
//! converting keys between hex and `npub` form.

mod backup;
mod config;
mod event;
mod filter;
mod identity;
mod policy;
mod relay;
mod server;
mod storage;
mod trust;
mod ws;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use backup::BackupScheduler;
use config::{AdmissionMode, Settings};
use identity::Identity;
use policy::{Admission, RateLimiter, WhitelistSet};
use relay::{Chains, Relay};
use server::{RelayInfo, SUPPORTED_NIPS};
use trust::{FollowSource, TrustNetwork};

/// Upper bound on one contact-list fetch from an upstream relay.
const TRUST_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "relaygate", author, version, about = "Admission-controlled Nostr relay")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the relay until interrupted.
    Serve,
    /// Write a snapshot of the configured store into a directory.
    Backup {
        #[arg(long)]
        dest: PathBuf,
    },
    /// Convert public keys between encodings.
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Hex public key to `npub`.
    Encode { hex: String },
    /// `npub` to hex public key.
    Decode { npub: String },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli, shutdown: CancellationToken) -> Result<()> {
    match cli.command {
        Commands::Key { action } => {
            println!("{}", convert_key(action)?);
        }
        Commands::Backup { dest } => {
            let cfg = Settings::from_env(&cli.env)?;
            let backend = storage::open_backend(&cfg.storage);
            backend
                .init()
                .with_context(|| format!("opening {} store", cfg.storage.engine))?;
            let written = BackupScheduler::new(backend.clone(), dest, Duration::ZERO)
                .run_once()
                .await?;
            backend.close();
            println!("{}", written.display());
        }
        Commands::Serve => {
            let cfg = Settings::from_env(&cli.env)?;
            serve(cfg, shutdown).await?;
        }
    }
    Ok(())
}

fn convert_key(action: KeyAction) -> Result<String> {
    match action {
        KeyAction::Encode { hex } => Ok(Identity::from_hex(hex.trim())?.to_npub()?),
        KeyAction::Decode { npub } => Ok(Identity::from_npub(npub.trim())?.to_hex()),
    }
}

/// Wire storage, policies and background tasks together and serve until
/// `shutdown` is cancelled.
async fn serve(cfg: Settings, shutdown: CancellationToken) -> Result<()> {
    info!(
        "{} {} starting with {} storage at {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        cfg.storage.engine,
        cfg.storage.path.display()
    );
    info!("limits: {}", serde_json::to_string_pretty(&cfg.limits)?);

    let backend = storage::open_backend(&cfg.storage);
    backend
        .init()
        .with_context(|| format!("opening {} store", backend.engine()))?;

    let admission = match cfg.admission {
        AdmissionMode::Whitelist => {
            let path = cfg
                .whitelist_file
                .as_ref()
                .context("USER_NPUBS_FILE is required in whitelist mode")?;
            let set = WhitelistSet::load(path)?;
            if set.is_empty() {
                warn!("whitelist {} admits nobody", path.display());
            } else {
                info!("whitelist loaded with {} pubkeys", set.len());
            }
            Admission::Whitelist(Arc::new(set))
        }
        AdmissionMode::Trust => {
            let network = Arc::new(TrustNetwork::new(cfg.owner, cfg.trust_depth));
            info!("trust network rooted at {}", network.owner());
            let source = if cfg.trust_relays.is_empty() {
                FollowSource::Store(backend.clone())
            } else {
                FollowSource::Relays {
                    urls: cfg.trust_relays.clone(),
                    socks: cfg.tor_socks.clone(),
                    timeout: TRUST_FETCH_TIMEOUT,
                }
            };
            tokio::spawn(network.clone().run(source, cfg.trust_refresh, shutdown.clone()));
            Admission::Trust(network)
        }
        AdmissionMode::Owner => Admission::Owner(cfg.owner),
    };
    info!("admission mode: {}", admission.name());

    let connection_limiter = Arc::new(RateLimiter::new(cfg.limits.connection_limiter()));
    let event_limiter = Arc::new(RateLimiter::new(cfg.limits.event_limiter()));
    debug!(
        "connection limiter {:?}, event limiter {:?}",
        connection_limiter.config(),
        event_limiter.config()
    );
    tokio::spawn(connection_limiter.clone().run_eviction(shutdown.clone()));
    tokio::spawn(event_limiter.clone().run_eviction(shutdown.clone()));

    if let Some(dir) = cfg.backup_dir.clone() {
        info!("backing up to {} every {:?}", dir.display(), cfg.backup_interval);
        let scheduler = BackupScheduler::new(backend.clone(), dir, cfg.backup_interval);
        tokio::spawn(scheduler.run(shutdown.clone()));
    }

    let chains = Chains {
        connection: policy::connection_chain(connection_limiter),
        filter: policy::filter_chain(&cfg.limits, cfg.owner),
        event: policy::event_chain(event_limiter, admission),
    };
    let info = RelayInfo {
        name: cfg.relay_name.clone(),
        description: cfg.relay_description.clone(),
        pubkey: cfg.relay_npub.to_hex(),
        contact: cfg.relay_contact.clone(),
        icon: cfg.relay_icon.clone(),
        software: cfg.relay_software.clone(),
        version: env!("CARGO_PKG_VERSION").into(),
        supported_nips: SUPPORTED_NIPS.to_vec(),
    };
    let relay = Relay::new(backend.clone(), chains, info)
        .verify_signatures(cfg.verify_sig)
        .trust_proxy_headers(cfg.trust_proxy_headers)
        .service_url(cfg.service_url.clone())
        .with_shutdown(shutdown.clone());

    info!("serving {} on {}", cfg.service_url, cfg.bind);
    let token = shutdown.clone();
    server::serve(cfg.bind, Arc::new(relay), async move {
        token.cancelled().await
    })
    .await?;
    shutdown.cancel();
    backend.close();
    info!("relay stopped");
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> Result<()> {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            token.cancel();
        }
    });
    run(cli, shutdown).await
}
