#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use rhizo_common::auth::policy_for;
use rhizo_common::keys::{self, KeyPair};
use rhizo_common::session::ServerSecurity;
use rhizo_common::transport::TransportContext;
use rhizosrv::config::{Args, ServerConfig};
use rhizosrv::metrics::start_metrics_server;
use rhizosrv::{run_with_shutdown, LocalDir, ServerState};
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config: ServerConfig = args.into();
    init_logging(config.log_file.as_deref())?;

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let security = if config.encrypt {
        let keypair = server_keypair(&config)?;
        info!("server public key: {}", keypair.public());
        let allowlist = match &config.authorized_keys {
            Some(path) => {
                let keys = keys::load_authorized(path)?;
                info!(path = %path.display(), keys = keys.len(), "loaded authorized keys");
                Some(keys)
            }
            None => None,
        };
        ServerSecurity::encrypted(keypair, policy_for(allowlist))
    } else {
        warn!("serving without encryption");
        ServerSecurity::plaintext()
    };

    let tree = LocalDir::new(&config.directory)
        .with_context(|| format!("cannot serve {}", config.directory.display()))?
        .with_read_only(config.read_only);
    info!(root = %tree.root().display(), read_only = config.read_only, "serving directory");

    let ctx = TransportContext::new();
    let listener = ctx.bind(&config.endpoint).await?;
    info!("bound to {}", listener.local_endpoint());

    if let Some(pidfile) = &config.pidfile {
        std::fs::write(pidfile, format!("{}\n", std::process::id()))
            .with_context(|| format!("cannot write pidfile {}", pidfile.display()))?;
    }

    let state = Arc::new(ServerState::new(Arc::new(tree), security, config.clone()));

    if let Some(addr) = config.metrics_addr {
        let health_state = state.health.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let result = run_with_shutdown(listener, state, shutdown_rx).await;
    ctx.close();

    if let Some(pidfile) = &config.pidfile {
        if let Err(e) = std::fs::remove_file(pidfile) {
            warn!(path = %pidfile.display(), error = %e, "failed to remove pidfile");
        }
    }

    if let Err(e) = result {
        tracing::error!("server error: {}", e);
        return Err(e.into());
    }
    Ok(())
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

/// Loads the configured key pair, or generates an ephemeral one.
fn server_keypair(config: &ServerConfig) -> Result<KeyPair> {
    if let Some(name) = &config.keyfile {
        let pair = keys::load_secret(name)?;
        info!("loaded key pair from {}", keys::secret_path(name).display());
        return Ok(pair);
    }

    let pair = KeyPair::generate();
    match &config.pubkeyfile {
        Some(path) => {
            keys::write_public(path, &pair.public())?;
            info!("wrote public key to {}", path.display());
        }
        None => warn!("using ephemeral key pair (not persisted)"),
    }
    Ok(pair)
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
