use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::ServerError;
use crate::locks::PathLocks;
use crate::metrics::{counters, HealthState};
use crate::tree::BackingTree;
use rhizo_common::session::ServerSecurity;
use rhizo_common::transport::{Listener, TransportError};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Time given to sessions to finish their current request once they have
/// been told to close.
const CLOSE_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// Shared state for the server.
#[derive(Debug)]
pub struct ServerState {
    /// The served tree.
    pub tree: Arc<dyn BackingTree>,
    /// Encryption mode, key pair and authorization policy.
    pub security: ServerSecurity,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Path-scoped locks shared by every session.
    pub locks: PathLocks,
    /// Limits concurrent sessions.
    pub sessions: Arc<Semaphore>,
    /// Limits concurrently dispatched requests.
    pub workers: Semaphore,
    /// Session occupancy and drain state reported on `/ready`.
    pub health: HealthState,
}

impl ServerState {
    /// Builds state with limits taken from `config`.
    #[must_use]
    pub fn new(tree: Arc<dyn BackingTree>, security: ServerSecurity, config: ServerConfig) -> Self {
        let sessions = Arc::new(Semaphore::new(config.max_sessions));
        Self {
            tree,
            security,
            health: HealthState::new(Arc::clone(&sessions), config.max_sessions),
            sessions,
            workers: Semaphore::new(config.workers),
            locks: PathLocks::new(),
            config,
        }
    }
}

/// Runs the accept loop until the listener's context is closed.
///
/// # Errors
///
/// Returns an error if the accept loop encounters an unrecoverable failure.
pub async fn run(listener: Listener, state: Arc<ServerState>) -> Result<(), ServerError> {
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the server accept loop with an externally-controlled shutdown signal.
///
/// Once `shutdown` turns `true` (or its sender is dropped), the loop stops
/// accepting, waits up to the drain timeout for sessions to end, then tells
/// the remaining sessions to close after their current request.
///
/// # Errors
///
/// Returns an error if the accept loop encounters an unrecoverable failure.
pub async fn run_with_shutdown(
    mut listener: Listener,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    info!(endpoint = %listener.local_endpoint(), "server listening");
    let (close_tx, close_rx) = watch::channel(false);
    let mut sessions = JoinSet::new();

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok(conn) => {
                        let Ok(permit) = Arc::clone(&state.sessions).try_acquire_owned() else {
                            warn!(peer = conn.peer(), "max sessions reached, rejecting");
                            counters::sessions_refused_total();
                            drop(conn);
                            continue;
                        };
                        let state = Arc::clone(&state);
                        let close_rx = close_rx.clone();
                        sessions.spawn(async move {
                            let peer = conn.peer().to_string();
                            if let Err(e) = handle_connection(conn, state, close_rx).await {
                                debug!(peer, error = %e, "session ended");
                            }
                            drop(permit);
                        });
                    }
                    Err(TransportError::ContextClosed) => {
                        info!("transport context closed");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                    }
                }
            }
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = finished {
                    error!(error = %e, "session task failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    state.health.start_draining();
    drop(listener);
    info!(sessions = sessions.len(), "shutdown signal received, draining");

    let drained = tokio::time::timeout(state.config.drain_timeout(), async {
        while sessions.join_next().await.is_some() {}
    })
    .await
    .is_ok();

    if !drained {
        warn!(
            sessions = sessions.len(),
            "drain timeout reached, closing remaining sessions"
        );
        let _ = close_tx.send(true);
        let closed = tokio::time::timeout(CLOSE_GRACE, async {
            while sessions.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !closed {
            warn!(sessions = sessions.len(), "aborting sessions stuck in a request");
            sessions.shutdown().await;
        }
    }

    info!("server shut down gracefully");
    Ok(())
}
