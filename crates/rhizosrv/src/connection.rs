use crate::dispatch::respond;
use crate::error::ServerError;
use crate::metrics::{counters, gauges};
use crate::server::ServerState;
use crate::transfer::TransferTable;
use rhizo_common::session::{Session, SessionError};
use rhizo_common::transport::Connection;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Runs the handshake under the handshake timeout and records its outcome.
async fn perform_handshake(conn: Connection, state: &ServerState) -> Result<Session, ServerError> {
    let peer = conn.peer().to_string();
    match timeout(state.config.handshake_timeout(), Session::accept(conn, &state.security)).await {
        Ok(Ok(session)) => {
            counters::handshakes_total("accepted");
            info!(
                peer,
                encrypted = session.is_encrypted(),
                key = ?session.peer_key(),
                "session established"
            );
            Ok(session)
        }
        Ok(Err(e)) if e.is_authorization_denied() => {
            counters::handshakes_total("denied");
            info!(peer, "peer not authorized");
            Err(e.into())
        }
        Ok(Err(e)) => {
            counters::handshakes_total("failed");
            debug!(peer, error = %e, "handshake failed");
            Err(e.into())
        }
        Err(_) => {
            counters::handshakes_total("timeout");
            debug!(peer, "handshake timed out");
            Err(ServerError::HandshakeTimeout)
        }
    }
}

/// Answers requests until the peer leaves, the session idles out, or the
/// server asks sessions to close.
async fn run_request_loop(
    session: &mut Session,
    transfers: &mut TransferTable,
    state: &ServerState,
    close: &mut watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let idle = state.config.idle_timeout();

    loop {
        if *close.borrow() {
            debug!(peer = session.peer(), "closing session for shutdown");
            return Ok(());
        }
        let expired = transfers.expire().await;
        if expired > 0 {
            debug!(peer = session.peer(), expired, "expired idle transfers");
        }

        let message = tokio::select! {
            received = timeout(idle, session.recv()) => match received {
                Ok(Ok(Some(message))) => message,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(ServerError::IdleTimeout),
            },
            changed = close.changed() => {
                if changed.is_err() || *close.borrow() {
                    return Ok(());
                }
                continue;
            }
        };

        let reply = respond(state, transfers, &message).await?;
        session.send(&reply).await?;
    }
}

/// Serves one accepted connection from handshake to close.
///
/// Open uploads are aborted when the session ends, however it ends.
///
/// # Errors
///
/// Returns the reason the session ended abnormally.
pub async fn handle_connection(
    conn: Connection,
    state: Arc<ServerState>,
    mut close: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let mut session = perform_handshake(conn, &state).await?;
    let mut transfers =
        TransferTable::new(state.config.transfer_timeout(), state.config.max_transfers);

    gauges::inc_sessions_active();
    let result = run_request_loop(&mut session, &mut transfers, &state, &mut close).await;
    gauges::dec_sessions_active();

    if !transfers.is_empty() {
        info!(
            peer = session.peer(),
            open = transfers.len(),
            "aborting unfinished transfers"
        );
    }
    transfers.abort_all().await;
    session.close().await;

    match &result {
        Err(ServerError::IdleTimeout) => debug!(peer = session.peer(), "session idle, closed"),
        Err(ServerError::Session(SessionError::Decrypt)) => {
            warn!(peer = session.peer(), "record failed authentication, session dropped");
        }
        _ => {}
    }
    result
}
