use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    #[serde(flatten)]
    readiness: Readiness,
}

/// Session occupancy at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Readiness {
    /// The accept loop has stopped and sessions are being drained.
    pub draining: bool,
    /// Connections holding a session slot, handshaking ones included.
    pub sessions: usize,
    /// `--max-sessions`.
    pub capacity: usize,
}

impl Readiness {
    /// A new client would be accepted right now.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        !self.draining && self.sessions < self.capacity
    }

    const fn status(&self) -> &'static str {
        if self.draining {
            "draining"
        } else if self.sessions >= self.capacity {
            "full"
        } else {
            "ready"
        }
    }
}

/// What `/ready` looks at: the session slots and the drain flag.
#[derive(Debug, Clone)]
pub struct HealthState {
    draining: Arc<AtomicBool>,
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl HealthState {
    /// Watches `slots`, the semaphore gating `capacity` sessions.
    #[must_use]
    pub fn new(slots: Arc<Semaphore>, capacity: usize) -> Self {
        Self {
            draining: Arc::new(AtomicBool::new(false)),
            slots,
            capacity,
        }
    }

    /// Called once the accept loop stops.
    pub fn start_draining(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }

    /// Current occupancy.
    #[must_use]
    pub fn snapshot(&self) -> Readiness {
        Readiness {
            draining: self.draining.load(Ordering::Relaxed),
            sessions: self.capacity.saturating_sub(self.slots.available_permits()),
            capacity: self.capacity,
        }
    }
}

/// Serves `/metrics`, `/health` and `/ready` on `addr`.
///
/// # Errors
///
/// Returns an error if the recorder is already installed or binding fails.
pub async fn start_metrics_server(addr: SocketAddr, health: HealthState) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Liveness: 200 while the process runs.
async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// 200 while another session would be accepted; 503 when every slot is
/// taken or the server is draining.
async fn ready_handler(health: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    let readiness = health.snapshot();
    let code = if readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(ReadyResponse {
            status: readiness.status(),
            readiness,
        }),
    )
}

/// Session gauges.
pub mod gauges {
    /// Increment the active sessions gauge.
    pub fn inc_sessions_active() {
        metrics::gauge!("rhizo_sessions_active").increment(1.0);
    }

    /// Decrement the active sessions gauge.
    pub fn dec_sessions_active() {
        metrics::gauge!("rhizo_sessions_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record a handshake with the given outcome label.
    pub fn handshakes_total(outcome: &'static str) {
        metrics::counter!("rhizo_handshakes_total", "outcome" => outcome).increment(1);
    }

    /// Record a dispatched request with its operation and result.
    pub fn requests_total(op: &'static str, errno: &'static str) {
        metrics::counter!("rhizo_requests_total", "op" => op, "errno" => errno).increment(1);
    }

    /// Record file content moved in the given direction.
    pub fn bulk_bytes_total(direction: &'static str, bytes: u64) {
        metrics::counter!("rhizo_bulk_bytes_total", "direction" => direction).increment(bytes);
    }

    /// Increment the connections refused at the session limit.
    pub fn sessions_refused_total() {
        metrics::counter!("rhizo_sessions_refused_total").increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record the handling time of one request in seconds.
    pub fn request_latency_seconds(op: &'static str, value: f64) {
        metrics::histogram!("rhizo_request_latency_seconds", "op" => op).record(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occupancy_follows_session_slots() {
        let slots = Arc::new(Semaphore::new(2));
        let health = HealthState::new(Arc::clone(&slots), 2);
        assert_eq!(
            health.snapshot(),
            Readiness {
                draining: false,
                sessions: 0,
                capacity: 2
            }
        );

        let first = Arc::clone(&slots).try_acquire_owned().unwrap();
        assert!(health.snapshot().is_ready());
        let second = Arc::clone(&slots).try_acquire_owned().unwrap();
        let full = health.snapshot();
        assert_eq!(full.sessions, 2);
        assert!(!full.is_ready());
        assert_eq!(full.status(), "full");

        drop((first, second));
        assert!(health.clone().snapshot().is_ready());
    }

    #[tokio::test]
    async fn ready_handler_reports_503_when_draining() {
        let health = HealthState::new(Arc::new(Semaphore::new(4)), 4);
        let (status, body) = ready_handler(health.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0.status, "ready");

        health.start_draining();
        let (status, body) = ready_handler(health).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.0.status, "draining");
        assert!(body.0.readiness.draining);
    }
}
