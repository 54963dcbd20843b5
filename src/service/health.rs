//! HTTP health and metrics endpoints.
//!
//! Serves liveness, readiness, a component-level health report, live service
//! stats, and the Prometheus scrape endpoint on one axum listener.

use crate::admission::AdmissionController;
use crate::matcher::Matcher;
use crate::metrics::MetricsCollector;
use crate::party::PartyCoordinator;
use crate::player::PlayerRegistry;
use crate::types::PlayerState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Overall health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// One internal component's health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

/// Live counters snapshotted from the running components
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    pub connected_players: usize,
    pub open_tickets: usize,
    pub queued_players: usize,
    pub active_destinations: usize,
    pub parties: usize,
}

/// The full health report returned by `/health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub checks: Vec<ComponentCheck>,
    pub stats: ServiceStats,
}

impl HealthCheck {
    /// Inspect every component and roll the results up into one report
    pub fn evaluate(state: &HealthServerState) -> Self {
        let mut checks = Vec::new();
        let mut stats = ServiceStats::default();

        match state.players.count_in_state(PlayerState::Connected) {
            Ok(count) => {
                stats.connected_players = count;
                checks.push(ComponentCheck::healthy("player_registry"));
            }
            Err(e) => checks.push(ComponentCheck::unhealthy("player_registry", &e)),
        }
        match state.matcher.open_ticket_count() {
            Ok(count) => {
                stats.open_tickets = count;
                checks.push(ComponentCheck::healthy("matcher"));
            }
            Err(e) => checks.push(ComponentCheck::unhealthy("matcher", &e)),
        }
        match state
            .admission
            .destination_count()
            .and_then(|destinations| {
                let queued = state.admission.queued_player_count()?;
                Ok((destinations, queued))
            }) {
            Ok((destinations, queued)) => {
                stats.active_destinations = destinations;
                stats.queued_players = queued;
                checks.push(ComponentCheck::healthy("admission"));
            }
            Err(e) => checks.push(ComponentCheck::unhealthy("admission", &e)),
        }
        match state.party.party_count() {
            Ok(count) => {
                stats.parties = count;
                checks.push(ComponentCheck::healthy("party_coordinator"));
            }
            Err(e) => checks.push(ComponentCheck::unhealthy("party_coordinator", &e)),
        }

        let status = if checks.iter().all(|c| c.status == HealthStatus::Healthy) {
            HealthStatus::Healthy
        } else if checks.iter().any(|c| c.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };

        Self {
            status,
            service: "muster-point".to_string(),
            version: crate::VERSION.to_string(),
            timestamp: Utc::now(),
            checks,
            stats,
        }
    }
}

impl ComponentCheck {
    fn healthy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    fn unhealthy(name: &str, error: &anyhow::Error) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Unhealthy,
            message: Some(error.to_string()),
        }
    }
}

/// Listener settings for the health server
#[derive(Debug, Clone)]
pub struct HealthServerConfig {
    pub port: u16,
    pub host: String,
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Shared state handed to every handler
#[derive(Clone)]
pub struct HealthServerState {
    pub players: Arc<PlayerRegistry>,
    pub matcher: Arc<Matcher>,
    pub admission: Arc<AdmissionController>,
    pub party: Arc<PartyCoordinator>,
    pub metrics: Arc<MetricsCollector>,
}

/// The HTTP server exposing health and metrics
pub struct HealthServer {
    config: HealthServerConfig,
    state: HealthServerState,
    shutdown: broadcast::Sender<()>,
}

impl HealthServer {
    pub fn new(config: HealthServerConfig, state: HealthServerState) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            state,
            shutdown,
        }
    }

    /// Bind and serve until `stop` is called
    pub async fn start(&self) -> crate::error::Result<()> {
        let app = Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/ready", get(readiness_handler))
            .route("/alive", get(liveness_handler))
            .route("/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone());

        let address = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&address).await.map_err(|e| {
            crate::error::MusterError::ConfigurationError {
                message: format!("Failed to bind health server to {}: {}", address, e),
            }
        })?;
        info!("Health server listening on {}", address);

        let mut shutdown_rx = self.shutdown.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Health server shutting down");
            })
            .await
            .map_err(|e| {
                crate::error::MusterError::InternalError {
                    message: format!("Health server failed: {}", e),
                }
                .into()
            })
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "muster-point",
        "version": crate::VERSION,
        "endpoints": ["/health", "/ready", "/alive", "/stats", "/metrics"],
    }))
}

async fn health_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    let report = HealthCheck::evaluate(&state);
    let code = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report))
}

async fn readiness_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    let report = HealthCheck::evaluate(&state);
    match report.status {
        HealthStatus::Unhealthy => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ready": false })),
        ),
        _ => (StatusCode::OK, Json(serde_json::json!({ "ready": true }))),
    }
}

async fn liveness_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "alive": true, "timestamp": Utc::now() }))
}

async fn stats_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    Json(HealthCheck::evaluate(&state).stats)
}

async fn metrics_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    match state.metrics.gather() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to gather metrics".to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> HealthServerState {
        use crate::amqp::publisher::{MockPushChannel, PushChannel};
        use crate::config::AdmissionSettings;
        use crate::matcher::MatchmakingOrchestrator;
        use crate::remote::{AllowAllVerifier, MockServerProbe, ServerProbe};
        use std::time::Duration;

        let players = Arc::new(PlayerRegistry::new());
        let probe = Arc::new(MockServerProbe::new());
        let push = Arc::new(MockPushChannel::new());
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let matcher = Arc::new(Matcher::new());
        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&players),
            Arc::clone(&probe) as Arc<dyn ServerProbe>,
            Arc::clone(&push) as Arc<dyn PushChannel>,
            Arc::clone(&metrics),
            AdmissionSettings::default(),
            Duration::from_millis(100),
        ));
        let orchestrator = Arc::new(MatchmakingOrchestrator::new(
            Arc::clone(&matcher),
            Arc::clone(&players),
            Arc::clone(&probe) as Arc<dyn ServerProbe>,
            Arc::clone(&push) as Arc<dyn PushChannel>,
            Arc::clone(&admission),
            Arc::clone(&metrics),
            Duration::from_secs(3),
            Duration::from_millis(100),
        ));
        let party = Arc::new(PartyCoordinator::new(
            Arc::clone(&players),
            Arc::clone(&push) as Arc<dyn PushChannel>,
            Arc::new(AllowAllVerifier),
            orchestrator,
            admission.clone(),
            metrics.clone(),
            Duration::from_secs(60),
        ));
        HealthServerState {
            players,
            matcher,
            admission,
            party,
            metrics,
        }
    }

    #[tokio::test]
    async fn test_fresh_service_reports_healthy() {
        let report = HealthCheck::evaluate(&state());
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.checks.len(), 4);
        assert_eq!(report.stats.open_tickets, 0);
    }

    #[tokio::test]
    async fn test_stats_track_connected_players() {
        let state = state();
        state.players.connect(&"alice".to_string()).unwrap();
        state.players.connect(&"bob".to_string()).unwrap();

        let report = HealthCheck::evaluate(&state);
        assert_eq!(report.stats.connected_players, 2);
    }

    #[test]
    fn test_health_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
    }
}
