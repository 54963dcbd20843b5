//! Application state wiring and the command router.
//!
//! `AppState` owns every long-lived component, connects them to the broker,
//! and drives startup and graceful shutdown. `CommandRouter` turns validated
//! client commands into calls on the matchmaking, admission, and party
//! subsystems.

use crate::admission::AdmissionController;
use crate::amqp::{
    AmqpConnection, AmqpPushChannel, ClientCommand, CommandConsumer, CommandHandler, PushChannel,
};
use crate::config::{validate_config, AppConfig};
use crate::error::{MusterError, Result};
use crate::matcher::{Matcher, MatchmakingOrchestrator};
use crate::metrics::MetricsCollector;
use crate::party::PartyCoordinator;
use crate::player::PlayerRegistry;
use crate::remote::{AllowAllVerifier, FriendshipVerifier, MockServerProbe, ServerProbe};
use crate::service::health::{HealthServer, HealthServerConfig, HealthServerState};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Service-level errors raised during startup and shutdown
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("AMQP connection error: {0}")]
    AmqpConnection(String),

    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Background task error: {0}")]
    BackgroundTask(String),
}

/// Routes inbound client commands to the owning subsystem
pub struct CommandRouter {
    players: Arc<PlayerRegistry>,
    orchestrator: Arc<MatchmakingOrchestrator>,
    admission: Arc<AdmissionController>,
    party: Arc<PartyCoordinator>,
    push: Arc<dyn PushChannel>,
}

impl CommandRouter {
    pub fn new(
        players: Arc<PlayerRegistry>,
        orchestrator: Arc<MatchmakingOrchestrator>,
        admission: Arc<AdmissionController>,
        party: Arc<PartyCoordinator>,
        push: Arc<dyn PushChannel>,
    ) -> Self {
        Self {
            players,
            orchestrator,
            admission,
            party,
            push,
        }
    }

    /// Tear down everything a departing player holds, in dependency order
    async fn disconnect(&self, player_id: &crate::types::PlayerId) -> Result<()> {
        self.orchestrator.leave_matchmaking(player_id).await?;
        self.admission
            .remove_player(player_id, crate::types::RemovalReason::Disconnected)
            .await?;
        self.party.leave_party(player_id).await?;
        self.players.disconnect(player_id)?;
        info!("Player {} disconnected", player_id);
        Ok(())
    }
}

#[async_trait]
impl CommandHandler for CommandRouter {
    async fn handle_command(&self, command: ClientCommand) -> Result<()> {
        match command {
            ClientCommand::Connect { player_id } => {
                self.players.connect(&player_id)?;
                info!("Player {} connected", player_id);
                Ok(())
            }
            ClientCommand::Disconnect { player_id } => self.disconnect(&player_id).await,
            ClientCommand::EnterMatchmaking {
                player_id,
                queue,
                criteria,
                pings,
            } => {
                // A party member searches for the whole party, leader-gated
                if self.players.party_of(&player_id)?.is_some() {
                    self.party
                        .enter_matchmaking_as_party(&player_id, queue, criteria, pings)
                        .await?;
                } else {
                    self.orchestrator
                        .enter_matchmaking(
                            player_id.clone(),
                            vec![player_id],
                            queue,
                            criteria,
                            pings,
                        )
                        .await?;
                }
                Ok(())
            }
            ClientCommand::LeaveMatchmaking { player_id } => {
                self.orchestrator.leave_matchmaking(&player_id).await?;
                Ok(())
            }
            ClientCommand::UpdateCriteria {
                player_id,
                criteria,
            } => self.orchestrator.update_criteria(&player_id, criteria).await,
            ClientCommand::JoinServer { player_id, server } => {
                if self.players.party_of(&player_id)?.is_some() {
                    self.party.join_server_as_party(&player_id, &server).await
                } else {
                    self.admission.enqueue(&player_id, &server).await
                }
            }
            ClientCommand::LeaveQueue { player_id } => {
                self.admission.leave_queue(&player_id).await?;
                Ok(())
            }
            ClientCommand::JoinReply {
                correlation_id,
                outcome,
                ..
            } => self.push.resolve_join_reply(&correlation_id, outcome),
            ClientCommand::ReportJoinSuccess { player_id, server } => {
                self.admission.report_join_success(&player_id, &server)
            }
            ClientCommand::ReportJoinFailure { player_id, server } => {
                self.admission.report_join_failure(&player_id, &server).await
            }
            ClientCommand::CreateParty { player_id, privacy } => {
                self.party.create_party(&player_id, privacy)?;
                Ok(())
            }
            ClientCommand::JoinParty {
                player_id,
                party_id,
            } => {
                self.party.join_party(&player_id, party_id).await?;
                Ok(())
            }
            ClientCommand::LeaveParty { player_id } => {
                self.party.leave_party(&player_id).await?;
                Ok(())
            }
            ClientCommand::CloseParty { player_id } => self.party.close_party(&player_id).await,
            ClientCommand::Kick { player_id, target } => {
                self.party.kick(&player_id, &target).await
            }
            ClientCommand::Promote { player_id, target } => {
                self.party.promote(&player_id, &target).await
            }
            ClientCommand::SetPrivacy { player_id, privacy } => {
                self.party.set_privacy(&player_id, privacy).await
            }
            ClientCommand::Invite { player_id, target } => {
                self.party.invite(&player_id, &target).await
            }
        }
    }

    async fn handle_error(&self, error: MusterError, message_data: &[u8]) {
        let preview: String = String::from_utf8_lossy(message_data)
            .chars()
            .take(200)
            .collect();
        error!("Command failed: {} (payload: {})", error, preview);
    }
}

struct BackgroundTask {
    name: &'static str,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Everything the running service owns
pub struct AppState {
    config: AppConfig,
    players: Arc<PlayerRegistry>,
    matcher: Arc<Matcher>,
    orchestrator: Arc<MatchmakingOrchestrator>,
    admission: Arc<AdmissionController>,
    party: Arc<PartyCoordinator>,
    metrics: Arc<MetricsCollector>,
    push: Arc<dyn PushChannel>,
    amqp: Mutex<Option<AmqpConnection>>,
    consumer: Mutex<Option<CommandConsumer>>,
    health: Arc<HealthServer>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<BackgroundTask>>,
    is_running: Arc<RwLock<bool>>,
}

impl AppState {
    /// Connect to the broker and wire every component together
    pub async fn new(config: AppConfig) -> Result<Self> {
        validate_config(&config).map_err(|e| ServiceError::Configuration(e.to_string()))?;
        info!("Initializing {}", config.service.name);

        let amqp = AmqpConnection::connect(
            &config.amqp.url,
            config.amqp.max_retry_attempts,
            config.amqp.retry_delay_ms,
        )
        .await
        .map_err(|e| ServiceError::AmqpConnection(e.to_string()))?;
        let push_channel = amqp
            .open_channel()
            .await
            .map_err(|e| ServiceError::AmqpConnection(e.to_string()))?;
        let push: Arc<dyn PushChannel> = Arc::new(
            AmqpPushChannel::new(push_channel)
                .await
                .map_err(|e| ServiceError::Initialization(e.to_string()))?,
        );

        // TODO: replace with a live status poller once the probe protocol
        // for game servers is settled
        let probe: Arc<dyn ServerProbe> = Arc::new(MockServerProbe::new());
        let verifier: Arc<dyn FriendshipVerifier> = Arc::new(AllowAllVerifier);

        Self::assemble(config, Some(amqp), probe, push, verifier)
    }

    /// Wire the service against in-memory transport and probe doubles.
    /// Used by tests and the dry-run mode; no broker is contacted.
    pub fn with_mocks(config: AppConfig) -> Result<Self> {
        validate_config(&config).map_err(|e| ServiceError::Configuration(e.to_string()))?;
        let probe: Arc<dyn ServerProbe> = Arc::new(MockServerProbe::new());
        let push: Arc<dyn PushChannel> = Arc::new(crate::amqp::MockPushChannel::new());
        let verifier: Arc<dyn FriendshipVerifier> = Arc::new(AllowAllVerifier);
        Self::assemble(config, None, probe, push, verifier)
    }

    fn assemble(
        config: AppConfig,
        amqp: Option<AmqpConnection>,
        probe: Arc<dyn ServerProbe>,
        push: Arc<dyn PushChannel>,
        verifier: Arc<dyn FriendshipVerifier>,
    ) -> Result<Self> {
        let metrics = Arc::new(
            MetricsCollector::new().map_err(|e| ServiceError::Initialization(e.to_string()))?,
        );
        let players = Arc::new(PlayerRegistry::new());
        let matcher = Arc::new(Matcher::new());

        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&players),
            Arc::clone(&probe),
            Arc::clone(&push),
            Arc::clone(&metrics),
            config.admission.clone(),
            config.probe_timeout(),
        ));
        let orchestrator = Arc::new(MatchmakingOrchestrator::new(
            Arc::clone(&matcher),
            Arc::clone(&players),
            Arc::clone(&probe),
            Arc::clone(&push),
            Arc::clone(&admission),
            Arc::clone(&metrics),
            config.pass_interval(),
            config.probe_timeout(),
        ));
        let party = Arc::new(PartyCoordinator::new(
            Arc::clone(&players),
            Arc::clone(&push),
            verifier,
            Arc::clone(&orchestrator),
            Arc::clone(&admission),
            Arc::clone(&metrics),
            config.invite_ttl(),
        ));

        let health = Arc::new(HealthServer::new(
            HealthServerConfig {
                port: config.service.health_port,
                ..HealthServerConfig::default()
            },
            HealthServerState {
                players: Arc::clone(&players),
                matcher: Arc::clone(&matcher),
                admission: Arc::clone(&admission),
                party: Arc::clone(&party),
                metrics: Arc::clone(&metrics),
            },
        ));

        Ok(Self {
            config,
            players,
            matcher,
            orchestrator,
            admission,
            party,
            metrics,
            push,
            amqp: Mutex::new(amqp),
            consumer: Mutex::new(None),
            health,
            health_task: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            is_running: Arc::new(RwLock::new(false)),
        })
    }

    /// Start consuming commands and spawn every background loop
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut running = self.is_running.write().await;
            if *running {
                return Err(ServiceError::Initialization(
                    "Service is already running".to_string(),
                )
                .into());
            }
            *running = true;
        }

        let health = Arc::clone(&self.health);
        let health_task = tokio::spawn(async move {
            if let Err(e) = health.start().await {
                error!("Health server exited: {}", e);
            }
        });
        *self.health_task.lock().await = Some(health_task);

        if let Some(amqp) = self.amqp.lock().await.as_ref() {
            let channel = amqp
                .open_channel()
                .await
                .map_err(|e| ServiceError::AmqpConnection(e.to_string()))?;
            let router = Arc::new(CommandRouter::new(
                Arc::clone(&self.players),
                Arc::clone(&self.orchestrator),
                Arc::clone(&self.admission),
                Arc::clone(&self.party),
                Arc::clone(&self.push),
            ));
            let consumer = CommandConsumer::new(router, channel);
            consumer
                .start_consuming(&self.config.amqp.command_queue)
                .await
                .map_err(|e| ServiceError::AmqpConnection(e.to_string()))?;
            *self.consumer.lock().await = Some(consumer);
        }

        let mut tasks = self.tasks.lock().await;
        let (cancel, handle) = self.orchestrator.spawn();
        tasks.push(BackgroundTask {
            name: "matchmaking-pass",
            cancel,
            handle,
        });
        let (cancel, handle) = self.admission.spawn_cleanup();
        tasks.push(BackgroundTask {
            name: "admission-cleanup",
            cancel,
            handle,
        });

        info!("{} started", self.config.service.name);
        Ok(())
    }

    /// Stop consuming, wind down background loops, and close the broker link
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down {}", self.config.service.name);
        *self.is_running.write().await = false;

        if let Some(consumer) = self.consumer.lock().await.take() {
            if let Err(e) = consumer.stop_consuming().await {
                warn!("Failed to stop command consumer: {}", e);
            }
        }

        for task in self.tasks.lock().await.drain(..) {
            let _ = task.cancel.send(true);
            match tokio::time::timeout(Duration::from_secs(5), task.handle).await {
                Ok(_) => info!("Background task {} stopped", task.name),
                Err(_) => warn!("Background task {} did not stop in time", task.name),
            }
        }

        self.health.stop();
        if let Some(handle) = self.health_task.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("Health server did not stop in time");
            }
        }

        if let Some(amqp) = self.amqp.lock().await.take() {
            if let Err(e) = amqp.close().await {
                warn!("Failed to close AMQP connection: {}", e);
            }
        }

        info!("{} shut down", self.config.service.name);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn players(&self) -> &Arc<PlayerRegistry> {
        &self.players
    }

    pub fn matcher(&self) -> &Arc<Matcher> {
        &self.matcher
    }

    pub fn orchestrator(&self) -> &Arc<MatchmakingOrchestrator> {
        &self.orchestrator
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn party(&self) -> &Arc<PartyCoordinator> {
        &self.party
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Component health snapshot for the CLI health-check mode
    pub fn health_report(&self) -> crate::service::health::HealthCheck {
        crate::service::health::HealthCheck::evaluate(&HealthServerState {
            players: Arc::clone(&self.players),
            matcher: Arc::clone(&self.matcher),
            admission: Arc::clone(&self.admission),
            party: Arc::clone(&self.party),
            metrics: Arc::clone(&self.metrics),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PartyPrivacy, PlayerState, SearchCriteria};
    use std::collections::HashMap;

    struct Fixture {
        router: CommandRouter,
        players: Arc<PlayerRegistry>,
        party: Arc<PartyCoordinator>,
    }

    fn fixture() -> Fixture {
        let app = AppState::with_mocks(AppConfig::default()).unwrap();
        let router = CommandRouter::new(
            Arc::clone(&app.players),
            Arc::clone(&app.orchestrator),
            Arc::clone(&app.admission),
            Arc::clone(&app.party),
            Arc::clone(&app.push),
        );
        Fixture {
            router,
            players: Arc::clone(&app.players),
            party: Arc::clone(&app.party),
        }
    }

    async fn connect(f: &Fixture, id: &str) {
        f.router
            .handle_command(ClientCommand::Connect {
                player_id: id.to_string(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_then_solo_matchmaking() {
        let f = fixture();
        connect(&f, "alice").await;

        f.router
            .handle_command(ClientCommand::EnterMatchmaking {
                player_id: "alice".to_string(),
                queue: "standard".to_string(),
                criteria: SearchCriteria::default(),
                pings: HashMap::from([("s1".to_string(), 30)]),
            })
            .await
            .unwrap();

        assert_eq!(
            f.players.state(&"alice".to_string()).unwrap(),
            Some(PlayerState::Matchmaking)
        );
    }

    #[tokio::test]
    async fn test_party_member_matchmaking_is_leader_gated() {
        let f = fixture();
        connect(&f, "alice").await;
        connect(&f, "bob").await;

        let party_id = f
            .party
            .create_party(&"alice".to_string(), PartyPrivacy::Open)
            .unwrap();
        f.party
            .join_party(&"bob".to_string(), party_id)
            .await
            .unwrap();

        let enter = |player: &str| ClientCommand::EnterMatchmaking {
            player_id: player.to_string(),
            queue: "standard".to_string(),
            criteria: SearchCriteria::default(),
            pings: HashMap::from([("s1".to_string(), 30)]),
        };
        assert!(f.router.handle_command(enter("bob")).await.is_err());
        f.router.handle_command(enter("alice")).await.unwrap();

        // The whole party is searching now
        for player in ["alice", "bob"] {
            assert_eq!(
                f.players.state(&player.to_string()).unwrap(),
                Some(PlayerState::Matchmaking)
            );
        }
    }

    #[tokio::test]
    async fn test_disconnect_tears_everything_down() {
        let f = fixture();
        connect(&f, "alice").await;
        f.party
            .create_party(&"alice".to_string(), PartyPrivacy::Open)
            .unwrap();

        f.router
            .handle_command(ClientCommand::Disconnect {
                player_id: "alice".to_string(),
            })
            .await
            .unwrap();

        // The record survives as Disconnected so late events can resolve it
        assert_eq!(
            f.players.state(&"alice".to_string()).unwrap(),
            Some(PlayerState::Disconnected)
        );
        assert_eq!(f.party.party_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_join_reply_without_pending_request_is_harmless() {
        let f = fixture();
        f.router
            .handle_command(ClientCommand::JoinReply {
                player_id: "alice".to_string(),
                correlation_id: "missing".to_string(),
                outcome: crate::types::JoinRequestOutcome::Accepted,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mock_app_reports_healthy() {
        let app = AppState::with_mocks(AppConfig::default()).unwrap();
        let report = app.health_report();
        assert_eq!(
            report.status,
            crate::service::health::HealthStatus::Healthy
        );
    }
}
