//! Push delivery to clients: one-way events and join-request round trips

use crate::amqp::messages::{
    join_request_routing_key, player_routing_key, JoinRequest, MessageEnvelope, PUSH_EXCHANGE,
};
use crate::error::{MusterError, Result};
use crate::types::{JoinRequestOutcome, PlayerId, PushEvent, ServerKey};
use amqprs::{
    channel::{BasicPublishArguments, Channel, ExchangeDeclareArguments},
    BasicProperties,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Outbound channel towards clients.
///
/// `notify` is fire-and-forget; `request_join` blocks until the addressed
/// client answers or the timeout elapses.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Deliver a push event to one player
    async fn notify(&self, player_id: &PlayerId, event: PushEvent) -> Result<()>;

    /// Ask one player to join a server and wait for their answer
    async fn request_join(
        &self,
        player_id: &PlayerId,
        server: &ServerKey,
        timeout: Duration,
    ) -> Result<JoinRequestOutcome>;

    /// Resolve a pending join request from an inbound client reply. Channels
    /// that answer join requests inline have nothing pending to resolve.
    fn resolve_join_reply(&self, correlation_id: &str, outcome: JoinRequestOutcome) -> Result<()> {
        let _ = (correlation_id, outcome);
        Ok(())
    }
}

/// AMQP-backed push channel publishing to the push exchange
pub struct AmqpPushChannel {
    channel: Channel,
    /// Join requests awaiting a client reply, keyed by correlation id
    pending: Mutex<HashMap<String, oneshot::Sender<JoinRequestOutcome>>>,
}

impl AmqpPushChannel {
    pub async fn new(channel: Channel) -> Result<Self> {
        let push = Self {
            channel,
            pending: Mutex::new(HashMap::new()),
        };
        push.setup_exchange().await?;
        Ok(push)
    }

    async fn setup_exchange(&self) -> Result<()> {
        let args = ExchangeDeclareArguments::new(PUSH_EXCHANGE, "topic");
        self.channel.exchange_declare(args).await.map_err(|e| {
            MusterError::AmqpConnectionFailed {
                message: format!("Failed to declare push exchange: {}", e),
            }
        })?;
        info!("Declared push exchange {}", PUSH_EXCHANGE);
        Ok(())
    }

    async fn publish<T>(&self, envelope: &MessageEnvelope<T>) -> Result<()>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
    {
        let payload = envelope.to_bytes()?;

        let args = BasicPublishArguments::new(PUSH_EXCHANGE, &envelope.routing_key);
        let mut properties = BasicProperties::default();
        properties
            .with_message_id(&envelope.correlation_id)
            .with_timestamp(envelope.timestamp.timestamp() as u64)
            .with_content_type("application/json");

        self.channel
            .basic_publish(properties, payload, args)
            .await
            .map_err(|e| MusterError::PushFailed {
                message: format!("Failed to publish push message: {}", e),
            })?;

        debug!(
            "Published push message {} to {}",
            envelope.correlation_id, envelope.routing_key
        );
        Ok(())
    }

    fn lock_pending(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<JoinRequestOutcome>>>>
    {
        self.pending.lock().map_err(|_| {
            MusterError::InternalError {
                message: "Failed to acquire pending join requests lock".to_string(),
            }
            .into()
        })
    }
}

#[async_trait]
impl PushChannel for AmqpPushChannel {
    async fn notify(&self, player_id: &PlayerId, event: PushEvent) -> Result<()> {
        let envelope = MessageEnvelope::new(event, player_routing_key(player_id));
        self.publish(&envelope).await
    }

    async fn request_join(
        &self,
        player_id: &PlayerId,
        server: &ServerKey,
        timeout: Duration,
    ) -> Result<JoinRequestOutcome> {
        let request = JoinRequest {
            server: server.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };
        let envelope = MessageEnvelope::new(request, join_request_routing_key(player_id));
        let correlation_id = envelope.correlation_id.clone();

        let (sender, receiver) = oneshot::channel();
        self.lock_pending()?.insert(correlation_id.clone(), sender);

        if let Err(e) = self.publish(&envelope).await {
            self.lock_pending()?.remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(outcome)) => Ok(outcome),
            // Sender dropped without an answer; treat as a timeout
            Ok(Err(_)) => Ok(JoinRequestOutcome::TimedOut),
            Err(_) => {
                self.lock_pending()?.remove(&correlation_id);
                Ok(JoinRequestOutcome::TimedOut)
            }
        }
    }

    /// Resolve a pending join request from an inbound `JoinReply` command.
    /// Late replies (after timeout) are dropped with a warning.
    fn resolve_join_reply(&self, correlation_id: &str, outcome: JoinRequestOutcome) -> Result<()> {
        let sender = {
            let mut pending = self.lock_pending()?;
            pending.remove(correlation_id)
        };
        match sender {
            Some(sender) => {
                // Receiver may have timed out between removal and send
                let _ = sender.send(outcome);
            }
            None => {
                warn!("Join reply for unknown correlation id {}", correlation_id);
            }
        }
        Ok(())
    }
}

/// In-memory push channel for tests: records every event and answers join
/// requests from a script (default Accepted).
#[derive(Debug, Default)]
pub struct MockPushChannel {
    events: Mutex<Vec<(PlayerId, PushEvent)>>,
    join_scripts: Mutex<HashMap<PlayerId, Vec<JoinRequestOutcome>>>,
}

impl MockPushChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue up join-request answers for one player, consumed in order
    pub fn script_join_outcomes(&self, player_id: &PlayerId, outcomes: &[JoinRequestOutcome]) {
        if let Ok(mut scripts) = self.join_scripts.lock() {
            scripts
                .entry(player_id.clone())
                .or_default()
                .extend_from_slice(outcomes);
        }
    }

    /// All events delivered so far, in order
    pub fn events(&self) -> Vec<(PlayerId, PushEvent)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events delivered to one player
    pub fn events_for(&self, player_id: &PlayerId) -> Vec<PushEvent> {
        self.events()
            .into_iter()
            .filter(|(p, _)| p == player_id)
            .map(|(_, e)| e)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl PushChannel for MockPushChannel {
    async fn notify(&self, player_id: &PlayerId, event: PushEvent) -> Result<()> {
        if let Ok(mut events) = self.events.lock() {
            events.push((player_id.clone(), event));
        }
        Ok(())
    }

    async fn request_join(
        &self,
        player_id: &PlayerId,
        _server: &ServerKey,
        _timeout: Duration,
    ) -> Result<JoinRequestOutcome> {
        let scripted = self
            .join_scripts
            .lock()
            .ok()
            .and_then(|mut scripts| {
                scripts.get_mut(player_id).and_then(|outcomes| {
                    if outcomes.is_empty() {
                        None
                    } else {
                        Some(outcomes.remove(0))
                    }
                })
            });
        Ok(scripted.unwrap_or(JoinRequestOutcome::Accepted))
    }
}
