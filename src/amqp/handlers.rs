//! Inbound command consumption from the command queue

use crate::amqp::messages::{ClientCommand, MessageEnvelope};
use crate::error::{MusterError, Result};
use amqprs::{
    channel::{BasicCancelArguments, BasicConsumeArguments, Channel, QueueDeclareArguments},
    consumer::AsyncConsumer,
    BasicProperties, Deliver,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Dispatcher for validated client commands
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle_command(&self, command: ClientCommand) -> Result<()>;

    /// Called when a delivery cannot be decoded or dispatch fails
    async fn handle_error(&self, error: MusterError, message_data: &[u8]);
}

/// Consumer wiring for the command queue
pub struct CommandConsumer {
    handler: Arc<dyn CommandHandler>,
    channel: Channel,
    consumer_tag: String,
}

impl CommandConsumer {
    pub fn new(handler: Arc<dyn CommandHandler>, channel: Channel) -> Self {
        let consumer_tag = format!("command-consumer-{}", uuid::Uuid::new_v4());
        Self {
            handler,
            channel,
            consumer_tag,
        }
    }

    /// Declare the queue and start consuming commands from it
    pub async fn start_consuming(&self, queue_name: &str) -> Result<()> {
        let declare = QueueDeclareArguments::durable_client_named(queue_name);
        self.channel.queue_declare(declare).await.map_err(|e| {
            MusterError::AmqpConnectionFailed {
                message: format!("Failed to declare command queue: {}", e),
            }
        })?;

        let args = BasicConsumeArguments::new(queue_name, &self.consumer_tag);
        self.channel
            .basic_consume(CommandDispatcher::new(self.handler.clone()), args)
            .await
            .map_err(|e| MusterError::AmqpConnectionFailed {
                message: format!("Failed to start consuming: {}", e),
            })?;

        info!("Consuming commands from queue {}", queue_name);
        Ok(())
    }

    pub async fn stop_consuming(&self) -> Result<()> {
        let args = BasicCancelArguments::new(&self.consumer_tag);
        self.channel.basic_cancel(args).await.map_err(|e| {
            MusterError::AmqpConnectionFailed {
                message: format!("Failed to stop consuming: {}", e),
            }
        })?;

        info!("Stopped consuming commands");
        Ok(())
    }
}

struct CommandDispatcher {
    handler: Arc<dyn CommandHandler>,
}

impl CommandDispatcher {
    fn new(handler: Arc<dyn CommandHandler>) -> Self {
        Self { handler }
    }

    async fn process(&self, content: &[u8]) -> Result<()> {
        let envelope: MessageEnvelope<ClientCommand> = MessageEnvelope::from_bytes(content)?;
        envelope.payload.validate()?;

        debug!(
            "Dispatching command from '{}' (correlation {})",
            envelope.payload.sender(),
            envelope.correlation_id
        );
        self.handler.handle_command(envelope.payload).await
    }
}

#[async_trait]
impl AsyncConsumer for CommandDispatcher {
    async fn consume(
        &mut self,
        _channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        let delivery_tag = deliver.delivery_tag();
        debug!(
            "Command received - delivery_tag: {}, size: {} bytes",
            delivery_tag,
            content.len()
        );

        if let Err(e) = self.process(&content).await {
            error!(
                "Command processing failed - delivery_tag: {}, error: {}",
                delivery_tag, e
            );
            self.handler
                .handle_error(
                    MusterError::InternalError {
                        message: e.to_string(),
                    },
                    &content,
                )
                .await;
        }
    }
}

/// Command handler that records everything it sees, for tests
pub struct MockCommandHandler {
    pub received: Arc<tokio::sync::Mutex<Vec<ClientCommand>>>,
}

impl Default for MockCommandHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCommandHandler {
    pub fn new() -> Self {
        Self {
            received: Arc::new(tokio::sync::Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl CommandHandler for MockCommandHandler {
    async fn handle_command(&self, command: ClientCommand) -> Result<()> {
        let mut received = self.received.lock().await;
        received.push(command);
        Ok(())
    }

    async fn handle_error(&self, error: MusterError, _message_data: &[u8]) {
        eprintln!("Mock handler received error: {}", error);
    }
}
