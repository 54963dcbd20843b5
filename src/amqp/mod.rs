//! AMQP integration: broker connection, command consumption, and push delivery
//!
//! Clients talk to the service over a single command queue and receive push
//! events on a per-player routing key. Join requests are a request/reply pair
//! correlated by envelope id.

pub mod connection;
pub mod handlers;
pub mod messages;
pub mod publisher;

pub use connection::AmqpConnection;
pub use handlers::{CommandConsumer, CommandHandler};
pub use messages::{ClientCommand, JoinRequest, MessageEnvelope};
pub use publisher::{AmqpPushChannel, MockPushChannel, PushChannel};
