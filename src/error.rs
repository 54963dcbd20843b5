//! Error types for the matchmaking and admission service
//!
//! This module defines all error types using anyhow for consistent error handling
//! throughout the application.

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Custom error types for specific matchmaking and admission scenarios
#[derive(Debug, thiserror::Error)]
pub enum MusterError {
    #[error("AMQP connection failed: {message}")]
    AmqpConnectionFailed { message: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Player not found: {player_id}")]
    PlayerNotFound { player_id: String },

    #[error("Player is busy: {player_id} is {state}")]
    PlayerBusy { player_id: String, state: String },

    #[error("Ticket not found: {ticket_id}")]
    TicketNotFound { ticket_id: String },

    #[error("Destination not found: {server}")]
    DestinationNotFound { server: String },

    #[error("Party not found: {party_id}")]
    PartyNotFound { party_id: String },

    #[error("Not authorized: {reason}")]
    NotAuthorized { reason: String },

    #[error("Push delivery failed: {message}")]
    PushFailed { message: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}
