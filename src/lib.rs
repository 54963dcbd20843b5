//! Muster Point - Matchmaking and admission service for game servers
//!
//! This crate provides AMQP-driven matchmaking with quality-scored server
//! selection, per-destination admission queues with join retries, and
//! leader-led parties that match and join as one unit.

pub mod admission;
pub mod amqp;
pub mod config;
pub mod error;
pub mod matcher;
pub mod metrics;
pub mod party;
pub mod player;
pub mod remote;
pub mod service;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{MusterError, Result};
pub use types::*;

// Re-export key components
pub use admission::AdmissionController;
pub use amqp::publisher::PushChannel;
pub use matcher::{Matcher, MatchmakingOrchestrator};
pub use party::PartyCoordinator;
pub use player::PlayerRegistry;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
