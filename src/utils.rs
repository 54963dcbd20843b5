//! Utility functions for the matchmaking and admission service

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Generate a new unique ticket ID
pub fn generate_ticket_id() -> Uuid {
    Uuid::new_v4()
}

/// Generate a new unique party ID
pub fn generate_party_id() -> Uuid {
    Uuid::new_v4()
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Whole seconds elapsed since `since`, clamped at zero
pub fn elapsed_seconds(since: DateTime<Utc>) -> i64 {
    (current_timestamp() - since).num_seconds().max(0)
}
