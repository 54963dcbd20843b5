//! Service assembly: component wiring, command routing, and the HTTP
//! health/metrics surface

pub mod app;
pub mod health;

pub use app::{AppState, CommandRouter, ServiceError};
pub use health::{HealthCheck, HealthServer, HealthServerConfig, HealthStatus, ServiceStats};
