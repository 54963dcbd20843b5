//! Prometheus metrics for the matchmaking and admission service

pub mod collector;

pub use collector::MetricsCollector;
