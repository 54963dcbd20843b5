//! Server admission: per-destination queues, slot reservation, and join
//! supervision
//!
//! Every destination server gets one [`Destination`] record and at most one
//! polling task. The task refreshes the server snapshot, reconciles in-flight
//! joins against the live roster, and hands out join requests while capacity
//! remains. The [`AdmissionController`] owns the destination map and the
//! lifecycle of the polling tasks.

pub mod controller;
pub mod destination;

pub use controller::AdmissionController;
pub use destination::{Destination, ProcessingState};
