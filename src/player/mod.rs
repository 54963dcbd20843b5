//! Player records and the shared player registry
//!
//! Players are referenced by id everywhere else in the service; the registry
//! is the single owner of player state transitions.

pub mod registry;

pub use registry::{Player, PlayerRegistry};
