//! Parties: leader-led groups that match and join servers as one unit

pub mod coordinator;
pub mod instance;

pub use coordinator::PartyCoordinator;
pub use instance::{Invite, Party};
