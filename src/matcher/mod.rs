//! Matchmaking core: tickets, quality scoring, the matcher engine, and the
//! orchestrator pass loop
//!
//! Tickets are registered with the [`Matcher`], which proposes matches against
//! live server snapshots. The [`MatchmakingOrchestrator`] drives periodic
//! passes, refreshes snapshots, and hands matched players to admission.

pub mod engine;
pub mod orchestrator;
pub mod scoring;
pub mod ticket;

pub use engine::{MatchProposal, Matcher};
pub use orchestrator::MatchmakingOrchestrator;
pub use ticket::{CompletionSlot, MatchTicket, Resolution, TicketState};
