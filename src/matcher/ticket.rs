//! Matchmaking tickets and their single-assignment completion slots

use crate::error::{MusterError, Result};
use crate::types::{
    MatchInfo, MatchPreview, PlayerId, RemovalReason, SearchCriteria, ServerKey, TicketId,
};
use crate::utils::{current_timestamp, generate_ticket_id};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Terminal outcome of a ticket
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Matched(MatchInfo),
    Cancelled(RemovalReason),
}

/// A result slot that can be assigned exactly once.
///
/// Competing match passes race to resolve the same ticket; `try_resolve`
/// reports whether *this* caller won, so the losing path can discard its
/// candidate without treating the race as an error.
#[derive(Debug, Default)]
pub struct CompletionSlot {
    slot: Mutex<Option<Resolution>>,
}

impl CompletionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the slot directly. Used by multi-ticket commits that must hold
    /// several slots at once; callers acquire guards in ascending ticket-id
    /// order to stay deadlock-free.
    pub fn lock(&self) -> Result<MutexGuard<'_, Option<Resolution>>> {
        self.slot.lock().map_err(|_| {
            MusterError::InternalError {
                message: "Completion slot lock poisoned".to_string(),
            }
            .into()
        })
    }

    /// Attempt to resolve the slot; returns true iff this call won
    pub fn try_resolve(&self, resolution: Resolution) -> Result<bool> {
        let mut slot = self.lock()?;
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(resolution);
        Ok(true)
    }

    /// Current resolution, if any
    pub fn get(&self) -> Result<Option<Resolution>> {
        Ok(self.lock()?.clone())
    }

    pub fn is_resolved(&self) -> Result<bool> {
        Ok(self.lock()?.is_some())
    }
}

/// Mutable per-pass state of a ticket
#[derive(Debug, Clone)]
pub struct TicketState {
    /// Players searching together on this ticket
    pub members: Vec<PlayerId>,
    /// Candidate servers mapped to last-known ping in milliseconds
    pub pings: HashMap<ServerKey, i32>,
    /// Shared search preferences
    pub criteria: SearchCriteria,
    /// The member allowed to update shared criteria
    pub initiator: PlayerId,
    /// Full matcher passes this ticket has survived
    pub search_attempts: u32,
    /// Currently computable, non-binding matches for client preview
    pub previews: Vec<MatchPreview>,
}

/// One or more players queued together with shared preferences
#[derive(Debug)]
pub struct MatchTicket {
    pub id: TicketId,
    pub created_at: DateTime<Utc>,
    /// Which queue the ticket was opened for (e.g. game mode)
    pub queue: String,
    state: Mutex<TicketState>,
    completion: CompletionSlot,
}

impl MatchTicket {
    pub fn new(
        initiator: PlayerId,
        members: Vec<PlayerId>,
        queue: String,
        criteria: SearchCriteria,
        pings: HashMap<ServerKey, i32>,
    ) -> Self {
        Self {
            id: generate_ticket_id(),
            created_at: current_timestamp(),
            queue,
            state: Mutex::new(TicketState {
                members,
                pings,
                criteria,
                initiator,
                search_attempts: 0,
                previews: Vec::new(),
            }),
            completion: CompletionSlot::new(),
        }
    }

    pub fn completion(&self) -> &CompletionSlot {
        &self.completion
    }

    /// Clone of the current ticket state
    pub fn snapshot(&self) -> Result<TicketState> {
        Ok(self.lock_state()?.clone())
    }

    /// Run a closure with mutable access to the ticket state
    pub fn with_state_mut<R>(&self, f: impl FnOnce(&mut TicketState) -> R) -> Result<R> {
        let mut state = self.lock_state()?;
        Ok(f(&mut state))
    }

    pub fn members(&self) -> Result<Vec<PlayerId>> {
        Ok(self.lock_state()?.members.clone())
    }

    pub fn member_count(&self) -> Result<usize> {
        Ok(self.lock_state()?.members.len())
    }

    pub fn contains(&self, player_id: &PlayerId) -> Result<bool> {
        Ok(self.lock_state()?.members.iter().any(|m| m == player_id))
    }

    /// Remove a member; returns the remaining member count, or None if the
    /// player was not on this ticket
    pub fn remove_member(&self, player_id: &PlayerId) -> Result<Option<usize>> {
        let mut state = self.lock_state()?;
        let before = state.members.len();
        state.members.retain(|m| m != player_id);
        if state.members.len() == before {
            return Ok(None);
        }
        // The criteria-update role falls to the oldest remaining member when
        // the initiator walks away.
        if &state.initiator == player_id {
            if let Some(next) = state.members.first() {
                state.initiator = next.clone();
            }
        }
        Ok(Some(state.members.len()))
    }

    /// Seconds this ticket has been waiting
    pub fn wait_seconds(&self) -> f64 {
        crate::utils::elapsed_seconds(self.created_at) as f64
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, TicketState>> {
        self.state.lock().map_err(|_| {
            MusterError::InternalError {
                message: "Ticket state lock poisoned".to_string(),
            }
            .into()
        })
    }
}
