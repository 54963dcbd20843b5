//! Per-destination admission state

use crate::error::{MusterError, Result};
use crate::types::{PlayerId, ServerKey, ServerSnapshot};
use crate::utils::current_timestamp;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Lifecycle of a destination's polling task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    /// No polling task is running
    Stopped,
    /// Task is running and the destination has work
    Running,
    /// Task is running but the destination has been empty for a while
    Idle,
    /// Administratively halted; new joins do not restart the task
    Paused,
}

/// Handle to a spawned polling task, for cancellation on halt or destroy
pub struct LoopHandle {
    pub cancel: watch::Sender<bool>,
    pub handle: JoinHandle<()>,
}

#[derive(Debug)]
struct DestinationInner {
    snapshot: Option<ServerSnapshot>,
    /// Slots promised to in-flight joins but not yet visible in the snapshot
    reserved: u32,
    queue: VecDeque<PlayerId>,
    /// Players we sent to the server and are waiting to see on the roster
    joining: Vec<PlayerId>,
    state: ProcessingState,
    idle_since: Option<DateTime<Utc>>,
    consecutive_probe_failures: u32,
}

/// One destination server with its admission queue and reservation counter
pub struct Destination {
    pub key: ServerKey,
    pub created_at: DateTime<Utc>,
    inner: Mutex<DestinationInner>,
    /// Slot for the single polling task; guarded separately so task
    /// management never contends with queue operations
    pub(crate) task: tokio::sync::Mutex<Option<LoopHandle>>,
}

impl Destination {
    pub fn new(key: ServerKey) -> Self {
        Self {
            key,
            created_at: current_timestamp(),
            inner: Mutex::new(DestinationInner {
                snapshot: None,
                reserved: 0,
                queue: VecDeque::new(),
                joining: Vec::new(),
                state: ProcessingState::Stopped,
                idle_since: None,
                consecutive_probe_failures: 0,
            }),
            task: tokio::sync::Mutex::new(None),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, DestinationInner>> {
        self.inner.lock().map_err(|_| {
            MusterError::InternalError {
                message: format!("Destination lock poisoned for {}", self.key),
            }
            .into()
        })
    }

    /// Append a player to the queue; returns their 1-based position, or None
    /// if they are already queued or joining here
    pub fn enqueue(&self, player_id: &PlayerId) -> Result<Option<usize>> {
        let mut inner = self.lock()?;
        if inner.queue.contains(player_id) || inner.joining.contains(player_id) {
            return Ok(None);
        }
        inner.queue.push_back(player_id.clone());
        Ok(Some(inner.queue.len()))
    }

    /// Put a player back at the head of the queue after a failed attempt
    pub fn requeue_front(&self, player_id: &PlayerId) -> Result<()> {
        let mut inner = self.lock()?;
        inner.joining.retain(|p| p != player_id);
        if !inner.queue.contains(player_id) {
            inner.queue.push_front(player_id.clone());
        }
        Ok(())
    }

    /// Remove a player from the queue and the joining set. Returns true if
    /// the player held a reservation, which this call releases.
    pub fn remove(&self, player_id: &PlayerId) -> Result<bool> {
        let mut inner = self.lock()?;
        inner.queue.retain(|p| p != player_id);
        let was_joining = inner.joining.iter().any(|p| p == player_id);
        if was_joining {
            inner.joining.retain(|p| p != player_id);
            inner.reserved = inner.reserved.saturating_sub(1);
        }
        Ok(was_joining)
    }

    /// Pop the head of the queue if a free unreserved slot exists
    pub fn pop_if_capacity(&self) -> Result<Option<PlayerId>> {
        let mut inner = self.lock()?;
        let Some(snapshot) = inner.snapshot else {
            return Ok(None);
        };
        if snapshot.free_slots.saturating_sub(inner.reserved) < 1 {
            return Ok(None);
        }
        Ok(inner.queue.pop_front())
    }

    /// Record a join request acceptance: the player holds a reservation and
    /// moves to the joining set
    pub fn mark_joining(&self, player_id: &PlayerId) -> Result<()> {
        let mut inner = self.lock()?;
        inner.reserved += 1;
        if !inner.joining.contains(player_id) {
            inner.joining.push(player_id.clone());
        }
        Ok(())
    }

    /// Confirm a joining player as physically present, releasing their
    /// reservation. Returns true if the player was in the joining set.
    pub fn confirm(&self, player_id: &PlayerId) -> Result<bool> {
        let mut inner = self.lock()?;
        let was_joining = inner.joining.iter().any(|p| p == player_id);
        if was_joining {
            inner.joining.retain(|p| p != player_id);
            inner.reserved = inner.reserved.saturating_sub(1);
        } else {
            // Self-directed join that never went through the queue
            inner.queue.retain(|p| p != player_id);
        }
        Ok(was_joining)
    }

    pub fn set_snapshot(&self, snapshot: Option<ServerSnapshot>) -> Result<()> {
        let mut inner = self.lock()?;
        match snapshot {
            Some(s) => {
                inner.snapshot = Some(s);
                inner.consecutive_probe_failures = 0;
            }
            None => inner.consecutive_probe_failures += 1,
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Result<Option<ServerSnapshot>> {
        Ok(self.lock()?.snapshot)
    }

    pub fn probe_failures(&self) -> Result<u32> {
        Ok(self.lock()?.consecutive_probe_failures)
    }

    pub fn queued_players(&self) -> Result<Vec<PlayerId>> {
        Ok(self.lock()?.queue.iter().cloned().collect())
    }

    pub fn joining_players(&self) -> Result<Vec<PlayerId>> {
        Ok(self.lock()?.joining.clone())
    }

    /// 1-based queue position of a player, if queued
    pub fn position_of(&self, player_id: &PlayerId) -> Result<Option<usize>> {
        Ok(self
            .lock()?
            .queue
            .iter()
            .position(|p| p == player_id)
            .map(|i| i + 1))
    }

    pub fn is_empty(&self) -> Result<bool> {
        let inner = self.lock()?;
        Ok(inner.queue.is_empty() && inner.joining.is_empty())
    }

    pub fn queue_len(&self) -> Result<usize> {
        Ok(self.lock()?.queue.len())
    }

    pub fn reserved(&self) -> Result<u32> {
        Ok(self.lock()?.reserved)
    }

    pub fn state(&self) -> Result<ProcessingState> {
        Ok(self.lock()?.state)
    }

    pub fn set_state(&self, state: ProcessingState) -> Result<()> {
        let mut inner = self.lock()?;
        inner.state = state;
        if state != ProcessingState::Idle {
            inner.idle_since = None;
        } else if inner.idle_since.is_none() {
            inner.idle_since = Some(current_timestamp());
        }
        Ok(())
    }

    /// Seconds the destination has been idle, or None if not idle
    pub fn idle_seconds(&self) -> Result<Option<i64>> {
        Ok(self
            .lock()?
            .idle_since
            .map(crate::utils::elapsed_seconds))
    }
}
