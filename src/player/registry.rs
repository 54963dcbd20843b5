//! The player registry: an id-keyed arena for all known players
//!
//! Cross-entity references (ticket members, admission queues, party members)
//! are plain ids resolved through this registry, so removing a player is a
//! single map operation rather than graph surgery. All observable state
//! transitions on a player happen under the registry lock.

use crate::error::{MusterError, Result};
use crate::types::{PartyId, PlayerId, PlayerState, ServerKey};
use crate::utils::current_timestamp;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A connected (or recently connected) player
#[derive(Debug, Clone)]
pub struct Player {
    pub id: PlayerId,
    pub state: PlayerState,
    /// Ordered timestamps of join attempts on the current destination
    pub join_attempts: Vec<DateTime<Utc>>,
    /// When the player entered their current admission queue
    pub queued_at: Option<DateTime<Utc>>,
    /// The destination the player is queued on, joining, or joined to
    pub destination: Option<ServerKey>,
    /// Current party membership
    pub party: Option<PartyId>,
    pub connected_at: DateTime<Utc>,
}

impl Player {
    fn new(id: PlayerId) -> Self {
        Self {
            id,
            state: PlayerState::Connected,
            join_attempts: Vec::new(),
            queued_at: None,
            destination: None,
            party: None,
            connected_at: current_timestamp(),
        }
    }

    /// Whether the player is already tied up in matching or admission
    pub fn is_busy(&self) -> bool {
        matches!(
            self.state,
            PlayerState::Matchmaking | PlayerState::Queued | PlayerState::Joining
        )
    }

    /// Whether the player can start a new matching or queue request
    pub fn is_available(&self) -> bool {
        matches!(self.state, PlayerState::Connected | PlayerState::Joined)
    }
}

/// Thread-safe registry of all known players
#[derive(Debug, Default)]
pub struct PlayerRegistry {
    players: RwLock<HashMap<PlayerId, Player>>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<PlayerId, Player>>> {
        self.players
            .read()
            .map_err(|_| {
                MusterError::InternalError {
                    message: "Failed to acquire player registry lock".to_string(),
                }
                .into()
            })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<PlayerId, Player>>> {
        self.players
            .write()
            .map_err(|_| {
                MusterError::InternalError {
                    message: "Failed to acquire player registry lock".to_string(),
                }
                .into()
            })
    }

    /// Register a player as connected, resetting any stale per-session state
    pub fn connect(&self, player_id: &PlayerId) -> Result<()> {
        let mut players = self.write()?;
        players
            .entry(player_id.clone())
            .and_modify(|p| {
                p.state = PlayerState::Connected;
                p.join_attempts.clear();
                p.queued_at = None;
                p.destination = None;
                p.connected_at = current_timestamp();
            })
            .or_insert_with(|| Player::new(player_id.clone()));
        Ok(())
    }

    /// Mark a player disconnected; id stays known so late events can resolve it
    pub fn disconnect(&self, player_id: &PlayerId) -> Result<()> {
        let mut players = self.write()?;
        if let Some(player) = players.get_mut(player_id) {
            player.state = PlayerState::Disconnected;
            player.join_attempts.clear();
            player.queued_at = None;
            player.destination = None;
        }
        Ok(())
    }

    /// Snapshot of a player record
    pub fn get(&self, player_id: &PlayerId) -> Result<Option<Player>> {
        Ok(self.read()?.get(player_id).cloned())
    }

    /// Current state, if the player is known
    pub fn state(&self, player_id: &PlayerId) -> Result<Option<PlayerState>> {
        Ok(self.read()?.get(player_id).map(|p| p.state))
    }

    /// Set a player's state without touching any other field
    pub fn set_state(&self, player_id: &PlayerId, state: PlayerState) -> Result<()> {
        let mut players = self.write()?;
        let player = players
            .get_mut(player_id)
            .ok_or_else(|| MusterError::PlayerNotFound {
                player_id: player_id.clone(),
            })?;
        player.state = state;
        Ok(())
    }

    /// Transition into an admission queue for `server`
    pub fn mark_queued(&self, player_id: &PlayerId, server: &ServerKey) -> Result<()> {
        let mut players = self.write()?;
        let player = players
            .get_mut(player_id)
            .ok_or_else(|| MusterError::PlayerNotFound {
                player_id: player_id.clone(),
            })?;
        player.state = PlayerState::Queued;
        player.queued_at = Some(current_timestamp());
        player.destination = Some(server.clone());
        player.join_attempts.clear();
        Ok(())
    }

    /// Record a join attempt and transition to Joining
    pub fn mark_joining(&self, player_id: &PlayerId) -> Result<()> {
        let mut players = self.write()?;
        let player = players
            .get_mut(player_id)
            .ok_or_else(|| MusterError::PlayerNotFound {
                player_id: player_id.clone(),
            })?;
        player.state = PlayerState::Joining;
        player.join_attempts.push(current_timestamp());
        Ok(())
    }

    /// Demote a Joining player back to Queued, keeping attempt history
    pub fn mark_requeued(&self, player_id: &PlayerId) -> Result<()> {
        self.set_state(player_id, PlayerState::Queued)
    }

    /// Confirm physical occupancy; queue bookkeeping is cleared
    pub fn mark_joined(&self, player_id: &PlayerId) -> Result<()> {
        let mut players = self.write()?;
        let player = players
            .get_mut(player_id)
            .ok_or_else(|| MusterError::PlayerNotFound {
                player_id: player_id.clone(),
            })?;
        player.state = PlayerState::Joined;
        player.queued_at = None;
        player.join_attempts.clear();
        Ok(())
    }

    /// Return a player to Connected, clearing all matching/queue bookkeeping
    pub fn release(&self, player_id: &PlayerId) -> Result<()> {
        let mut players = self.write()?;
        if let Some(player) = players.get_mut(player_id) {
            if player.state != PlayerState::Disconnected {
                player.state = PlayerState::Connected;
            }
            player.queued_at = None;
            player.destination = None;
            player.join_attempts.clear();
        }
        Ok(())
    }

    /// Reset a player's attempt history (used when a full server cleared up)
    pub fn clear_attempts(&self, player_id: &PlayerId) -> Result<()> {
        let mut players = self.write()?;
        if let Some(player) = players.get_mut(player_id) {
            player.join_attempts.clear();
        }
        Ok(())
    }

    /// Set or clear party membership
    pub fn set_party(&self, player_id: &PlayerId, party: Option<PartyId>) -> Result<()> {
        let mut players = self.write()?;
        let player = players
            .get_mut(player_id)
            .ok_or_else(|| MusterError::PlayerNotFound {
                player_id: player_id.clone(),
            })?;
        player.party = party;
        Ok(())
    }

    /// Party the player currently belongs to
    pub fn party_of(&self, player_id: &PlayerId) -> Result<Option<PartyId>> {
        Ok(self.read()?.get(player_id).and_then(|p| p.party))
    }

    /// Destination the player is currently queued on or joining
    pub fn destination_of(&self, player_id: &PlayerId) -> Result<Option<ServerKey>> {
        Ok(self.read()?.get(player_id).and_then(|p| p.destination.clone()))
    }

    /// Number of registered players currently in the given state
    pub fn count_in_state(&self, state: PlayerState) -> Result<usize> {
        Ok(self.read()?.values().filter(|p| p.state == state).count())
    }
}
