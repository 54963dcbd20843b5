//! A single party and its membership bookkeeping

use crate::types::{PartyId, PartyPrivacy, PlayerId};
use crate::utils::{current_timestamp, generate_party_id};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// A pending invite. The generation tags the invite so a delayed expiry task
/// never removes a newer invite issued to the same player.
#[derive(Debug, Clone)]
pub struct Invite {
    pub from: PlayerId,
    pub expires_at: DateTime<Utc>,
    pub generation: u64,
}

impl Invite {
    pub fn is_live(&self) -> bool {
        self.expires_at > current_timestamp()
    }
}

/// A leader-led group of players
#[derive(Debug, Clone)]
pub struct Party {
    pub id: PartyId,
    pub privacy: PartyPrivacy,
    pub leader: PlayerId,
    pub members: Vec<PlayerId>,
    pub invites: HashMap<PlayerId, Invite>,
    pub created_at: DateTime<Utc>,
}

impl Party {
    pub fn new(leader: PlayerId, privacy: PartyPrivacy) -> Self {
        Self {
            id: generate_party_id(),
            privacy,
            leader: leader.clone(),
            members: vec![leader],
            invites: HashMap::new(),
            created_at: current_timestamp(),
        }
    }

    pub fn contains(&self, player_id: &PlayerId) -> bool {
        self.members.iter().any(|m| m == player_id)
    }

    pub fn is_leader(&self, player_id: &PlayerId) -> bool {
        &self.leader == player_id
    }

    pub fn add_member(&mut self, player_id: &PlayerId) -> bool {
        if self.contains(player_id) {
            return false;
        }
        self.members.push(player_id.clone());
        true
    }

    /// Remove a member. If the leader left and members remain, leadership
    /// passes to the longest-standing member; returns the new leader.
    pub fn remove_member(&mut self, player_id: &PlayerId) -> Option<PlayerId> {
        self.members.retain(|m| m != player_id);
        self.invites.remove(player_id);
        if self.is_leader(player_id) {
            if let Some(next) = self.members.first() {
                self.leader = next.clone();
                return Some(next.clone());
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// A live (unexpired) invite for the player, if any
    pub fn live_invite(&self, player_id: &PlayerId) -> Option<&Invite> {
        self.invites.get(player_id).filter(|i| i.is_live())
    }

    /// Consume the player's invite if it is still live
    pub fn take_live_invite(&mut self, player_id: &PlayerId) -> Option<Invite> {
        if self.live_invite(player_id).is_none() {
            self.invites.remove(player_id);
            return None;
        }
        self.invites.remove(player_id)
    }
}
