//! Party coordination: membership, invites, and party-wide actions
//!
//! All membership state lives under one map lock. Anything that awaits
//! (push delivery, friendship checks, ticket teardown) runs after the lock
//! is dropped, on membership lists collected under it.

use crate::admission::AdmissionController;
use crate::amqp::publisher::PushChannel;
use crate::error::{MusterError, Result};
use crate::matcher::MatchmakingOrchestrator;
use crate::metrics::MetricsCollector;
use crate::party::instance::{Invite, Party};
use crate::player::PlayerRegistry;
use crate::remote::FriendshipVerifier;
use crate::types::{
    PartyId, PartyPrivacy, PlayerId, PushEvent, RemovalReason, SearchCriteria, ServerKey, TicketId,
};
use crate::utils::current_timestamp;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};

pub struct PartyCoordinator {
    players: Arc<PlayerRegistry>,
    push: Arc<dyn PushChannel>,
    verifier: Arc<dyn FriendshipVerifier>,
    orchestrator: Arc<MatchmakingOrchestrator>,
    admission: Arc<AdmissionController>,
    metrics: Arc<MetricsCollector>,
    invite_ttl: Duration,
    parties: RwLock<HashMap<PartyId, Party>>,
    invite_generation: AtomicU64,
}

impl PartyCoordinator {
    pub fn new(
        players: Arc<PlayerRegistry>,
        push: Arc<dyn PushChannel>,
        verifier: Arc<dyn FriendshipVerifier>,
        orchestrator: Arc<MatchmakingOrchestrator>,
        admission: Arc<AdmissionController>,
        metrics: Arc<MetricsCollector>,
        invite_ttl: Duration,
    ) -> Self {
        Self {
            players,
            push,
            verifier,
            orchestrator,
            admission,
            metrics,
            invite_ttl,
            parties: RwLock::new(HashMap::new()),
            invite_generation: AtomicU64::new(0),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<PartyId, Party>>> {
        self.parties.read().map_err(|_| {
            MusterError::InternalError {
                message: "Failed to acquire party map lock".to_string(),
            }
            .into()
        })
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<PartyId, Party>>> {
        self.parties.write().map_err(|_| {
            MusterError::InternalError {
                message: "Failed to acquire party map lock".to_string(),
            }
            .into()
        })
    }

    pub fn get(&self, party_id: PartyId) -> Result<Option<Party>> {
        Ok(self.read()?.get(&party_id).cloned())
    }

    pub fn party_count(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    /// The party a player belongs to, via the registry's membership pointer
    fn party_of(&self, player_id: &PlayerId) -> Result<Option<Party>> {
        let Some(party_id) = self.players.party_of(player_id)? else {
            return Ok(None);
        };
        self.get(party_id)
    }

    fn require_party_of(&self, player_id: &PlayerId) -> Result<Party> {
        self.party_of(player_id)?.ok_or_else(|| {
            MusterError::PartyNotFound {
                party_id: format!("no party for {}", player_id),
            }
            .into()
        })
    }

    fn require_leader(&self, player_id: &PlayerId) -> Result<Party> {
        let party = self.require_party_of(player_id)?;
        if !party.is_leader(player_id) {
            return Err(MusterError::NotAuthorized {
                reason: format!("{} is not the party leader", player_id),
            }
            .into());
        }
        Ok(party)
    }

    pub fn create_party(&self, leader: &PlayerId, privacy: PartyPrivacy) -> Result<PartyId> {
        let player = self
            .players
            .get(leader)?
            .ok_or_else(|| MusterError::PlayerNotFound {
                player_id: leader.clone(),
            })?;
        if player.party.is_some() {
            return Err(MusterError::InvalidRequest {
                reason: format!("{} is already in a party", leader),
            }
            .into());
        }

        let party = Party::new(leader.clone(), privacy);
        let party_id = party.id;
        self.write()?.insert(party_id, party);
        self.players.set_party(leader, Some(party_id))?;
        self.metrics.record_party_created();
        info!("Party {} created by {}", party_id, leader);
        Ok(party_id)
    }

    /// Leader-only: invite a player; the invite expires after the
    /// configured TTL
    pub async fn invite(self: &Arc<Self>, sender: &PlayerId, target: &PlayerId) -> Result<()> {
        let party = self.require_leader(sender)?;
        if self.players.get(target)?.is_none() {
            return Err(MusterError::PlayerNotFound {
                player_id: target.clone(),
            }
            .into());
        }
        if party.contains(target) {
            return Err(MusterError::InvalidRequest {
                reason: format!("{} is already in the party", target),
            }
            .into());
        }

        let generation = self.invite_generation.fetch_add(1, Ordering::Relaxed);
        let expires_at = current_timestamp()
            + chrono::Duration::seconds(self.invite_ttl.as_secs() as i64);
        let invite = Invite {
            from: sender.clone(),
            expires_at,
            generation,
        };

        {
            let mut parties = self.write()?;
            let Some(party) = parties.get_mut(&party.id) else {
                return Err(MusterError::PartyNotFound {
                    party_id: party.id.to_string(),
                }
                .into());
            };
            party.invites.insert(target.clone(), invite);
        }

        self.metrics.record_invite_sent();
        self.push
            .notify(
                target,
                PushEvent::InviteReceived {
                    party_id: party.id,
                    from: sender.clone(),
                    expires_at,
                },
            )
            .await?;

        self.spawn_invite_expiry(party.id, target.clone(), generation);
        Ok(())
    }

    /// After the TTL, drop the invite unless it was consumed or re-issued
    fn spawn_invite_expiry(self: &Arc<Self>, party_id: PartyId, target: PlayerId, generation: u64) {
        let coordinator = Arc::clone(self);
        let ttl = self.invite_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;

            let expired = {
                let Ok(mut parties) = coordinator.parties.write() else {
                    return;
                };
                match parties.get_mut(&party_id) {
                    Some(party)
                        if party
                            .invites
                            .get(&target)
                            .is_some_and(|i| i.generation == generation) =>
                    {
                        party.invites.remove(&target);
                        true
                    }
                    _ => false,
                }
            };

            if expired {
                coordinator.metrics.record_invite_expired();
                let _ = coordinator
                    .push
                    .notify(&target, PushEvent::InviteExpired { party_id })
                    .await;
                debug!("Invite to {} for party {} expired", target, party_id);
            }
        });
    }

    /// Attempt to join a party. Denials (no invite, not a friend, closed
    /// party) come back as `Ok(false)` rather than errors.
    pub async fn join_party(&self, player_id: &PlayerId, party_id: PartyId) -> Result<bool> {
        let player = self
            .players
            .get(player_id)?
            .ok_or_else(|| MusterError::PlayerNotFound {
                player_id: player_id.clone(),
            })?;
        if player.party.is_some() {
            return Err(MusterError::InvalidRequest {
                reason: format!("{} is already in a party", player_id),
            }
            .into());
        }

        // First gate, under the lock: invites and the open/closed check
        let verdict = {
            let mut parties = self.write()?;
            let Some(party) = parties.get_mut(&party_id) else {
                return Err(MusterError::PartyNotFound {
                    party_id: party_id.to_string(),
                }
                .into());
            };
            match party.privacy {
                PartyPrivacy::Open => JoinVerdict::Admit,
                PartyPrivacy::Closed => {
                    if party.take_live_invite(player_id).is_some() {
                        JoinVerdict::Admit
                    } else {
                        JoinVerdict::Deny
                    }
                }
                PartyPrivacy::FriendsOnly => {
                    if party.take_live_invite(player_id).is_some() {
                        JoinVerdict::Admit
                    } else {
                        JoinVerdict::VerifyFriendship(party.leader.clone())
                    }
                }
            }
        };

        let admitted = match verdict {
            JoinVerdict::Admit => true,
            JoinVerdict::Deny => false,
            JoinVerdict::VerifyFriendship(leader) => {
                self.verifier.are_friends(player_id, &leader).await
            }
        };
        if !admitted {
            return Ok(false);
        }

        // The friendship check ran unlocked; re-check the party still admits
        let members = {
            let mut parties = self.write()?;
            let Some(party) = parties.get_mut(&party_id) else {
                return Ok(false);
            };
            if !party.add_member(player_id) {
                return Ok(false);
            }
            party.members.clone()
        };
        self.players.set_party(player_id, Some(party_id))?;

        for member in members.iter().filter(|m| *m != player_id) {
            self.push
                .notify(
                    member,
                    PushEvent::PartyMemberJoined {
                        party_id,
                        player_id: player_id.clone(),
                    },
                )
                .await?;
        }
        info!("Player {} joined party {}", player_id, party_id);
        Ok(true)
    }

    /// Leave the current party. The leaver's own matching and queueing are
    /// torn down; the rest of the party keeps going under a new leader if
    /// the leader left.
    pub async fn leave_party(&self, player_id: &PlayerId) -> Result<bool> {
        let Some(party) = self.party_of(player_id)? else {
            return Ok(false);
        };

        self.orchestrator.leave_matchmaking(player_id).await?;
        self.admission.leave_queue(player_id).await?;

        let party_id = party.id;
        let (remaining, new_leader) = {
            let mut parties = self.write()?;
            let Some(entry) = parties.get_mut(&party_id) else {
                return Ok(false);
            };
            let new_leader = entry.remove_member(player_id);
            let remaining = entry.members.clone();
            if remaining.is_empty() {
                parties.remove(&party_id);
            }
            (remaining, new_leader)
        };
        self.players.set_party(player_id, None)?;

        for member in &remaining {
            self.push
                .notify(
                    member,
                    PushEvent::PartyMemberLeft {
                        party_id: party.id,
                        player_id: player_id.clone(),
                    },
                )
                .await?;
        }
        if let Some(leader) = new_leader {
            self.orchestrator.transfer_initiator(player_id, &leader)?;
            for member in &remaining {
                self.push
                    .notify(
                        member,
                        PushEvent::PartyLeaderChanged {
                            party_id: party.id,
                            leader: leader.clone(),
                        },
                    )
                    .await?;
            }
        }
        info!("Player {} left party {}", player_id, party.id);
        Ok(true)
    }

    /// Leader-only: dissolve the party and tear down every member's
    /// matching and queueing
    pub async fn close_party(&self, leader: &PlayerId) -> Result<()> {
        let party = self.require_leader(leader)?;

        // Cancel each distinct ticket the members share
        let mut ticket_ids: Vec<TicketId> = Vec::new();
        for member in &party.members {
            if let Some(ticket) = self.orchestrator.matcher().ticket_of(member)? {
                if !ticket_ids.contains(&ticket.id) {
                    ticket_ids.push(ticket.id);
                }
            }
        }
        for ticket_id in ticket_ids {
            self.orchestrator
                .cancel_ticket(ticket_id, RemovalReason::PartyClosed)
                .await?;
        }

        for member in &party.members {
            self.admission
                .remove_player(member, RemovalReason::PartyClosed)
                .await?;
            self.players.set_party(member, None)?;
            self.push
                .notify(member, PushEvent::PartyClosed { party_id: party.id })
                .await?;
        }

        self.write()?.remove(&party.id);
        info!("Party {} closed by {}", party.id, leader);
        Ok(())
    }

    /// Leader-only: remove a member and tear down their matching/queueing
    pub async fn kick(&self, leader: &PlayerId, target: &PlayerId) -> Result<()> {
        let party = self.require_leader(leader)?;
        if !party.contains(target) || target == leader {
            return Err(MusterError::InvalidRequest {
                reason: format!("{} is not a kickable member", target),
            }
            .into());
        }

        self.orchestrator.leave_matchmaking(target).await?;
        self.admission.leave_queue(target).await?;

        let remaining = {
            let mut parties = self.write()?;
            let Some(party) = parties.get_mut(&party.id) else {
                return Ok(());
            };
            party.remove_member(target);
            party.members.clone()
        };
        self.players.set_party(target, None)?;

        self.push
            .notify(
                target,
                PushEvent::PartyMemberLeft {
                    party_id: party.id,
                    player_id: target.clone(),
                },
            )
            .await?;
        for member in &remaining {
            self.push
                .notify(
                    member,
                    PushEvent::PartyMemberLeft {
                        party_id: party.id,
                        player_id: target.clone(),
                    },
                )
                .await?;
        }
        info!("Player {} kicked from party {}", target, party.id);
        Ok(())
    }

    /// Leader-only: hand leadership to another member
    pub async fn promote(&self, leader: &PlayerId, target: &PlayerId) -> Result<()> {
        let party = self.require_leader(leader)?;
        if !party.contains(target) {
            return Err(MusterError::InvalidRequest {
                reason: format!("{} is not a party member", target),
            }
            .into());
        }

        let members = {
            let mut parties = self.write()?;
            let Some(party) = parties.get_mut(&party.id) else {
                return Ok(());
            };
            party.leader = target.clone();
            party.members.clone()
        };

        // The criteria-update role on a shared ticket follows leadership
        self.orchestrator.transfer_initiator(leader, target)?;

        for member in &members {
            self.push
                .notify(
                    member,
                    PushEvent::PartyLeaderChanged {
                        party_id: party.id,
                        leader: target.clone(),
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Leader-only: change the party's privacy mode
    pub async fn set_privacy(&self, leader: &PlayerId, privacy: PartyPrivacy) -> Result<()> {
        let party = self.require_leader(leader)?;

        let members = {
            let mut parties = self.write()?;
            let Some(party) = parties.get_mut(&party.id) else {
                return Ok(());
            };
            party.privacy = privacy;
            party.members.clone()
        };

        for member in &members {
            self.push
                .notify(
                    member,
                    PushEvent::PartyPrivacyChanged {
                        party_id: party.id,
                        privacy,
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Leader-only: open one shared ticket for every available member
    pub async fn enter_matchmaking_as_party(
        &self,
        leader: &PlayerId,
        queue: String,
        criteria: SearchCriteria,
        pings: HashMap<ServerKey, i32>,
    ) -> Result<TicketId> {
        let party = self.require_leader(leader)?;

        let mut eligible = Vec::new();
        for member in &party.members {
            let available = self
                .players
                .get(member)?
                .is_some_and(|p| p.is_available());
            if available {
                eligible.push(member.clone());
            }
        }
        if !eligible.contains(leader) {
            return Err(MusterError::PlayerBusy {
                player_id: leader.clone(),
                state: self
                    .players
                    .state(leader)?
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
            }
            .into());
        }

        self.orchestrator
            .enter_matchmaking(leader.clone(), eligible, queue, criteria, pings)
            .await
    }

    /// Leader-only: queue every available member onto a named server
    pub async fn join_server_as_party(
        self: &Arc<Self>,
        leader: &PlayerId,
        server: &ServerKey,
    ) -> Result<()> {
        let party = self.require_leader(leader)?;

        for member in &party.members {
            let available = self
                .players
                .get(member)?
                .is_some_and(|p| p.is_available());
            if available {
                self.admission.enqueue(member, server).await?;
            }
        }
        Ok(())
    }
}

enum JoinVerdict {
    Admit,
    Deny,
    VerifyFriendship(PlayerId),
}
