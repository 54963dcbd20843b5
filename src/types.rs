//! Common types used throughout the matchmaking and admission service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for players
pub type PlayerId = String;

/// Unique identifier for matchmaking tickets
pub type TicketId = Uuid;

/// Unique identifier for parties
pub type PartyId = Uuid;

/// Connection identity of a game server ("host:port")
pub type ServerKey = String;

/// Lifecycle state of a player as tracked by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlayerState {
    Disconnected,
    Connected,
    Matchmaking,
    Queued,
    Joining,
    Joined,
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayerState::Disconnected => write!(f, "Disconnected"),
            PlayerState::Connected => write!(f, "Connected"),
            PlayerState::Matchmaking => write!(f, "Matchmaking"),
            PlayerState::Queued => write!(f, "Queued"),
            PlayerState::Joining => write!(f, "Joining"),
            PlayerState::Joined => write!(f, "Joined"),
        }
    }
}

/// Capacity and quality snapshot of a game server, refreshed by the probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    /// Slots not yet occupied according to the server itself
    pub free_slots: u32,
    /// Players currently on the server
    pub occupants: u32,
    /// Secondary quality signal (higher = more competitive intensity)
    pub score: u32,
}

impl ServerSnapshot {
    pub fn empty(free_slots: u32) -> Self {
        Self {
            free_slots,
            occupants: 0,
            score: 0,
        }
    }
}

/// Shared search preferences carried by a ticket
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCriteria {
    /// Minimum players already on a server before it is acceptable
    pub min_players: u32,
    /// Maximum acceptable ping in milliseconds
    pub max_ping: Option<u32>,
    /// Maximum acceptable server score
    pub max_score: Option<u32>,
    /// Maximum acceptable current occupancy
    pub max_occupancy: Option<u32>,
}

/// Reason-coded removal surfaced to clients instead of raw errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemovalReason {
    JoinFailed,
    JoinTimeout,
    MaxAttemptsReached,
    QueueCleared,
    ServerRemoved,
    PartyClosed,
    Disconnected,
    Cancelled,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            RemovalReason::JoinFailed => "joinFailed",
            RemovalReason::JoinTimeout => "joinTimeout",
            RemovalReason::MaxAttemptsReached => "maxAttemptsReached",
            RemovalReason::QueueCleared => "queueCleared",
            RemovalReason::ServerRemoved => "serverRemoved",
            RemovalReason::PartyClosed => "partyClosed",
            RemovalReason::Disconnected => "disconnected",
            RemovalReason::Cancelled => "cancelled",
        };
        write!(f, "{}", reason)
    }
}

/// Privacy mode of a party
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartyPrivacy {
    Closed,
    FriendsOnly,
    Open,
}

/// Outcome of a join-request round trip to a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JoinRequestOutcome {
    Accepted,
    Declined,
    TimedOut,
}

/// A non-binding match candidate shown to clients while they wait
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchPreview {
    pub server: ServerKey,
    pub quality: f64,
}

/// A committed (server, ticket-set) pairing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchInfo {
    pub server: ServerKey,
    pub quality: f64,
    pub ticket_ids: Vec<TicketId>,
}

/// Push events delivered to clients over the push channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PushEvent {
    /// Matching started for a ticket this player is part of
    MatchingStarted {
        ticket_id: TicketId,
        group_size: usize,
        queue: String,
        criteria: SearchCriteria,
    },
    /// Preview list of currently computable matches was refreshed
    MatchPreviewUpdated {
        ticket_id: TicketId,
        previews: Vec<MatchPreview>,
    },
    /// A match was committed for this player's ticket
    MatchFound {
        ticket_id: TicketId,
        server: ServerKey,
        quality: f64,
    },
    /// Shared search criteria were updated by the initiator
    CriteriaUpdated {
        ticket_id: TicketId,
        criteria: SearchCriteria,
    },
    /// Player was removed from matchmaking
    RemovedFromMatching {
        ticket_id: TicketId,
        reason: RemovalReason,
    },
    /// Position within a server's admission queue changed
    QueuePositionChanged { server: ServerKey, position: usize },
    /// Player was removed from a server's admission queue
    RemovedFromQueue {
        server: ServerKey,
        reason: RemovalReason,
    },
    /// A player joined the party
    PartyMemberJoined {
        party_id: PartyId,
        player_id: PlayerId,
    },
    /// A player left the party (or was kicked)
    PartyMemberLeft {
        party_id: PartyId,
        player_id: PlayerId,
    },
    /// Party leadership changed hands
    PartyLeaderChanged { party_id: PartyId, leader: PlayerId },
    /// Party privacy mode changed
    PartyPrivacyChanged {
        party_id: PartyId,
        privacy: PartyPrivacy,
    },
    /// Party was closed by its leader
    PartyClosed { party_id: PartyId },
    /// Player received a party invite
    InviteReceived {
        party_id: PartyId,
        from: PlayerId,
        expires_at: DateTime<Utc>,
    },
    /// A pending invite expired unconsumed
    InviteExpired { party_id: PartyId },
}
