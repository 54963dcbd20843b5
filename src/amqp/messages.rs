//! AMQP message definitions and serialization

use crate::error::{MusterError, Result};
use crate::types::{JoinRequestOutcome, PartyId, PartyPrivacy, PlayerId, SearchCriteria, ServerKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Queue all inbound client commands arrive on
pub const COMMAND_QUEUE: &str = "muster.commands";
/// Topic exchange push events are published to
pub const PUSH_EXCHANGE: &str = "muster.events";

/// Routing key for push events addressed to one player
pub fn player_routing_key(player_id: &PlayerId) -> String {
    format!("player.{}", player_id)
}

/// Routing key for join requests addressed to one player
pub fn join_request_routing_key(player_id: &PlayerId) -> String {
    format!("player.{}.join-request", player_id)
}

/// Message envelope with delivery metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub payload: T,
    pub correlation_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub routing_key: String,
}

impl<T> MessageEnvelope<T>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    pub fn new(payload: T, routing_key: String) -> Self {
        Self {
            payload,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            routing_key,
        }
    }

    /// Serialize the envelope to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            MusterError::InternalError {
                message: format!("Failed to serialize message: {}", e),
            }
            .into()
        })
    }

    /// Deserialize an envelope from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            MusterError::InvalidRequest {
                reason: format!("Failed to deserialize message: {}", e),
            }
            .into()
        })
    }
}

/// A join request pushed to one player, answered by `ClientCommand::JoinReply`
/// carrying the same correlation id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub server: ServerKey,
    /// Milliseconds the client has to answer before the request times out
    pub timeout_ms: u64,
}

/// Every command a client can send over the command queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum ClientCommand {
    Connect {
        player_id: PlayerId,
    },
    Disconnect {
        player_id: PlayerId,
    },
    /// Start matchmaking, solo or for the sender's whole party
    EnterMatchmaking {
        player_id: PlayerId,
        queue: String,
        #[serde(default)]
        criteria: SearchCriteria,
        /// Candidate servers with last measured ping in milliseconds
        pings: HashMap<ServerKey, i32>,
    },
    LeaveMatchmaking {
        player_id: PlayerId,
    },
    /// Initiator-only update of a ticket's shared criteria
    UpdateCriteria {
        player_id: PlayerId,
        criteria: SearchCriteria,
    },
    /// Queue directly onto a named server, bypassing the matcher
    JoinServer {
        player_id: PlayerId,
        server: ServerKey,
    },
    LeaveQueue {
        player_id: PlayerId,
    },
    /// Client-side answer to a pushed join request
    JoinReply {
        player_id: PlayerId,
        correlation_id: String,
        outcome: JoinRequestOutcome,
    },
    /// Client reports it is physically on the server
    ReportJoinSuccess {
        player_id: PlayerId,
        server: ServerKey,
    },
    /// Client reports its join attempt failed
    ReportJoinFailure {
        player_id: PlayerId,
        server: ServerKey,
    },
    CreateParty {
        player_id: PlayerId,
        privacy: PartyPrivacy,
    },
    JoinParty {
        player_id: PlayerId,
        party_id: PartyId,
    },
    LeaveParty {
        player_id: PlayerId,
    },
    CloseParty {
        player_id: PlayerId,
    },
    Kick {
        player_id: PlayerId,
        target: PlayerId,
    },
    Promote {
        player_id: PlayerId,
        target: PlayerId,
    },
    SetPrivacy {
        player_id: PlayerId,
        privacy: PartyPrivacy,
    },
    Invite {
        player_id: PlayerId,
        target: PlayerId,
    },
}

impl ClientCommand {
    /// The sender of the command
    pub fn sender(&self) -> &PlayerId {
        match self {
            ClientCommand::Connect { player_id }
            | ClientCommand::Disconnect { player_id }
            | ClientCommand::EnterMatchmaking { player_id, .. }
            | ClientCommand::LeaveMatchmaking { player_id }
            | ClientCommand::UpdateCriteria { player_id, .. }
            | ClientCommand::JoinServer { player_id, .. }
            | ClientCommand::LeaveQueue { player_id }
            | ClientCommand::JoinReply { player_id, .. }
            | ClientCommand::ReportJoinSuccess { player_id, .. }
            | ClientCommand::ReportJoinFailure { player_id, .. }
            | ClientCommand::CreateParty { player_id, .. }
            | ClientCommand::JoinParty { player_id, .. }
            | ClientCommand::LeaveParty { player_id }
            | ClientCommand::CloseParty { player_id }
            | ClientCommand::Kick { player_id, .. }
            | ClientCommand::Promote { player_id, .. }
            | ClientCommand::SetPrivacy { player_id, .. }
            | ClientCommand::Invite { player_id, .. } => player_id,
        }
    }

    /// Reject commands that cannot possibly be valid before dispatch
    pub fn validate(&self) -> Result<()> {
        if self.sender().is_empty() {
            return Err(MusterError::InvalidRequest {
                reason: "Player id cannot be empty".to_string(),
            }
            .into());
        }

        match self {
            ClientCommand::EnterMatchmaking { queue, pings, .. } => {
                if queue.is_empty() {
                    return Err(MusterError::InvalidRequest {
                        reason: "Queue name cannot be empty".to_string(),
                    }
                    .into());
                }
                if pings.is_empty() {
                    return Err(MusterError::InvalidRequest {
                        reason: "At least one candidate server is required".to_string(),
                    }
                    .into());
                }
            }
            ClientCommand::JoinServer { server, .. }
            | ClientCommand::ReportJoinSuccess { server, .. }
            | ClientCommand::ReportJoinFailure { server, .. } => {
                if server.is_empty() {
                    return Err(MusterError::InvalidRequest {
                        reason: "Server key cannot be empty".to_string(),
                    }
                    .into());
                }
            }
            ClientCommand::JoinReply { correlation_id, .. } => {
                if correlation_id.is_empty() {
                    return Err(MusterError::InvalidRequest {
                        reason: "Join reply requires a correlation id".to_string(),
                    }
                    .into());
                }
            }
            ClientCommand::Kick { target, .. }
            | ClientCommand::Promote { target, .. }
            | ClientCommand::Invite { target, .. } => {
                if target.is_empty() {
                    return Err(MusterError::InvalidRequest {
                        reason: "Target player id cannot be empty".to_string(),
                    }
                    .into());
                }
            }
            _ => {}
        }
        Ok(())
    }
}
