//! The matcher engine: ticket indices, eligibility, and atomic match commits
//!
//! The engine owns two indices: the global ticket map and a per-server index
//! of tickets that consider that server a candidate. One `propose_matches`
//! pass repeatedly produces the single best-quality match across all live
//! servers until no server can host any remaining ticket.

use crate::error::{MusterError, Result};
use crate::matcher::scoring::{
    destination_quality, match_quality, select_max_group_desc, GroupCandidate, QualityInput,
};
use crate::matcher::ticket::{MatchTicket, Resolution, TicketState};
use crate::types::{
    MatchInfo, MatchPreview, PlayerId, RemovalReason, ServerKey, ServerSnapshot, TicketId,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// A committed match: one server and the tickets placed on it
#[derive(Debug, Clone)]
pub struct MatchProposal {
    pub server: ServerKey,
    pub quality: f64,
    pub tickets: Vec<Arc<MatchTicket>>,
}

impl MatchProposal {
    /// All players across the selected tickets, in ticket order
    pub fn players(&self) -> Result<Vec<PlayerId>> {
        let mut players = Vec::new();
        for ticket in &self.tickets {
            players.extend(ticket.members()?);
        }
        Ok(players)
    }
}

/// A ticket surviving the pass together with its refreshed state
struct Survivor {
    ticket: Arc<MatchTicket>,
    state: TicketState,
}

/// Holds all open tickets and, per server, the subset that prefers it
#[derive(Default)]
pub struct Matcher {
    tickets: RwLock<HashMap<TicketId, Arc<MatchTicket>>>,
    by_server: RwLock<HashMap<ServerKey, HashSet<TicketId>>>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new open ticket under every candidate server it names
    pub fn register(&self, ticket: Arc<MatchTicket>) -> Result<()> {
        let state = ticket.snapshot()?;
        let mut tickets = self.write_tickets()?;
        let mut by_server = self.write_by_server()?;

        for server in state.pings.keys() {
            by_server
                .entry(server.clone())
                .or_default()
                .insert(ticket.id);
        }
        tickets.insert(ticket.id, ticket);
        Ok(())
    }

    /// Cancel a ticket; returns true iff this call resolved it
    pub fn cancel(&self, ticket_id: TicketId, reason: RemovalReason) -> Result<bool> {
        let ticket = match self.get(ticket_id)? {
            Some(ticket) => ticket,
            None => return Ok(false),
        };

        let mut tickets = self.write_tickets()?;
        let mut by_server = self.write_by_server()?;
        let won = ticket
            .completion()
            .try_resolve(Resolution::Cancelled(reason))?;
        if won {
            Self::unindex(&mut tickets, &mut by_server, &ticket)?;
        }
        Ok(won)
    }

    /// Remove one player from whatever ticket holds them. Returns the ticket
    /// and whether the removal emptied (and therefore cancelled) it.
    pub fn remove_member(&self, player_id: &PlayerId) -> Result<Option<(Arc<MatchTicket>, bool)>> {
        let ticket = match self.ticket_of(player_id)? {
            Some(ticket) => ticket,
            None => return Ok(None),
        };

        match ticket.remove_member(player_id)? {
            Some(0) => {
                let cancelled = self.cancel(ticket.id, RemovalReason::Cancelled)?;
                Ok(Some((ticket, cancelled)))
            }
            Some(_) => Ok(Some((ticket, false))),
            None => Ok(None),
        }
    }

    /// The open ticket containing a player, if any
    pub fn ticket_of(&self, player_id: &PlayerId) -> Result<Option<Arc<MatchTicket>>> {
        let tickets = self.read_tickets()?;
        for ticket in tickets.values() {
            if ticket.contains(player_id)? {
                return Ok(Some(Arc::clone(ticket)));
            }
        }
        Ok(None)
    }

    pub fn get(&self, ticket_id: TicketId) -> Result<Option<Arc<MatchTicket>>> {
        Ok(self.read_tickets()?.get(&ticket_id).map(Arc::clone))
    }

    pub fn open_tickets(&self) -> Result<Vec<Arc<MatchTicket>>> {
        Ok(self.read_tickets()?.values().map(Arc::clone).collect())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read_tickets()?.is_empty())
    }

    pub fn open_ticket_count(&self) -> Result<usize> {
        Ok(self.read_tickets()?.len())
    }

    /// Distinct servers referenced by any open ticket
    pub fn referenced_servers(&self) -> Result<Vec<ServerKey>> {
        let by_server = self.read_by_server()?;
        Ok(by_server
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(server, _)| server.clone())
            .collect())
    }

    /// One full matcher pass over a consistent set of server snapshots.
    ///
    /// Repeatedly commits the single best-quality match across all servers
    /// until none can host any remaining ticket. Afterwards every surviving
    /// ticket gets its preview list refreshed and its search-attempt counter
    /// incremented exactly once for the whole pass.
    pub fn propose_matches(
        &self,
        snapshots: &HashMap<ServerKey, ServerSnapshot>,
    ) -> Result<Vec<MatchProposal>> {
        let mut ranked: Vec<(ServerKey, ServerSnapshot, f64)> = snapshots
            .iter()
            .map(|(server, snap)| (server.clone(), *snap, destination_quality(snap)))
            .collect();
        ranked.sort_by(|a, b| b.2.total_cmp(&a.2));

        let mut proposals = Vec::new();
        loop {
            let mut best: Option<(f64, ServerKey, Vec<Arc<MatchTicket>>)> = None;
            for (server, snap, base) in &ranked {
                if let Some((quality, selected)) = self.candidate_for(server, snap, *base)? {
                    let better = best
                        .as_ref()
                        .map_or(true, |(best_quality, _, _)| quality > *best_quality);
                    if better {
                        best = Some((quality, server.clone(), selected));
                    }
                }
            }

            let Some((quality, server, selected)) = best else {
                break;
            };

            if self.commit(&server, quality, &selected)? {
                debug!(
                    "Committed match on {} (quality {:.1}, {} tickets)",
                    server,
                    quality,
                    selected.len()
                );
                proposals.push(MatchProposal {
                    server,
                    quality,
                    tickets: selected,
                });
            }
            // A lost race means another pass already resolved those tickets;
            // the indices no longer contain them, so just evaluate again.
        }

        self.refresh_survivors(&ranked)?;
        Ok(proposals)
    }

    /// Best candidate match for one server, if any ticket pool fits
    fn candidate_for(
        &self,
        server: &ServerKey,
        snapshot: &ServerSnapshot,
        base: f64,
    ) -> Result<Option<(f64, Vec<Arc<MatchTicket>>)>> {
        let eligible = self.eligible_pool(server, snapshot)?;
        Ok(Self::select_from_pool(server, snapshot, base, &eligible))
    }

    /// Tickets indexed for `server` that pass every eligibility rule
    fn eligible_pool(
        &self,
        server: &ServerKey,
        snapshot: &ServerSnapshot,
    ) -> Result<Vec<Survivor>> {
        let pool = self.pool_for(server)?;
        let mut eligible = Vec::new();
        for ticket in pool {
            let state = ticket.snapshot()?;
            if Self::is_eligible(&state, server, snapshot) {
                eligible.push(Survivor { ticket, state });
            }
        }
        Self::sort_pool(&mut eligible);
        Ok(eligible)
    }

    /// All unresolved tickets indexed under `server`
    fn pool_for(&self, server: &ServerKey) -> Result<Vec<Arc<MatchTicket>>> {
        let tickets = self.read_tickets()?;
        let by_server = self.read_by_server()?;
        let Some(ids) = by_server.get(server) else {
            return Ok(Vec::new());
        };

        let mut pool = Vec::new();
        for id in ids {
            if let Some(ticket) = tickets.get(id) {
                if !ticket.completion().is_resolved()? {
                    pool.push(Arc::clone(ticket));
                }
            }
        }
        Ok(pool)
    }

    /// Strictest-first ordering: descending minimum-players, older first
    fn sort_pool(pool: &mut [Survivor]) {
        pool.sort_by(|a, b| {
            b.state
                .criteria
                .min_players
                .cmp(&a.state.criteria.min_players)
                .then(a.ticket.created_at.cmp(&b.ticket.created_at))
        });
    }

    /// Run group selection over an already-sorted pool and score the result
    fn select_from_pool(
        server: &ServerKey,
        snapshot: &ServerSnapshot,
        base: f64,
        pool: &[Survivor],
    ) -> Option<(f64, Vec<Arc<MatchTicket>>)> {
        let candidates: Vec<GroupCandidate> = pool
            .iter()
            .map(|s| GroupCandidate {
                size: s.state.members.len() as u32,
                min_players: s.state.criteria.min_players,
            })
            .collect();

        let range = select_max_group_desc(snapshot.free_slots, snapshot.occupants, &candidates)?;
        let selected = &pool[range];

        let inputs: Vec<QualityInput> = selected
            .iter()
            .map(|s| QualityInput {
                wait_seconds: s.ticket.wait_seconds(),
                // Eligibility guarantees a ping entry for this server
                ping: s.state.pings.get(server).copied().unwrap_or_default(),
                max_ping: s.state.criteria.max_ping,
            })
            .collect();
        let quality = match_quality(base, &inputs);

        Some((
            quality,
            selected.iter().map(|s| Arc::clone(&s.ticket)).collect(),
        ))
    }

    /// Eligibility of one ticket for one server under the current snapshot
    fn is_eligible(state: &TicketState, server: &ServerKey, snapshot: &ServerSnapshot) -> bool {
        let Some(&ping) = state.pings.get(server) else {
            return false;
        };
        if ping < 0 {
            return false;
        }
        // On the very first search attempt a ticket only accepts servers that
        // already have organic players up to its own minimum, so fresh
        // servers are not flooded instantly.
        if state.search_attempts == 0 && snapshot.occupants < state.criteria.min_players {
            return false;
        }
        if let Some(max_score) = state.criteria.max_score {
            if snapshot.score > max_score {
                return false;
            }
        }
        if let Some(max_occupancy) = state.criteria.max_occupancy {
            if snapshot.occupants > max_occupancy {
                return false;
            }
        }
        if let Some(max_ping) = state.criteria.max_ping {
            if ping as u32 > max_ping {
                return false;
            }
        }
        true
    }

    /// Atomically resolve all selected tickets to the match and drop them
    /// from every index. Returns false if a concurrent pass won any of them.
    fn commit(
        &self,
        server: &ServerKey,
        quality: f64,
        selected: &[Arc<MatchTicket>],
    ) -> Result<bool> {
        // Lock order: ticket map, server index, then completion slots in
        // ascending ticket-id order. Cancel uses the same order.
        let mut tickets = self.write_tickets()?;
        let mut by_server = self.write_by_server()?;

        let mut ordered: Vec<&Arc<MatchTicket>> = selected.iter().collect();
        ordered.sort_by_key(|t| t.id);

        let mut guards = Vec::with_capacity(ordered.len());
        for ticket in &ordered {
            guards.push(ticket.completion().lock()?);
        }
        if guards.iter().any(|g| g.is_some()) {
            return Ok(false);
        }

        let info = MatchInfo {
            server: server.clone(),
            quality,
            ticket_ids: ordered.iter().map(|t| t.id).collect(),
        };
        for guard in guards.iter_mut() {
            **guard = Some(Resolution::Matched(info.clone()));
        }
        drop(guards);

        for ticket in selected {
            Self::unindex(&mut tickets, &mut by_server, ticket)?;
        }
        Ok(true)
    }

    fn unindex(
        tickets: &mut HashMap<TicketId, Arc<MatchTicket>>,
        by_server: &mut HashMap<ServerKey, HashSet<TicketId>>,
        ticket: &Arc<MatchTicket>,
    ) -> Result<()> {
        tickets.remove(&ticket.id);
        let state = ticket.snapshot()?;
        for server in state.pings.keys() {
            if let Some(ids) = by_server.get_mut(server) {
                ids.remove(&ticket.id);
                if ids.is_empty() {
                    by_server.remove(server);
                }
            }
        }
        Ok(())
    }

    /// Refresh every surviving ticket: recompute its preview list against the
    /// live servers and count the pass it just survived.
    fn refresh_survivors(&self, ranked: &[(ServerKey, ServerSnapshot, f64)]) -> Result<()> {
        let survivors = self.open_tickets()?;
        for ticket in survivors {
            if ticket.completion().is_resolved()? {
                continue;
            }
            let state = ticket.snapshot()?;
            let mut previews = Vec::new();

            for (server, snapshot, base) in ranked {
                if !state.pings.contains_key(server) {
                    continue;
                }
                // Even an ineligible ticket gets a non-binding preview from
                // the eligible-plus-this-ticket pool.
                let mut pool = self.eligible_pool(server, snapshot)?;
                if !pool.iter().any(|s| s.ticket.id == ticket.id) {
                    pool.push(Survivor {
                        ticket: Arc::clone(&ticket),
                        state: state.clone(),
                    });
                    Self::sort_pool(&mut pool);
                }

                if let Some((quality, selected)) =
                    Self::select_from_pool(server, snapshot, *base, &pool)
                {
                    if selected.iter().any(|t| t.id == ticket.id) {
                        previews.push(MatchPreview {
                            server: server.clone(),
                            quality,
                        });
                    }
                }
            }

            previews.sort_by(|a, b| b.quality.total_cmp(&a.quality));
            ticket.with_state_mut(|s| {
                s.previews = previews;
                s.search_attempts += 1;
            })?;
        }
        Ok(())
    }

    fn read_tickets(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<TicketId, Arc<MatchTicket>>>> {
        self.tickets.read().map_err(|_| {
            MusterError::InternalError {
                message: "Failed to acquire ticket index lock".to_string(),
            }
            .into()
        })
    }

    fn write_tickets(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<TicketId, Arc<MatchTicket>>>> {
        self.tickets.write().map_err(|_| {
            MusterError::InternalError {
                message: "Failed to acquire ticket index lock".to_string(),
            }
            .into()
        })
    }

    fn read_by_server(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<ServerKey, HashSet<TicketId>>>> {
        self.by_server.read().map_err(|_| {
            MusterError::InternalError {
                message: "Failed to acquire server index lock".to_string(),
            }
            .into()
        })
    }

    fn write_by_server(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<ServerKey, HashSet<TicketId>>>> {
        self.by_server.write().map_err(|_| {
            MusterError::InternalError {
                message: "Failed to acquire server index lock".to_string(),
            }
            .into()
        })
    }
}
