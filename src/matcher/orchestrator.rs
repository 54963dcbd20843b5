//! The orchestrator: ticket intake, the periodic pass loop, and the handoff
//! from committed matches to admission

use crate::admission::AdmissionController;
use crate::amqp::publisher::PushChannel;
use crate::error::{MusterError, Result};
use crate::matcher::engine::{MatchProposal, Matcher};
use crate::matcher::ticket::MatchTicket;
use crate::metrics::MetricsCollector;
use crate::player::PlayerRegistry;
use crate::remote::ServerProbe;
use crate::types::{
    PlayerId, PlayerState, PushEvent, RemovalReason, SearchCriteria, ServerKey, ServerSnapshot,
    TicketId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct MatchmakingOrchestrator {
    matcher: Arc<Matcher>,
    players: Arc<PlayerRegistry>,
    probe: Arc<dyn ServerProbe>,
    push: Arc<dyn PushChannel>,
    admission: Arc<AdmissionController>,
    metrics: Arc<MetricsCollector>,
    pass_interval: Duration,
    probe_timeout: Duration,
}

impl MatchmakingOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        matcher: Arc<Matcher>,
        players: Arc<PlayerRegistry>,
        probe: Arc<dyn ServerProbe>,
        push: Arc<dyn PushChannel>,
        admission: Arc<AdmissionController>,
        metrics: Arc<MetricsCollector>,
        pass_interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            matcher,
            players,
            probe,
            push,
            admission,
            metrics,
            pass_interval,
            probe_timeout,
        }
    }

    pub fn matcher(&self) -> &Arc<Matcher> {
        &self.matcher
    }

    /// Open a ticket for one player or a whole group searching together.
    /// Every member must currently be free to start matching.
    pub async fn enter_matchmaking(
        &self,
        initiator: PlayerId,
        members: Vec<PlayerId>,
        queue: String,
        criteria: SearchCriteria,
        pings: HashMap<ServerKey, i32>,
    ) -> Result<TicketId> {
        for member in &members {
            let player = self
                .players
                .get(member)?
                .ok_or_else(|| MusterError::PlayerNotFound {
                    player_id: member.clone(),
                })?;
            if !player.is_available() {
                return Err(MusterError::PlayerBusy {
                    player_id: member.clone(),
                    state: player.state.to_string(),
                }
                .into());
            }
        }

        for member in &members {
            self.players.set_state(member, PlayerState::Matchmaking)?;
        }

        let group_size = members.len();
        let ticket = Arc::new(MatchTicket::new(
            initiator,
            members.clone(),
            queue.clone(),
            criteria.clone(),
            pings,
        ));
        let ticket_id = ticket.id;
        self.matcher.register(ticket)?;
        self.metrics.record_ticket_created();
        self.metrics
            .set_open_tickets(self.matcher.open_ticket_count()? as i64);

        for member in &members {
            self.push
                .notify(
                    member,
                    PushEvent::MatchingStarted {
                        ticket_id,
                        group_size,
                        queue: queue.clone(),
                        criteria: criteria.clone(),
                    },
                )
                .await?;
        }

        info!(
            "Ticket {} opened for {} player(s) in queue '{}'",
            ticket_id, group_size, queue
        );
        Ok(ticket_id)
    }

    /// Take one player out of matchmaking. Their ticket keeps searching for
    /// the remaining members; an emptied ticket is cancelled.
    pub async fn leave_matchmaking(&self, player_id: &PlayerId) -> Result<bool> {
        let Some((ticket, _cancelled)) = self.matcher.remove_member(player_id)? else {
            return Ok(false);
        };

        self.players.release(player_id)?;
        self.push
            .notify(
                player_id,
                PushEvent::RemovedFromMatching {
                    ticket_id: ticket.id,
                    reason: RemovalReason::Cancelled,
                },
            )
            .await?;
        self.metrics
            .set_open_tickets(self.matcher.open_ticket_count()? as i64);
        Ok(true)
    }

    /// Cancel a whole ticket, releasing and notifying every member
    pub async fn cancel_ticket(&self, ticket_id: TicketId, reason: RemovalReason) -> Result<bool> {
        let Some(ticket) = self.matcher.get(ticket_id)? else {
            return Ok(false);
        };
        let members = ticket.members()?;
        if !self.matcher.cancel(ticket_id, reason)? {
            return Ok(false);
        }

        for member in &members {
            self.players.release(member)?;
            self.push
                .notify(
                    member,
                    PushEvent::RemovedFromMatching { ticket_id, reason },
                )
                .await?;
        }
        self.metrics
            .set_open_tickets(self.matcher.open_ticket_count()? as i64);
        Ok(true)
    }

    /// Update a ticket's shared criteria; only the initiator may do this
    pub async fn update_criteria(
        &self,
        player_id: &PlayerId,
        criteria: SearchCriteria,
    ) -> Result<()> {
        let ticket = self
            .matcher
            .ticket_of(player_id)?
            .ok_or_else(|| MusterError::TicketNotFound {
                ticket_id: format!("no open ticket for {}", player_id),
            })?;

        let state = ticket.snapshot()?;
        if &state.initiator != player_id {
            return Err(MusterError::NotAuthorized {
                reason: format!("{} is not the ticket initiator", player_id),
            }
            .into());
        }

        ticket.with_state_mut(|s| s.criteria = criteria.clone())?;

        for member in state.members.iter().filter(|m| *m != player_id) {
            self.push
                .notify(
                    member,
                    PushEvent::CriteriaUpdated {
                        ticket_id: ticket.id,
                        criteria: criteria.clone(),
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Hand the criteria-update role on a player's ticket to another member
    pub fn transfer_initiator(&self, from: &PlayerId, to: &PlayerId) -> Result<()> {
        let Some(ticket) = self.matcher.ticket_of(from)? else {
            return Ok(());
        };
        ticket.with_state_mut(|s| {
            if s.members.contains(to) {
                s.initiator = to.clone();
            }
        })
    }

    /// One full pass: probe every referenced server, run the matcher, move
    /// matched players into admission, and push refreshed previews.
    pub async fn run_pass(&self) -> Result<Vec<MatchProposal>> {
        if self.matcher.is_empty()? {
            return Ok(Vec::new());
        }

        let snapshots = self.probe_servers().await?;
        if snapshots.is_empty() {
            debug!("No server responded this pass");
            return Ok(Vec::new());
        }

        let started = std::time::Instant::now();
        let proposals = self.matcher.propose_matches(&snapshots)?;
        self.metrics
            .observe_pass_duration(started.elapsed().as_secs_f64());

        for proposal in &proposals {
            self.metrics.record_match_committed(proposal.tickets.len());
            self.dispatch_match(proposal).await?;
        }

        self.push_previews().await?;
        self.metrics
            .set_open_tickets(self.matcher.open_ticket_count()? as i64);
        Ok(proposals)
    }

    /// Probe every server referenced by an open ticket, concurrently
    async fn probe_servers(&self) -> Result<HashMap<ServerKey, ServerSnapshot>> {
        let servers = self.matcher.referenced_servers()?;
        let probes = servers.into_iter().map(|server| async move {
            let snapshot = self.probe.snapshot(&server, self.probe_timeout).await;
            (server, snapshot)
        });

        let results = futures::future::join_all(probes).await;
        Ok(results
            .into_iter()
            .filter_map(|(server, snapshot)| snapshot.map(|s| (server, s)))
            .collect())
    }

    /// Tell every member about the match, then queue them for admission
    async fn dispatch_match(&self, proposal: &MatchProposal) -> Result<()> {
        for ticket in &proposal.tickets {
            for member in ticket.members()? {
                self.push
                    .notify(
                        &member,
                        PushEvent::MatchFound {
                            ticket_id: ticket.id,
                            server: proposal.server.clone(),
                            quality: proposal.quality,
                        },
                    )
                    .await?;
                if let Err(e) = self.admission.enqueue(&member, &proposal.server).await {
                    warn!(
                        "Failed to queue {} on {}: {}",
                        member, proposal.server, e
                    );
                }
            }
        }
        info!(
            "Match on {} dispatched ({} tickets, quality {:.1})",
            proposal.server,
            proposal.tickets.len(),
            proposal.quality
        );
        Ok(())
    }

    /// Push each surviving ticket's refreshed preview list to its members
    async fn push_previews(&self) -> Result<()> {
        for ticket in self.matcher.open_tickets()? {
            let state = ticket.snapshot()?;
            for member in &state.members {
                self.push
                    .notify(
                        member,
                        PushEvent::MatchPreviewUpdated {
                            ticket_id: ticket.id,
                            previews: state.previews.clone(),
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Spawn the periodic pass loop
    pub fn spawn(self: &Arc<Self>) -> (watch::Sender<bool>, JoinHandle<()>) {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(orchestrator.pass_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        info!("Matchmaking pass loop stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = orchestrator.run_pass().await {
                            warn!("Matchmaking pass failed: {}", e);
                        }
                    }
                }
            }
        });
        (cancel_tx, handle)
    }
}
