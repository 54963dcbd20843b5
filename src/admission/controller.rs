//! The admission controller: destination map and polling-task lifecycle
//!
//! Join flow for one player: Queued in the destination's queue, popped when a
//! free unreserved slot exists, asked to join over the push channel, then
//! Joining with a reserved slot until the server's roster (or the player's
//! own report) confirms them as Joined. Failures requeue at the head until
//! the attempt or budget limits evict them.

use crate::admission::destination::{Destination, LoopHandle, ProcessingState};
use crate::amqp::publisher::PushChannel;
use crate::config::AdmissionSettings;
use crate::error::{MusterError, Result};
use crate::metrics::MetricsCollector;
use crate::player::PlayerRegistry;
use crate::remote::ServerProbe;
use crate::types::{PlayerId, PlayerState, PushEvent, RemovalReason, ServerKey};
use crate::utils::elapsed_seconds;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Consecutive probe failures before a destination is declared gone
const PROBE_FAILURE_LIMIT: u32 = 3;

pub struct AdmissionController {
    players: Arc<PlayerRegistry>,
    probe: Arc<dyn ServerProbe>,
    push: Arc<dyn PushChannel>,
    metrics: Arc<MetricsCollector>,
    settings: AdmissionSettings,
    probe_timeout: Duration,
    destinations: RwLock<HashMap<ServerKey, Arc<Destination>>>,
}

impl AdmissionController {
    pub fn new(
        players: Arc<PlayerRegistry>,
        probe: Arc<dyn ServerProbe>,
        push: Arc<dyn PushChannel>,
        metrics: Arc<MetricsCollector>,
        settings: AdmissionSettings,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            players,
            probe,
            push,
            metrics,
            settings,
            probe_timeout,
            destinations: RwLock::new(HashMap::new()),
        }
    }

    fn read_destinations(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<ServerKey, Arc<Destination>>>> {
        self.destinations.read().map_err(|_| {
            MusterError::InternalError {
                message: "Failed to acquire destination map lock".to_string(),
            }
            .into()
        })
    }

    fn write_destinations(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<ServerKey, Arc<Destination>>>> {
        self.destinations.write().map_err(|_| {
            MusterError::InternalError {
                message: "Failed to acquire destination map lock".to_string(),
            }
            .into()
        })
    }

    pub fn destination(&self, server: &ServerKey) -> Result<Option<Arc<Destination>>> {
        Ok(self.read_destinations()?.get(server).map(Arc::clone))
    }

    pub fn get_or_create(&self, server: &ServerKey) -> Result<Arc<Destination>> {
        if let Some(dest) = self.destination(server)? {
            return Ok(dest);
        }
        let mut destinations = self.write_destinations()?;
        Ok(destinations
            .entry(server.clone())
            .or_insert_with(|| Arc::new(Destination::new(server.clone())))
            .clone())
    }

    pub fn destination_count(&self) -> Result<usize> {
        Ok(self.read_destinations()?.len())
    }

    pub fn queued_player_count(&self) -> Result<usize> {
        let destinations = self.read_destinations()?;
        let mut total = 0;
        for dest in destinations.values() {
            total += dest.queue_len()?;
        }
        Ok(total)
    }

    /// Put a player into a destination's admission queue and make sure its
    /// polling task is running (unless the destination is paused)
    pub async fn enqueue(self: &Arc<Self>, player_id: &PlayerId, server: &ServerKey) -> Result<()> {
        let player = self
            .players
            .get(player_id)?
            .ok_or_else(|| MusterError::PlayerNotFound {
                player_id: player_id.clone(),
            })?;
        if player.state == PlayerState::Disconnected {
            return Err(MusterError::PlayerNotFound {
                player_id: player_id.clone(),
            }
            .into());
        }

        let dest = self.get_or_create(server)?;
        if let Some(position) = dest.enqueue(player_id)? {
            self.players.mark_queued(player_id, server)?;
            self.push
                .notify(
                    player_id,
                    PushEvent::QueuePositionChanged {
                        server: server.clone(),
                        position,
                    },
                )
                .await?;
            debug!("Player {} queued on {} at position {}", player_id, server, position);
        }

        self.ensure_loop(&dest).await;
        Ok(())
    }

    /// Spawn the destination's polling task if none is running. Paused
    /// destinations stay paused until an explicit resume.
    async fn ensure_loop(self: &Arc<Self>, dest: &Arc<Destination>) {
        let mut task = dest.task.lock().await;

        match dest.state() {
            Ok(ProcessingState::Paused) => return,
            Ok(ProcessingState::Idle) => {
                let _ = dest.set_state(ProcessingState::Running);
                return;
            }
            Ok(ProcessingState::Running) => {
                if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
                    return;
                }
            }
            Ok(ProcessingState::Stopped) => {}
            Err(e) => {
                warn!("Failed to read destination state for {}: {}", dest.key, e);
                return;
            }
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let _ = dest.set_state(ProcessingState::Running);
        let controller = Arc::clone(self);
        let destination = Arc::clone(dest);
        let handle = tokio::spawn(async move {
            controller.run_loop(destination, cancel_rx).await;
        });
        *task = Some(LoopHandle {
            cancel: cancel_tx,
            handle,
        });
        info!("Started admission loop for {}", dest.key);
    }

    async fn run_loop(&self, dest: Arc<Destination>, mut cancel: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.settings.poll_interval_ms);
        // First tick lands one full period after spawn
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    debug!("Admission loop for {} cancelled", dest.key);
                    break;
                }
                _ = interval.tick() => {
                    match self.run_once(&dest).await {
                        Ok(true) => {
                            info!("Admission loop for {} stopped", dest.key);
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => warn!("Admission iteration failed for {}: {}", dest.key, e),
                    }
                }
            }
        }
    }

    /// One admission iteration. Returns true when the loop should stop.
    pub async fn run_once(&self, dest: &Arc<Destination>) -> Result<bool> {
        let snapshot = self.probe.snapshot(&dest.key, self.probe_timeout).await;
        dest.set_snapshot(snapshot)?;

        if snapshot.is_none() {
            if dest.probe_failures()? >= PROBE_FAILURE_LIMIT {
                warn!("Destination {} unreachable, evicting its queue", dest.key);
                self.evict_all(dest, RemovalReason::ServerRemoved).await?;
                dest.set_state(ProcessingState::Stopped)?;
                return Ok(true);
            }
            return Ok(false);
        }

        self.reconcile_joining(dest).await?;
        self.check_timeouts(dest).await?;
        self.trigger_joins(dest).await?;
        self.update_gauges()?;

        // Lifecycle: empty destinations idle out, then stop
        if dest.is_empty()? {
            match dest.state()? {
                ProcessingState::Running => dest.set_state(ProcessingState::Idle)?,
                ProcessingState::Idle => {
                    let idle = dest.idle_seconds()?.unwrap_or(0);
                    if idle >= self.settings.idle_timeout_seconds as i64 {
                        dest.set_state(ProcessingState::Stopped)?;
                        return Ok(true);
                    }
                }
                _ => {}
            }
        } else if dest.state()? == ProcessingState::Idle {
            dest.set_state(ProcessingState::Running)?;
        }

        Ok(false)
    }

    /// Confirm joining players the server roster already shows. A missing
    /// roster counts as confirmation, matching what clients report themselves.
    async fn reconcile_joining(&self, dest: &Arc<Destination>) -> Result<()> {
        let joining = dest.joining_players()?;
        if joining.is_empty() {
            return Ok(());
        }

        let roster = self.probe.occupant_names(&dest.key, self.probe_timeout).await;
        for player_id in joining {
            let present = roster.as_ref().map_or(true, |names| names.contains(&player_id));
            if present {
                self.confirm(dest, &player_id)?;
            }
        }
        Ok(())
    }

    fn confirm(&self, dest: &Arc<Destination>, player_id: &PlayerId) -> Result<()> {
        dest.confirm(player_id)?;
        self.players.mark_joined(player_id)?;
        self.metrics.record_join_confirmed();
        info!("Player {} confirmed on {}", player_id, dest.key);
        Ok(())
    }

    /// Enforce the per-attempt timeout and the total join budget. The budget
    /// clock starts at the first attempt; a player still waiting for their
    /// first attempt cannot run out of it.
    async fn check_timeouts(&self, dest: &Arc<Destination>) -> Result<()> {
        for player_id in dest.joining_players()? {
            let Some(player) = self.players.get(&player_id)? else {
                dest.remove(&player_id)?;
                continue;
            };
            let stale = player
                .join_attempts
                .last()
                .is_some_and(|at| elapsed_seconds(*at) >= self.settings.join_attempt_timeout_seconds as i64);
            if stale {
                self.attempt_failed(dest, &player_id).await?;
            }
        }

        let mut waiting = dest.queued_players()?;
        waiting.extend(dest.joining_players()?);
        for player_id in waiting {
            let Some(player) = self.players.get(&player_id)? else {
                continue;
            };
            let over_budget = player
                .join_attempts
                .first()
                .is_some_and(|at| elapsed_seconds(*at) >= self.settings.total_join_budget_seconds as i64);
            if over_budget {
                self.evict(dest, &player_id, RemovalReason::JoinTimeout).await?;
            }
        }
        Ok(())
    }

    /// Hand out join requests while free unreserved slots remain
    async fn trigger_joins(&self, dest: &Arc<Destination>) -> Result<()> {
        let mut queue_changed = false;
        while let Some(player_id) = dest.pop_if_capacity()? {
            queue_changed = true;
            let request = self
                .push
                .request_join(
                    &player_id,
                    &dest.key,
                    Duration::from_millis(self.settings.join_request_timeout_ms),
                )
                .await;
            let outcome = match request {
                Ok(outcome) => outcome,
                // Transport failure, not the player's answer: put them back
                // at the head so the next cycle retries
                Err(e) => {
                    dest.requeue_front(&player_id)?;
                    return Err(e);
                }
            };

            match outcome {
                crate::types::JoinRequestOutcome::Accepted => {
                    dest.mark_joining(&player_id)?;
                    self.players.mark_joining(&player_id)?;
                    debug!("Player {} joining {}", player_id, dest.key);
                }
                crate::types::JoinRequestOutcome::Declined => {
                    self.evict(dest, &player_id, RemovalReason::JoinFailed).await?;
                }
                crate::types::JoinRequestOutcome::TimedOut => {
                    self.evict(dest, &player_id, RemovalReason::JoinTimeout).await?;
                }
            }
        }

        if queue_changed {
            self.broadcast_positions(dest).await?;
        }
        Ok(())
    }

    /// Handle one failed join attempt: requeue at the head, or evict once
    /// the attempt limit is reached
    async fn attempt_failed(&self, dest: &Arc<Destination>, player_id: &PlayerId) -> Result<()> {
        dest.remove(player_id)?;
        let Some(player) = self.players.get(player_id)? else {
            return Ok(());
        };

        if player.join_attempts.len() as u32 >= self.settings.max_join_attempts {
            self.evict(dest, player_id, RemovalReason::MaxAttemptsReached)
                .await?;
            return Ok(());
        }

        // A momentarily full server is not the player's fault
        if dest.snapshot()?.is_some_and(|s| s.free_slots == 0) {
            self.players.clear_attempts(player_id)?;
        }

        dest.requeue_front(player_id)?;
        self.players.mark_requeued(player_id)?;
        self.broadcast_positions(dest).await?;
        Ok(())
    }

    async fn evict(
        &self,
        dest: &Arc<Destination>,
        player_id: &PlayerId,
        reason: RemovalReason,
    ) -> Result<()> {
        dest.remove(player_id)?;
        self.players.release(player_id)?;
        self.metrics.record_eviction(reason);
        self.push
            .notify(
                player_id,
                PushEvent::RemovedFromQueue {
                    server: dest.key.clone(),
                    reason,
                },
            )
            .await?;
        self.broadcast_positions(dest).await?;
        info!("Player {} evicted from {} ({})", player_id, dest.key, reason);
        Ok(())
    }

    async fn evict_all(&self, dest: &Arc<Destination>, reason: RemovalReason) -> Result<()> {
        let mut affected = dest.queued_players()?;
        affected.extend(dest.joining_players()?);
        for player_id in affected {
            self.evict(dest, &player_id, reason).await?;
        }
        Ok(())
    }

    async fn broadcast_positions(&self, dest: &Arc<Destination>) -> Result<()> {
        for (index, player_id) in dest.queued_players()?.iter().enumerate() {
            self.push
                .notify(
                    player_id,
                    PushEvent::QueuePositionChanged {
                        server: dest.key.clone(),
                        position: index + 1,
                    },
                )
                .await?;
        }
        Ok(())
    }

    fn update_gauges(&self) -> Result<()> {
        self.metrics.set_queued_players(self.queued_player_count()? as i64);
        let destinations = self.read_destinations()?;
        let mut active = 0;
        for dest in destinations.values() {
            if matches!(
                dest.state()?,
                ProcessingState::Running | ProcessingState::Idle
            ) {
                active += 1;
            }
        }
        self.metrics.set_active_destinations(active);
        Ok(())
    }

    /// Client self-reported a completed join
    pub fn report_join_success(&self, player_id: &PlayerId, server: &ServerKey) -> Result<()> {
        let dest = self
            .destination(server)?
            .ok_or_else(|| MusterError::DestinationNotFound {
                server: server.clone(),
            })?;
        self.confirm(&dest, player_id)
    }

    /// Client self-reported a failed join. Only meaningful for a player this
    /// controller currently considers Joining on that server.
    pub async fn report_join_failure(&self, player_id: &PlayerId, server: &ServerKey) -> Result<()> {
        let Some(dest) = self.destination(server)? else {
            return Ok(());
        };
        let is_joining = self
            .players
            .state(player_id)?
            .is_some_and(|s| s == PlayerState::Joining)
            && dest.joining_players()?.contains(player_id);
        if !is_joining {
            return Ok(());
        }
        self.attempt_failed(&dest, player_id).await
    }

    /// Voluntary removal from whatever queue the player is in
    pub async fn remove_player(&self, player_id: &PlayerId, reason: RemovalReason) -> Result<bool> {
        let in_admission = self
            .players
            .state(player_id)?
            .is_some_and(|s| matches!(s, PlayerState::Queued | PlayerState::Joining));
        if !in_admission {
            return Ok(false);
        }
        let Some(server) = self.players.destination_of(player_id)? else {
            return Ok(false);
        };
        let Some(dest) = self.destination(&server)? else {
            return Ok(false);
        };
        self.evict(&dest, player_id, reason).await?;
        Ok(true)
    }

    pub async fn leave_queue(&self, player_id: &PlayerId) -> Result<bool> {
        self.remove_player(player_id, RemovalReason::Cancelled).await
    }

    /// Evict everyone queued or joining on one destination
    pub async fn clear(&self, server: &ServerKey) -> Result<()> {
        let Some(dest) = self.destination(server)? else {
            return Ok(());
        };
        self.evict_all(&dest, RemovalReason::QueueCleared).await
    }

    /// Administratively pause a destination: its task stops and new joins do
    /// not restart it
    pub async fn halt(&self, server: &ServerKey) -> Result<()> {
        let dest = self
            .destination(server)?
            .ok_or_else(|| MusterError::DestinationNotFound {
                server: server.clone(),
            })?;
        let mut task = dest.task.lock().await;
        if let Some(handle) = task.take() {
            let _ = handle.cancel.send(true);
            // Wait for the in-flight iteration to finish
            let _ = handle.handle.await;
        }
        dest.set_state(ProcessingState::Paused)?;
        info!("Destination {} paused", server);
        Ok(())
    }

    /// Undo a pause; restarts the task if the destination has work
    pub async fn resume(self: &Arc<Self>, server: &ServerKey) -> Result<()> {
        let dest = self
            .destination(server)?
            .ok_or_else(|| MusterError::DestinationNotFound {
                server: server.clone(),
            })?;
        if dest.state()? != ProcessingState::Paused {
            return Ok(());
        }
        dest.set_state(ProcessingState::Stopped)?;
        if !dest.is_empty()? {
            self.ensure_loop(&dest).await;
        }
        info!("Destination {} resumed", server);
        Ok(())
    }

    /// Evict everyone and drop the destination entirely
    pub async fn destroy(&self, server: &ServerKey) -> Result<()> {
        let Some(dest) = self.destination(server)? else {
            return Ok(());
        };
        self.evict_all(&dest, RemovalReason::ServerRemoved).await?;
        {
            let mut task = dest.task.lock().await;
            if let Some(handle) = task.take() {
                let _ = handle.cancel.send(true);
                let _ = handle.handle.await;
            }
        }
        self.write_destinations()?.remove(server);
        info!("Destination {} destroyed", server);
        Ok(())
    }

    /// Drop stopped, empty destinations from the map
    pub async fn cleanup(&self) -> Result<usize> {
        let stale: Vec<ServerKey> = {
            let destinations = self.read_destinations()?;
            let mut stale = Vec::new();
            for (server, dest) in destinations.iter() {
                if dest.state()? == ProcessingState::Stopped && dest.is_empty()? {
                    stale.push(server.clone());
                }
            }
            stale
        };

        let removed = stale.len();
        if removed > 0 {
            let mut destinations = self.write_destinations()?;
            for server in &stale {
                destinations.remove(server);
            }
        }
        self.update_gauges()?;
        Ok(removed)
    }

    /// Spawn the periodic stale-destination sweep
    pub fn spawn_cleanup(self: &Arc<Self>) -> (watch::Sender<bool>, JoinHandle<()>) {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let controller = Arc::clone(self);
        let period = Duration::from_secs(self.settings.cleanup_interval_seconds);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    _ = interval.tick() => {
                        match controller.cleanup().await {
                            Ok(0) => {}
                            Ok(n) => debug!("Cleaned up {} stale destinations", n),
                            Err(e) => warn!("Destination cleanup failed: {}", e),
                        }
                    }
                }
            }
        });
        (cancel_tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::publisher::MockPushChannel;
    use crate::remote::MockServerProbe;
    use crate::types::{JoinRequestOutcome, ServerSnapshot};

    struct Fixture {
        controller: Arc<AdmissionController>,
        players: Arc<PlayerRegistry>,
        probe: Arc<MockServerProbe>,
        push: Arc<MockPushChannel>,
    }

    fn fixture(settings: AdmissionSettings) -> Fixture {
        let players = Arc::new(PlayerRegistry::new());
        let probe = Arc::new(MockServerProbe::new());
        let push = Arc::new(MockPushChannel::new());
        let controller = Arc::new(AdmissionController::new(
            Arc::clone(&players),
            Arc::clone(&probe) as Arc<dyn ServerProbe>,
            Arc::clone(&push) as Arc<dyn PushChannel>,
            Arc::new(MetricsCollector::new().unwrap()),
            settings,
            Duration::from_millis(100),
        ));
        Fixture {
            controller,
            players,
            probe,
            push,
        }
    }

    fn connected(fixture: &Fixture, id: &str) -> PlayerId {
        let player_id = id.to_string();
        fixture.players.connect(&player_id).unwrap();
        player_id
    }

    /// Push channel whose join requests fail at the transport level
    struct BrokenJoinChannel;

    #[async_trait::async_trait]
    impl PushChannel for BrokenJoinChannel {
        async fn notify(&self, _player_id: &PlayerId, _event: PushEvent) -> Result<()> {
            Ok(())
        }

        async fn request_join(
            &self,
            _player_id: &PlayerId,
            _server: &ServerKey,
            _timeout: Duration,
        ) -> Result<JoinRequestOutcome> {
            Err(MusterError::PushFailed {
                message: "channel down".to_string(),
            }
            .into())
        }
    }

    #[tokio::test]
    async fn test_transport_failure_requeues_popped_player() {
        let players = Arc::new(PlayerRegistry::new());
        let probe = Arc::new(MockServerProbe::new());
        let controller = Arc::new(AdmissionController::new(
            Arc::clone(&players),
            Arc::clone(&probe) as Arc<dyn ServerProbe>,
            Arc::new(BrokenJoinChannel) as Arc<dyn PushChannel>,
            Arc::new(MetricsCollector::new().unwrap()),
            AdmissionSettings::default(),
            Duration::from_millis(100),
        ));
        let alice = "alice".to_string();
        players.connect(&alice).unwrap();
        let server = "s1".to_string();
        probe.set_snapshot(&server, ServerSnapshot::empty(4));

        controller.enqueue(&alice, &server).await.unwrap();
        let dest = controller.destination(&server).unwrap().unwrap();
        assert!(controller.run_once(&dest).await.is_err());

        // Back at the head of the queue for the next cycle, not stranded
        assert_eq!(players.state(&alice).unwrap(), Some(PlayerState::Queued));
        assert_eq!(dest.position_of(&alice).unwrap(), Some(1));
        assert_eq!(dest.reserved().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_then_join_and_confirm() {
        let f = fixture(AdmissionSettings::default());
        let alice = connected(&f, "alice");
        let server = "s1:25565".to_string();
        f.probe.set_snapshot(&server, ServerSnapshot::empty(4));

        f.controller.enqueue(&alice, &server).await.unwrap();
        assert_eq!(f.players.state(&alice).unwrap(), Some(PlayerState::Queued));

        let dest = f.controller.destination(&server).unwrap().unwrap();
        // First iteration: join request accepted (mock default), reservation held
        f.controller.run_once(&dest).await.unwrap();
        assert_eq!(f.players.state(&alice).unwrap(), Some(PlayerState::Joining));
        assert_eq!(dest.reserved().unwrap(), 1);

        // Roster now shows alice: next iteration confirms her
        f.probe.add_occupant(&server, "alice");
        f.controller.run_once(&dest).await.unwrap();
        assert_eq!(f.players.state(&alice).unwrap(), Some(PlayerState::Joined));
        assert_eq!(dest.reserved().unwrap(), 0);
        assert!(dest.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_missing_roster_confirms_joining_players() {
        let f = fixture(AdmissionSettings::default());
        let alice = connected(&f, "alice");
        let server = "s1".to_string();
        f.probe.set_snapshot(&server, ServerSnapshot::empty(4));
        // No roster scripted at all

        f.controller.enqueue(&alice, &server).await.unwrap();
        let dest = f.controller.destination(&server).unwrap().unwrap();
        f.controller.run_once(&dest).await.unwrap();
        f.controller.run_once(&dest).await.unwrap();

        assert_eq!(f.players.state(&alice).unwrap(), Some(PlayerState::Joined));
    }

    #[tokio::test]
    async fn test_declined_join_evicts() {
        let f = fixture(AdmissionSettings::default());
        let alice = connected(&f, "alice");
        let server = "s1".to_string();
        f.probe.set_snapshot(&server, ServerSnapshot::empty(4));
        f.push
            .script_join_outcomes(&alice, &[JoinRequestOutcome::Declined]);

        f.controller.enqueue(&alice, &server).await.unwrap();
        let dest = f.controller.destination(&server).unwrap().unwrap();
        f.controller.run_once(&dest).await.unwrap();

        assert_eq!(
            f.players.state(&alice).unwrap(),
            Some(PlayerState::Connected)
        );
        let events = f.push.events_for(&alice);
        assert!(events.iter().any(|e| matches!(
            e,
            PushEvent::RemovedFromQueue {
                reason: RemovalReason::JoinFailed,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_capacity_limits_concurrent_joins() {
        let f = fixture(AdmissionSettings::default());
        let alice = connected(&f, "alice");
        let bob = connected(&f, "bob");
        let server = "s1".to_string();
        f.probe.set_snapshot(&server, ServerSnapshot::empty(1));

        f.controller.enqueue(&alice, &server).await.unwrap();
        f.controller.enqueue(&bob, &server).await.unwrap();
        let dest = f.controller.destination(&server).unwrap().unwrap();
        f.controller.run_once(&dest).await.unwrap();

        // Only one free slot: alice is joining, bob still queued
        assert_eq!(f.players.state(&alice).unwrap(), Some(PlayerState::Joining));
        assert_eq!(f.players.state(&bob).unwrap(), Some(PlayerState::Queued));
        assert_eq!(dest.position_of(&bob).unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_attempt_timeout_requeues_then_evicts() {
        let settings = AdmissionSettings {
            join_attempt_timeout_seconds: 0,
            max_join_attempts: 2,
            ..AdmissionSettings::default()
        };
        let f = fixture(settings);
        let alice = connected(&f, "alice");
        let server = "s1".to_string();
        f.probe.set_snapshot(&server, ServerSnapshot::empty(4));
        // Roster never shows alice, so every attempt goes stale immediately
        f.probe.set_roster(&server, Vec::<String>::new());

        f.controller.enqueue(&alice, &server).await.unwrap();
        let dest = f.controller.destination(&server).unwrap().unwrap();

        // Attempt 1 goes out
        f.controller.run_once(&dest).await.unwrap();
        assert_eq!(f.players.state(&alice).unwrap(), Some(PlayerState::Joining));

        // Attempt 1 stale -> requeued -> attempt 2 goes out in the same pass
        f.controller.run_once(&dest).await.unwrap();
        let player = f.players.get(&alice).unwrap().unwrap();
        assert_eq!(player.join_attempts.len(), 2);

        // Attempt 2 stale and the limit is reached -> evicted
        f.controller.run_once(&dest).await.unwrap();
        assert_eq!(
            f.players.state(&alice).unwrap(),
            Some(PlayerState::Connected)
        );
        let events = f.push.events_for(&alice);
        assert!(events.iter().any(|e| matches!(
            e,
            PushEvent::RemovedFromQueue {
                reason: RemovalReason::MaxAttemptsReached,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_budget_runs_from_first_attempt() {
        let settings = AdmissionSettings {
            total_join_budget_seconds: 0,
            ..AdmissionSettings::default()
        };
        let f = fixture(settings);
        let alice = connected(&f, "alice");
        let bob = connected(&f, "bob");
        let server = "s1".to_string();
        // One free slot: only the head of the queue gets an attempt
        f.probe.set_snapshot(
            &server,
            ServerSnapshot {
                free_slots: 1,
                occupants: 0,
                score: 0,
            },
        );

        f.controller.enqueue(&alice, &server).await.unwrap();
        f.controller.enqueue(&bob, &server).await.unwrap();
        let dest = f.controller.destination(&server).unwrap().unwrap();

        // Cycle 1: alice gets her attempt; bob has no attempt yet, so an
        // exhausted budget alone must not touch him
        f.controller.run_once(&dest).await.unwrap();
        assert_eq!(f.players.state(&alice).unwrap(), Some(PlayerState::Joining));
        assert_eq!(f.players.state(&bob).unwrap(), Some(PlayerState::Queued));

        // Cycle 2: alice never shows up on the roster and her budget,
        // counted from that first attempt, is spent
        f.probe.set_roster(&server, Vec::<String>::new());
        f.probe.set_snapshot(
            &server,
            ServerSnapshot {
                free_slots: 0,
                occupants: 1,
                score: 0,
            },
        );
        f.controller.run_once(&dest).await.unwrap();

        assert_eq!(
            f.players.state(&alice).unwrap(),
            Some(PlayerState::Connected)
        );
        assert!(f.push.events_for(&alice).iter().any(|e| matches!(
            e,
            PushEvent::RemovedFromQueue {
                reason: RemovalReason::JoinTimeout,
                ..
            }
        )));
        assert_eq!(f.players.state(&bob).unwrap(), Some(PlayerState::Queued));
    }

    #[tokio::test]
    async fn test_unreachable_server_evicts_after_limit() {
        let f = fixture(AdmissionSettings::default());
        let alice = connected(&f, "alice");
        let server = "gone".to_string();
        f.probe.set_snapshot(&server, ServerSnapshot::empty(4));
        f.controller.enqueue(&alice, &server).await.unwrap();
        let dest = f.controller.destination(&server).unwrap().unwrap();

        f.probe.set_unreachable(&server, true);
        for _ in 0..PROBE_FAILURE_LIMIT - 1 {
            assert!(!f.controller.run_once(&dest).await.unwrap());
        }
        // Limit reached: queue evicted and loop asked to stop
        assert!(f.controller.run_once(&dest).await.unwrap());

        let events = f.push.events_for(&alice);
        assert!(events.iter().any(|e| matches!(
            e,
            PushEvent::RemovedFromQueue {
                reason: RemovalReason::ServerRemoved,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_leave_queue_and_position_broadcast() {
        let f = fixture(AdmissionSettings::default());
        let alice = connected(&f, "alice");
        let bob = connected(&f, "bob");
        let server = "s1".to_string();
        f.probe.set_snapshot(
            &server,
            ServerSnapshot {
                free_slots: 0,
                occupants: 12,
                score: 0,
            },
        );

        f.controller.enqueue(&alice, &server).await.unwrap();
        f.controller.enqueue(&bob, &server).await.unwrap();
        f.push.clear();

        assert!(f.controller.leave_queue(&alice).await.unwrap());
        assert!(!f.controller.leave_queue(&alice).await.unwrap());

        // Bob moved up and was told so
        let events = f.push.events_for(&bob);
        assert!(events.iter().any(|e| matches!(
            e,
            PushEvent::QueuePositionChanged { position: 1, .. }
        )));
    }

    #[tokio::test]
    async fn test_clear_evicts_everyone() {
        let f = fixture(AdmissionSettings::default());
        let alice = connected(&f, "alice");
        let bob = connected(&f, "bob");
        let server = "s1".to_string();
        f.probe.set_snapshot(
            &server,
            ServerSnapshot {
                free_slots: 0,
                occupants: 12,
                score: 0,
            },
        );
        f.controller.enqueue(&alice, &server).await.unwrap();
        f.controller.enqueue(&bob, &server).await.unwrap();

        f.controller.clear(&server).await.unwrap();

        let dest = f.controller.destination(&server).unwrap().unwrap();
        assert!(dest.is_empty().unwrap());
        for player in [&alice, &bob] {
            assert_eq!(
                f.players.state(player).unwrap(),
                Some(PlayerState::Connected)
            );
        }
    }

    #[tokio::test]
    async fn test_halt_pauses_and_resume_restarts() {
        let f = fixture(AdmissionSettings::default());
        let alice = connected(&f, "alice");
        let server = "s1".to_string();
        f.probe.set_snapshot(&server, ServerSnapshot::empty(4));
        f.controller.enqueue(&alice, &server).await.unwrap();

        f.controller.halt(&server).await.unwrap();
        let dest = f.controller.destination(&server).unwrap().unwrap();
        assert_eq!(dest.state().unwrap(), ProcessingState::Paused);

        // New joins do not restart a paused destination
        let bob = connected(&f, "bob");
        f.controller.enqueue(&bob, &server).await.unwrap();
        assert_eq!(dest.state().unwrap(), ProcessingState::Paused);

        f.controller.resume(&server).await.unwrap();
        assert_eq!(dest.state().unwrap(), ProcessingState::Running);
        f.controller.halt(&server).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_drops_stopped_destinations() {
        let f = fixture(AdmissionSettings::default());
        let server = "s1".to_string();
        let dest = f.controller.get_or_create(&server).unwrap();
        dest.set_state(ProcessingState::Stopped).unwrap();

        assert_eq!(f.controller.cleanup().await.unwrap(), 1);
        assert!(f.controller.destination(&server).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_report_join_failure_ignores_non_joining_players() {
        let f = fixture(AdmissionSettings::default());
        let alice = connected(&f, "alice");
        let server = "s1".to_string();
        f.probe.set_snapshot(&server, ServerSnapshot::empty(4));
        f.controller.enqueue(&alice, &server).await.unwrap();

        // Alice is Queued, not Joining: the report is a no-op
        f.controller
            .report_join_failure(&alice, &server)
            .await
            .unwrap();
        assert_eq!(f.players.state(&alice).unwrap(), Some(PlayerState::Queued));
        let dest = f.controller.destination(&server).unwrap().unwrap();
        assert_eq!(dest.queue_len().unwrap(), 1);
    }
}
