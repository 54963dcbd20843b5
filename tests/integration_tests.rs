//! Integration tests for the muster-point matchmaking service
//!
//! These tests validate the subsystems working together, including:
//! - Complete solo and group matchmaking workflows
//! - Admission queue join retries and eviction
//! - Party lifecycle (create, invite, join, promote, close)
//! - Concurrent matching passes resolving tickets exactly once

use muster_point::admission::AdmissionController;
use muster_point::amqp::publisher::{MockPushChannel, PushChannel};
use muster_point::config::AdmissionSettings;
use muster_point::matcher::{Matcher, MatchmakingOrchestrator};
use muster_point::metrics::MetricsCollector;
use muster_point::party::PartyCoordinator;
use muster_point::player::PlayerRegistry;
use muster_point::remote::{AllowAllVerifier, MockServerProbe, ServerProbe};
use muster_point::types::{
    PartyPrivacy, PlayerId, PlayerState, PushEvent, SearchCriteria, ServerSnapshot,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct TestSystem {
    players: Arc<PlayerRegistry>,
    probe: Arc<MockServerProbe>,
    push: Arc<MockPushChannel>,
    admission: Arc<AdmissionController>,
    orchestrator: Arc<MatchmakingOrchestrator>,
    party: Arc<PartyCoordinator>,
}

/// Integration test setup that creates a complete system against in-memory
/// transport and probe doubles.
fn create_test_system(admission_settings: AdmissionSettings) -> TestSystem {
    let players = Arc::new(PlayerRegistry::new());
    let probe = Arc::new(MockServerProbe::new());
    let push = Arc::new(MockPushChannel::new());
    let metrics = Arc::new(MetricsCollector::new().unwrap());

    let admission = Arc::new(AdmissionController::new(
        Arc::clone(&players),
        Arc::clone(&probe) as Arc<dyn ServerProbe>,
        Arc::clone(&push) as Arc<dyn PushChannel>,
        Arc::clone(&metrics),
        admission_settings,
        Duration::from_millis(100),
    ));
    let orchestrator = Arc::new(MatchmakingOrchestrator::new(
        Arc::new(Matcher::new()),
        Arc::clone(&players),
        Arc::clone(&probe) as Arc<dyn ServerProbe>,
        Arc::clone(&push) as Arc<dyn PushChannel>,
        Arc::clone(&admission),
        Arc::clone(&metrics),
        Duration::from_secs(3),
        Duration::from_millis(100),
    ));
    let party = Arc::new(PartyCoordinator::new(
        Arc::clone(&players),
        Arc::clone(&push) as Arc<dyn PushChannel>,
        Arc::new(AllowAllVerifier),
        Arc::clone(&orchestrator),
        Arc::clone(&admission),
        Arc::clone(&metrics),
        Duration::from_secs(60),
    ));

    TestSystem {
        players,
        probe,
        push,
        admission,
        orchestrator,
        party,
    }
}

/// Settings that keep spawned destination loops out of the way so tests can
/// drive processing manually
fn manual_settings() -> AdmissionSettings {
    AdmissionSettings {
        poll_interval_ms: 60_000,
        ..AdmissionSettings::default()
    }
}

fn connect(system: &TestSystem, id: &str) -> PlayerId {
    let player_id = id.to_string();
    system.players.connect(&player_id).unwrap();
    player_id
}

async fn enter_solo(system: &TestSystem, id: &str, server: &str) {
    let player = connect(system, id);
    system
        .orchestrator
        .enter_matchmaking(
            player.clone(),
            vec![player],
            "standard".to_string(),
            SearchCriteria::default(),
            HashMap::from([(server.to_string(), 30)]),
        )
        .await
        .unwrap();
}

fn state_of(system: &TestSystem, id: &str) -> Option<PlayerState> {
    system.players.state(&id.to_string()).unwrap()
}

#[tokio::test]
async fn test_complete_solo_matchmaking_workflow() {
    let system = create_test_system(manual_settings());
    let server = "eu-1:25565";
    system.probe.set_snapshot(server, ServerSnapshot::empty(16));

    enter_solo(&system, "alice", server).await;
    enter_solo(&system, "bob", server).await;

    // Matching pass: two solo tickets on an empty server clear the bar
    let proposals = system.orchestrator.run_pass().await.unwrap();
    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].server, server);
    assert!(proposals[0].quality >= 2000.0);
    assert_eq!(proposals[0].tickets.len(), 2);

    for player in ["alice", "bob"] {
        assert_eq!(state_of(&system, player), Some(PlayerState::Queued));
        assert!(system
            .push
            .events_for(&player.to_string())
            .iter()
            .any(|e| matches!(e, PushEvent::MatchFound { .. })));
    }

    // Admission cycle 1: both players are asked to join and accept
    let dest = system
        .admission
        .destination(&server.to_string())
        .unwrap()
        .unwrap();
    system.admission.run_once(&dest).await.unwrap();
    for player in ["alice", "bob"] {
        assert_eq!(state_of(&system, player), Some(PlayerState::Joining));
    }

    // Admission cycle 2: the server reports both on its roster
    system.probe.set_roster(
        server,
        ["alice".to_string(), "bob".to_string()],
    );
    system.admission.run_once(&dest).await.unwrap();
    for player in ["alice", "bob"] {
        assert_eq!(state_of(&system, player), Some(PlayerState::Joined));
    }
}

#[tokio::test]
async fn test_group_and_solo_share_one_match() {
    let system = create_test_system(manual_settings());
    let server = "eu-2";
    system.probe.set_snapshot(server, ServerSnapshot::empty(8));

    let alice = connect(&system, "alice");
    let bob = connect(&system, "bob");
    system
        .orchestrator
        .enter_matchmaking(
            alice.clone(),
            vec![alice, bob],
            "standard".to_string(),
            SearchCriteria::default(),
            HashMap::from([(server.to_string(), 20)]),
        )
        .await
        .unwrap();
    enter_solo(&system, "carol", server).await;

    let proposals = system.orchestrator.run_pass().await.unwrap();
    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].tickets.len(), 2);
    assert_eq!(proposals[0].players().unwrap().len(), 3);

    for player in ["alice", "bob", "carol"] {
        assert_eq!(state_of(&system, player), Some(PlayerState::Queued));
    }
    assert!(system.orchestrator.matcher().is_empty().unwrap());
}

#[tokio::test]
async fn test_join_failure_retries_then_evicts() {
    let system = create_test_system(AdmissionSettings {
        poll_interval_ms: 60_000,
        max_join_attempts: 2,
        ..AdmissionSettings::default()
    });
    let server = "eu-3".to_string();
    system.probe.set_snapshot(&server, ServerSnapshot::empty(8));

    let alice = connect(&system, "alice");
    system.admission.enqueue(&alice, &server).await.unwrap();
    let dest = system.admission.destination(&server).unwrap().unwrap();

    // Attempt 1: accepted by the client, but the actual join falls over
    system.admission.run_once(&dest).await.unwrap();
    assert_eq!(state_of(&system, "alice"), Some(PlayerState::Joining));
    system
        .admission
        .report_join_failure(&alice, &server)
        .await
        .unwrap();
    assert_eq!(state_of(&system, "alice"), Some(PlayerState::Queued));

    // Attempt 2 fails too, exhausting the budget
    system.admission.run_once(&dest).await.unwrap();
    system
        .admission
        .report_join_failure(&alice, &server)
        .await
        .unwrap();

    assert_eq!(state_of(&system, "alice"), Some(PlayerState::Connected));
    assert!(system
        .push
        .events_for(&alice)
        .iter()
        .any(|e| matches!(e, PushEvent::RemovedFromQueue { .. })));
}

#[tokio::test]
async fn test_declined_join_request_evicts_immediately() {
    let system = create_test_system(manual_settings());
    let server = "eu-4".to_string();
    system.probe.set_snapshot(&server, ServerSnapshot::empty(8));

    let alice = connect(&system, "alice");
    system
        .push
        .script_join_outcomes(&alice, &[muster_point::types::JoinRequestOutcome::Declined]);
    system.admission.enqueue(&alice, &server).await.unwrap();

    let dest = system.admission.destination(&server).unwrap().unwrap();
    system.admission.run_once(&dest).await.unwrap();

    assert_eq!(state_of(&system, "alice"), Some(PlayerState::Connected));
    assert!(dest.is_empty().unwrap());
}

#[tokio::test]
async fn test_party_lifecycle_through_matchmaking() {
    let system = create_test_system(manual_settings());
    let server = "eu-5";
    system.probe.set_snapshot(server, ServerSnapshot::empty(8));

    let alice = connect(&system, "alice");
    let bob = connect(&system, "bob");
    let carol = connect(&system, "carol");

    // Closed party: bob needs an invite, carol joins after promotion opens it
    let party_id = system
        .party
        .create_party(&alice, PartyPrivacy::Closed)
        .unwrap();
    assert!(!system.party.join_party(&bob, party_id).await.unwrap());
    system.party.invite(&alice, &bob).await.unwrap();
    assert!(system.party.join_party(&bob, party_id).await.unwrap());

    system.party.promote(&alice, &bob).await.unwrap();
    system
        .party
        .set_privacy(&bob, PartyPrivacy::Open)
        .await
        .unwrap();
    assert!(system.party.join_party(&carol, party_id).await.unwrap());

    // Only the leader may start the search; the whole party enters
    assert!(system
        .party
        .enter_matchmaking_as_party(
            &alice,
            "standard".to_string(),
            SearchCriteria::default(),
            HashMap::from([(server.to_string(), 25)]),
        )
        .await
        .is_err());
    system
        .party
        .enter_matchmaking_as_party(
            &bob,
            "standard".to_string(),
            SearchCriteria::default(),
            HashMap::from([(server.to_string(), 25)]),
        )
        .await
        .unwrap();
    for player in ["alice", "bob", "carol"] {
        assert_eq!(state_of(&system, player), Some(PlayerState::Matchmaking));
    }

    // Closing the party tears the shared ticket down and frees everyone
    system.party.close_party(&bob).await.unwrap();
    assert_eq!(system.party.party_count().unwrap(), 0);
    for player in ["alice", "bob", "carol"] {
        assert_eq!(state_of(&system, player), Some(PlayerState::Connected));
        assert!(system
            .push
            .events_for(&player.to_string())
            .iter()
            .any(|e| matches!(e, PushEvent::PartyClosed { .. })));
    }
    assert!(system.orchestrator.matcher().is_empty().unwrap());
}

#[tokio::test]
async fn test_concurrent_passes_commit_exactly_once() {
    let system = create_test_system(manual_settings());
    let server = "eu-6";
    system.probe.set_snapshot(server, ServerSnapshot::empty(16));

    enter_solo(&system, "alice", server).await;
    enter_solo(&system, "bob", server).await;

    let (first, second) = tokio::join!(
        system.orchestrator.run_pass(),
        system.orchestrator.run_pass()
    );
    let committed = first.unwrap().len() + second.unwrap().len();
    assert_eq!(committed, 1);

    for player in ["alice", "bob"] {
        assert_eq!(state_of(&system, player), Some(PlayerState::Queued));
        // Exactly one MatchFound per player across both passes
        let found = system
            .push
            .events_for(&player.to_string())
            .iter()
            .filter(|e| matches!(e, PushEvent::MatchFound { .. }))
            .count();
        assert_eq!(found, 1);
    }
}

#[tokio::test]
async fn test_leaving_the_queue_moves_everyone_up() {
    let system = create_test_system(manual_settings());
    let server = "eu-7".to_string();
    // No free slots: everyone stays queued
    system.probe.set_snapshot(
        &server,
        ServerSnapshot {
            free_slots: 0,
            occupants: 12,
            score: 100,
        },
    );

    let alice = connect(&system, "alice");
    let bob = connect(&system, "bob");
    system.admission.enqueue(&alice, &server).await.unwrap();
    system.admission.enqueue(&bob, &server).await.unwrap();

    let dest = system.admission.destination(&server).unwrap().unwrap();
    assert_eq!(dest.position_of(&bob).unwrap(), Some(2));

    assert!(system.admission.leave_queue(&alice).await.unwrap());
    assert_eq!(dest.position_of(&bob).unwrap(), Some(1));
    assert!(system
        .push
        .events_for(&bob)
        .iter()
        .any(|e| matches!(e, PushEvent::QueuePositionChanged { position: 1, .. })));
}
