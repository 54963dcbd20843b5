//! Prometheus metrics collection

use crate::error::Result;
use crate::types::RemovalReason;
use anyhow::Context;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Central registry of service metrics.
///
/// Construction can only fail on duplicate registration, so callers that do
/// not care (tests, dry runs) can fall back to `Default`.
pub struct MetricsCollector {
    registry: Registry,

    // Matchmaking
    tickets_created_total: IntCounter,
    matches_committed_total: IntCounter,
    matched_tickets_total: IntCounter,
    match_pass_duration_seconds: Histogram,
    open_tickets: IntGauge,

    // Admission
    players_evicted_total: IntCounterVec,
    joins_confirmed_total: IntCounter,
    active_destinations: IntGauge,
    queued_players: IntGauge,

    // Party
    parties_created_total: IntCounter,
    invites_sent_total: IntCounter,
    invites_expired_total: IntCounter,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let tickets_created_total = IntCounter::with_opts(Opts::new(
            "muster_tickets_created_total",
            "Total matchmaking tickets opened",
        ))
        .context("Failed to create tickets counter")?;

        let matches_committed_total = IntCounter::with_opts(Opts::new(
            "muster_matches_committed_total",
            "Total matches committed to a server",
        ))
        .context("Failed to create matches counter")?;

        let matched_tickets_total = IntCounter::with_opts(Opts::new(
            "muster_matched_tickets_total",
            "Total tickets resolved by a committed match",
        ))
        .context("Failed to create matched tickets counter")?;

        let match_pass_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "muster_match_pass_duration_seconds",
                "Duration of full matcher passes",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .context("Failed to create pass duration histogram")?;

        let open_tickets = IntGauge::with_opts(Opts::new(
            "muster_open_tickets",
            "Tickets currently searching",
        ))
        .context("Failed to create open tickets gauge")?;

        let players_evicted_total = IntCounterVec::new(
            Opts::new(
                "muster_players_evicted_total",
                "Players removed from admission queues, by reason",
            ),
            &["reason"],
        )
        .context("Failed to create evictions counter")?;

        let joins_confirmed_total = IntCounter::with_opts(Opts::new(
            "muster_joins_confirmed_total",
            "Players confirmed present on their destination server",
        ))
        .context("Failed to create joins counter")?;

        let active_destinations = IntGauge::with_opts(Opts::new(
            "muster_active_destinations",
            "Destinations with a running admission loop",
        ))
        .context("Failed to create destinations gauge")?;

        let queued_players = IntGauge::with_opts(Opts::new(
            "muster_queued_players",
            "Players currently waiting in admission queues",
        ))
        .context("Failed to create queued players gauge")?;

        let parties_created_total = IntCounter::with_opts(Opts::new(
            "muster_parties_created_total",
            "Total parties created",
        ))
        .context("Failed to create parties counter")?;

        let invites_sent_total = IntCounter::with_opts(Opts::new(
            "muster_invites_sent_total",
            "Total party invites sent",
        ))
        .context("Failed to create invites counter")?;

        let invites_expired_total = IntCounter::with_opts(Opts::new(
            "muster_invites_expired_total",
            "Total party invites that expired unconsumed",
        ))
        .context("Failed to create expired invites counter")?;

        registry
            .register(Box::new(tickets_created_total.clone()))
            .context("Failed to register tickets counter")?;
        registry
            .register(Box::new(matches_committed_total.clone()))
            .context("Failed to register matches counter")?;
        registry
            .register(Box::new(matched_tickets_total.clone()))
            .context("Failed to register matched tickets counter")?;
        registry
            .register(Box::new(match_pass_duration_seconds.clone()))
            .context("Failed to register pass duration histogram")?;
        registry
            .register(Box::new(open_tickets.clone()))
            .context("Failed to register open tickets gauge")?;
        registry
            .register(Box::new(players_evicted_total.clone()))
            .context("Failed to register evictions counter")?;
        registry
            .register(Box::new(joins_confirmed_total.clone()))
            .context("Failed to register joins counter")?;
        registry
            .register(Box::new(active_destinations.clone()))
            .context("Failed to register destinations gauge")?;
        registry
            .register(Box::new(queued_players.clone()))
            .context("Failed to register queued players gauge")?;
        registry
            .register(Box::new(parties_created_total.clone()))
            .context("Failed to register parties counter")?;
        registry
            .register(Box::new(invites_sent_total.clone()))
            .context("Failed to register invites counter")?;
        registry
            .register(Box::new(invites_expired_total.clone()))
            .context("Failed to register expired invites counter")?;

        Ok(Self {
            registry,
            tickets_created_total,
            matches_committed_total,
            matched_tickets_total,
            match_pass_duration_seconds,
            open_tickets,
            players_evicted_total,
            joins_confirmed_total,
            active_destinations,
            queued_players,
            parties_created_total,
            invites_sent_total,
            invites_expired_total,
        })
    }

    pub fn record_ticket_created(&self) {
        self.tickets_created_total.inc();
    }

    pub fn record_match_committed(&self, ticket_count: usize) {
        self.matches_committed_total.inc();
        self.matched_tickets_total.inc_by(ticket_count as u64);
    }

    pub fn observe_pass_duration(&self, seconds: f64) {
        self.match_pass_duration_seconds.observe(seconds);
    }

    pub fn set_open_tickets(&self, count: i64) {
        self.open_tickets.set(count);
    }

    pub fn record_eviction(&self, reason: RemovalReason) {
        self.players_evicted_total
            .with_label_values(&[&reason.to_string()])
            .inc();
    }

    pub fn record_join_confirmed(&self) {
        self.joins_confirmed_total.inc();
    }

    pub fn set_active_destinations(&self, count: i64) {
        self.active_destinations.set(count);
    }

    pub fn set_queued_players(&self, count: i64) {
        self.queued_players.set(count);
    }

    pub fn record_party_created(&self) {
        self.parties_created_total.inc();
    }

    pub fn record_invite_sent(&self) {
        self.invites_sent_total.inc();
    }

    pub fn record_invite_expired(&self) {
        self.invites_expired_total.inc();
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn gather(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics output was not valid UTF-8")
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics collector")
    }
}
