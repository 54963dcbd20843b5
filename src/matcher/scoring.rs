//! Quality scoring and group selection for the matcher
//!
//! Servers are ranked by a base quality that rewards seeding empty servers
//! and filling half-full ones, minus a penalty for competitive intensity.
//! Candidate matches are then adjusted for group size, wait time, and how
//! tightly the selected tickets' pings fit their own limits.

use crate::types::ServerSnapshot;
use std::ops::Range;

/// Base quality every server starts from
pub const BASE_QUALITY: f64 = 1000.0;
/// Bonus for a currently empty server
pub const EMPTY_BONUS: f64 = 1000.0;
/// Bonus for a half-full server worth topping up
pub const HALF_FULL_BONUS: f64 = 3000.0;
/// Occupancy below which a server counts as half full
pub const HALF_FULL_OCCUPANTS: u32 = 6;
/// Score below which a server counts as half full
pub const HALF_FULL_SCORE: u32 = 3000;
/// Divisor turning raw score into an intensity penalty
pub const INTENSITY_DIVISOR: f64 = 300.0;
/// Upper bound on the intensity penalty
pub const INTENSITY_CAP: f64 = 600.0;

/// Per-ticket weight in the adjusted match quality
pub const TICKET_WEIGHT: f64 = 15.0;
/// Per-second-of-waiting weight in the adjusted match quality
pub const WAIT_WEIGHT: f64 = 40.0;
/// Per-millisecond ping-margin penalty in the adjusted match quality
pub const PING_MARGIN_WEIGHT: f64 = 15.0;

/// Base desirability of a server given its current snapshot
pub fn destination_quality(snapshot: &ServerSnapshot) -> f64 {
    let mut quality = BASE_QUALITY;

    if snapshot.occupants == 0 {
        quality += EMPTY_BONUS;
    } else if snapshot.occupants < HALF_FULL_OCCUPANTS && snapshot.score < HALF_FULL_SCORE {
        quality += HALF_FULL_BONUS;
    }

    quality -= (snapshot.score as f64 / INTENSITY_DIVISOR).min(INTENSITY_CAP);
    quality
}

/// A ticket reduced to the two numbers group selection needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCandidate {
    /// Member count of the ticket
    pub size: u32,
    /// The ticket's minimum-players threshold
    pub min_players: u32,
}

/// Select the largest contiguous run of tickets that fits the free slots and
/// satisfies the starting ticket's (occupancy-adjusted) minimum-players
/// threshold.
///
/// `candidates` must be sorted descending by `min_players`. Scanning starts at
/// the strictest threshold; the first starting index whose run fits wins, so
/// the strictest satisfiable ticket anchors the largest possible group.
/// Tickets are indivisible: a run never includes part of a ticket.
pub fn select_max_group_desc(
    free_slots: u32,
    occupants: u32,
    candidates: &[GroupCandidate],
) -> Option<Range<usize>> {
    for start in 0..candidates.len() {
        let mut total: u32 = 0;
        let mut end = start;
        while end < candidates.len() && total + candidates[end].size <= free_slots {
            total += candidates[end].size;
            end += 1;
        }
        if end == start {
            // Even the anchor ticket alone does not fit
            continue;
        }

        let threshold = candidates[start].min_players.saturating_sub(occupants);
        if threshold <= total {
            return Some(start..end);
        }
    }
    None
}

/// Per-ticket input to the adjusted match quality
#[derive(Debug, Clone, Copy)]
pub struct QualityInput {
    pub wait_seconds: f64,
    pub ping: i32,
    pub max_ping: Option<u32>,
}

/// Adjusted quality of a concrete candidate match.
///
/// Larger groups and longer-waiting tickets raise quality; tickets whose ping
/// sits far from their own tolerance lower it.
pub fn match_quality(base: f64, tickets: &[QualityInput]) -> f64 {
    if tickets.is_empty() {
        return base;
    }

    let count = tickets.len() as f64;
    let avg_wait = tickets.iter().map(|t| t.wait_seconds).sum::<f64>() / count;
    let avg_margin = tickets
        .iter()
        .map(|t| match t.max_ping {
            Some(max) => (max as f64 - t.ping as f64).abs(),
            None => 0.0,
        })
        .sum::<f64>()
        / count;

    base + TICKET_WEIGHT * count + WAIT_WEIGHT * avg_wait - PING_MARGIN_WEIGHT * avg_margin
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(free_slots: u32, occupants: u32, score: u32) -> ServerSnapshot {
        ServerSnapshot {
            free_slots,
            occupants,
            score,
        }
    }

    #[test]
    fn test_empty_server_gets_seed_bonus() {
        assert_eq!(destination_quality(&snapshot(10, 0, 0)), 2000.0);
    }

    #[test]
    fn test_half_full_server_gets_topup_bonus() {
        // 3 occupants, low score: 1000 + 3000 - 500/300
        let quality = destination_quality(&snapshot(7, 3, 500));
        assert!((quality - (4000.0 - 500.0 / 300.0)).abs() < 1e-9);
    }

    #[test]
    fn test_intense_server_gets_no_bonus_and_capped_penalty() {
        // 8 occupants, huge score: no bonus, penalty capped at 600
        assert_eq!(destination_quality(&snapshot(2, 8, 1_000_000)), 400.0);
    }

    #[test]
    fn test_half_full_requires_both_conditions() {
        // Few occupants but high score: no top-up bonus
        let quality = destination_quality(&snapshot(7, 3, 3000));
        assert_eq!(quality, 1000.0 - (3000.0 / 300.0));
    }

    #[test]
    fn test_group_selection_prefers_strictest_anchor() {
        // free slots = 6, tickets desc by min_players:
        // (min 6, size 4), (min 0, size 2), (min 0, size 1)
        let candidates = [
            GroupCandidate {
                size: 4,
                min_players: 6,
            },
            GroupCandidate {
                size: 2,
                min_players: 0,
            },
            GroupCandidate {
                size: 1,
                min_players: 0,
            },
        ];

        let selected = select_max_group_desc(6, 0, &candidates).unwrap();
        // Exactly the first two tickets: 4 + 2 = 6 players, threshold 6 <= 6
        assert_eq!(selected, 0..2);
    }

    #[test]
    fn test_group_selection_rescans_on_unmet_threshold() {
        // The strict ticket alone cannot satisfy its own threshold, so the
        // scan moves past it and picks the lenient ones.
        let candidates = [
            GroupCandidate {
                size: 2,
                min_players: 10,
            },
            GroupCandidate {
                size: 2,
                min_players: 0,
            },
            GroupCandidate {
                size: 1,
                min_players: 0,
            },
        ];

        let selected = select_max_group_desc(8, 0, &candidates).unwrap();
        // Starting at 0: run covers all three (5 <= 8) but threshold 10 > 5.
        // Starting at 1: run covers tickets 1..3, threshold 0 <= 3.
        assert_eq!(selected, 1..3);
    }

    #[test]
    fn test_group_selection_never_splits_a_ticket() {
        let candidates = [GroupCandidate {
            size: 5,
            min_players: 0,
        }];
        assert_eq!(select_max_group_desc(4, 0, &candidates), None);
    }

    #[test]
    fn test_group_selection_counts_existing_occupants() {
        // min_players 6 with 4 already on the server: adjusted threshold 2
        let candidates = [GroupCandidate {
            size: 2,
            min_players: 6,
        }];
        assert_eq!(select_max_group_desc(4, 4, &candidates), Some(0..1));
    }

    #[test]
    fn test_group_selection_empty_pool() {
        assert_eq!(select_max_group_desc(10, 0, &[]), None);
    }

    #[test]
    fn test_match_quality_rewards_size_and_wait() {
        let base = 2000.0;
        let small = match_quality(
            base,
            &[QualityInput {
                wait_seconds: 0.0,
                ping: 20,
                max_ping: None,
            }],
        );
        let large = match_quality(
            base,
            &[
                QualityInput {
                    wait_seconds: 10.0,
                    ping: 20,
                    max_ping: None,
                },
                QualityInput {
                    wait_seconds: 10.0,
                    ping: 20,
                    max_ping: None,
                },
            ],
        );
        assert!(large > small);
        // Exact arithmetic for the two-ticket case
        assert!((large - (base + 2.0 * TICKET_WEIGHT + 40.0 * 10.0)).abs() < 1e-9);
    }

    mod selection_properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn selected_run_fits_and_satisfies_its_anchor(
                free_slots in 0u32..32,
                occupants in 0u32..16,
                pool in proptest::collection::vec((1u32..6, 0u32..16), 0..20),
            ) {
                let mut candidates: Vec<GroupCandidate> = pool
                    .into_iter()
                    .map(|(size, min_players)| GroupCandidate { size, min_players })
                    .collect();
                candidates.sort_by(|a, b| b.min_players.cmp(&a.min_players));

                if let Some(range) = select_max_group_desc(free_slots, occupants, &candidates) {
                    let total: u32 = candidates[range.clone()].iter().map(|c| c.size).sum();
                    prop_assert!(total >= 1);
                    prop_assert!(total <= free_slots);
                    let threshold =
                        candidates[range.start].min_players.saturating_sub(occupants);
                    prop_assert!(threshold <= total);
                }
            }
        }
    }

    #[test]
    fn test_match_quality_penalizes_loose_ping_margin() {
        let base = 2000.0;
        let tight = match_quality(
            base,
            &[QualityInput {
                wait_seconds: 0.0,
                ping: 95,
                max_ping: Some(100),
            }],
        );
        let loose = match_quality(
            base,
            &[QualityInput {
                wait_seconds: 0.0,
                ping: 10,
                max_ping: Some(100),
            }],
        );
        assert!(tight > loose);
    }
}
