// =============================================================================
// Protection State — R-ladder stops, trailing, and partial-profit rungs
// =============================================================================
//
// Pure per-position state machine evaluated by the position manager on every
// cycle. All arithmetic is in R units (R = initial risk per share).
//
// Stop ladder with partial profits enabled (the partial at +2R realizes 1R
// on the original size, so the stop itself only needs breakeven):
//   >= 1R            stop to breakeven
//   trailing >= 2R   lock (best_r - 2.0) * 0.5 R, ratcheting with best price
//
// Stop ladder with partial profits disabled (the stop is the only harvest):
//   >= 1R    breakeven
//   >= 1.5R  lock 0.5R
//   >= 2R    lock 1R, trailing activates
//   >= 3R    lock 1.5R
//   >= 4R    lock 2R
//
// Partial-profit rungs (fractions of ORIGINAL quantity, side-aware):
//   +2R  sell 50%      +3R  sell 25%      +4R  close the remainder
//
// Invariants: the stop only ever moves in the favorable direction; the
// trailing distance is the wider of the percent trail and the ATR trail; a
// rung fires at most once per position, across restarts.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::types::Side;

/// Full stop ladder used when partial profits are disabled: (at R, lock R).
const FULL_STOP_LADDER: &[(f64, f64)] = &[
    (1.0, 0.0),
    (1.5, 0.5),
    (2.0, 1.0),
    (3.0, 1.5),
    (4.0, 2.0),
];

/// Partial-profit rungs: (at R, fraction of original qty, label).
/// The final rung closes whatever remains.
const PARTIAL_LADDER: &[(f64, f64, &str)] = &[(2.0, 0.50, "2R"), (3.0, 0.25, "3R"), (4.0, 1.0, "4R")];

/// Stop moves smaller than this (in price units) are not worth a replace
/// round-trip to the broker.
const MIN_STOP_IMPROVEMENT: f64 = 1e-6;

// =============================================================================
// Actions
// =============================================================================

/// What the position manager should do for a position this cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtectionAction {
    /// Replace the working stop with a tighter one.
    MoveStop { new_stop: f64, reason: String },
    /// Sell (side-aware) part of the position at a ladder rung.
    PartialExit {
        qty: f64,
        rung: String,
        r_level: f64,
    },
    /// Close everything that remains (the +4R rung).
    CloseRemainder { rung: String, r_level: f64 },
}

// =============================================================================
// ProtectionState
// =============================================================================

/// Mutable trailing/ladder state for a single position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionState {
    pub side: Side,
    pub entry_price: f64,
    pub initial_stop: f64,
    /// R denominator: |entry - initial stop|.
    pub risk_per_share: f64,
    /// Current protective stop (starts at the initial stop).
    pub current_stop: f64,
    /// Best price seen since entry (highest for longs, lowest for shorts).
    pub best_price: f64,
    pub trailing_active: bool,
    /// ATR at entry, feeding the ATR side of the trail-distance floor.
    pub atr: f64,
    /// Rung labels already executed ("2R", "3R", "4R").
    pub partials_taken: Vec<String>,
}

impl ProtectionState {
    pub fn new(side: Side, entry_price: f64, initial_stop: f64, atr: f64) -> Self {
        let risk = (entry_price - initial_stop).abs();
        Self {
            side,
            entry_price,
            initial_stop,
            risk_per_share: risk,
            current_stop: initial_stop,
            best_price: entry_price,
            trailing_active: false,
            atr,
            partials_taken: Vec::new(),
        }
    }

    /// Re-hydrate rungs already taken before a restart.
    pub fn with_partials_taken(mut self, taken: Vec<String>) -> Self {
        self.partials_taken = taken;
        self
    }

    /// Profit at `price` in R units (negative when under water).
    pub fn r_at(&self, price: f64) -> f64 {
        if self.risk_per_share <= 0.0 {
            return 0.0;
        }
        self.side.direction() * (price - self.entry_price) / self.risk_per_share
    }

    /// Evaluate one price tick. Returns the actions to take, in order.
    ///
    /// `remaining_qty` is the live position size, `original_qty` the size at
    /// entry (partial fractions are of the original). `trailing_allowed`
    /// lets the manager cap trailing to the N most profitable positions.
    pub fn evaluate(
        &mut self,
        price: f64,
        original_qty: f64,
        remaining_qty: f64,
        trailing_allowed: bool,
        config: &RuntimeConfig,
    ) -> Vec<ProtectionAction> {
        let mut actions = Vec::new();
        if price <= 0.0 || self.risk_per_share <= 0.0 {
            return actions;
        }

        // ── Track best price ────────────────────────────────────────────
        let improved = match self.side {
            Side::Buy => price > self.best_price,
            Side::Sell => price < self.best_price,
        };
        if improved {
            self.best_price = price;
        }

        let best_r = self.r_at(self.best_price);
        let current_r = self.r_at(price);

        // ── Partial-profit rungs (fire before stop moves so the 4R close
        //    wins over a same-tick stop replace) ──────────────────────────
        if config.partial_profit_enabled {
            for &(r_level, fraction, label) in PARTIAL_LADDER {
                if current_r >= r_level && !self.partials_taken.iter().any(|t| t == label) {
                    self.partials_taken.push(label.to_string());

                    if (fraction - 1.0).abs() < f64::EPSILON {
                        actions.push(ProtectionAction::CloseRemainder {
                            rung: label.to_string(),
                            r_level,
                        });
                        // Nothing left to protect after a full close.
                        return actions;
                    }

                    let qty = (original_qty * fraction).floor().min(remaining_qty);
                    if qty >= 1.0 {
                        actions.push(ProtectionAction::PartialExit {
                            qty,
                            rung: label.to_string(),
                            r_level,
                        });
                    }
                }
            }
        }

        // ── Ladder stop candidate ───────────────────────────────────────
        let mut candidate = self.current_stop;

        let ladder_lock = if config.partial_profit_enabled {
            // Partials carry the harvest; the stop ladder only needs
            // breakeven once +1R prints.
            if best_r >= 1.0 {
                Some(0.0)
            } else {
                None
            }
        } else {
            FULL_STOP_LADDER
                .iter()
                .rev()
                .find(|(at, _)| best_r >= *at)
                .map(|(_, lock)| *lock)
        };

        if let Some(lock_r) = ladder_lock {
            let ladder_stop = self.stop_for_locked_r(lock_r);
            candidate = self.tighter(candidate, ladder_stop);
        }

        // ── Trailing ────────────────────────────────────────────────────
        if config.trailing_enabled && trailing_allowed && best_r >= config.trailing_activation_r {
            self.trailing_active = true;
        }

        if self.trailing_active {
            // Lock a configurable share of every R gained past activation.
            let locked_r = (best_r - config.trailing_activation_r).max(0.0)
                * config.trailing_distance_r;
            let mut trail_stop = self.stop_for_locked_r(locked_r);

            // The trail never sits closer to the best price than the wider
            // of the percent trail and the ATR trail.
            let min_distance = (self.best_price * config.trailing_pct).max(self.atr);
            let capped = match self.side {
                Side::Buy => self.best_price - min_distance,
                Side::Sell => self.best_price + min_distance,
            };
            trail_stop = self.looser(trail_stop, capped);

            candidate = self.tighter(candidate, trail_stop);
        }

        // ── Ratchet: only favorable moves, never loosen ─────────────────
        let improves = match self.side {
            Side::Buy => candidate > self.current_stop + MIN_STOP_IMPROVEMENT,
            Side::Sell => candidate < self.current_stop - MIN_STOP_IMPROVEMENT,
        };
        if improves {
            let reason = if self.trailing_active {
                format!("trail ratchet at {best_r:.1}R")
            } else {
                format!("ladder lock at {best_r:.1}R")
            };
            self.current_stop = candidate;
            actions.push(ProtectionAction::MoveStop {
                new_stop: candidate,
                reason,
            });
        }

        actions
    }

    /// Record that a rung was handled externally (e.g. hydrated from
    /// persistence after a restart mid-evaluation).
    pub fn mark_partial_taken(&mut self, rung: &str) {
        if !self.partials_taken.iter().any(|t| t == rung) {
            self.partials_taken.push(rung.to_string());
        }
    }

    /// Stop price that locks `lock_r` R of profit.
    fn stop_for_locked_r(&self, lock_r: f64) -> f64 {
        self.entry_price + self.side.direction() * lock_r * self.risk_per_share
    }

    /// The tighter (more protective) of two stops for this side.
    fn tighter(&self, a: f64, b: f64) -> f64 {
        match self.side {
            Side::Buy => a.max(b),
            Side::Sell => a.min(b),
        }
    }

    /// The looser (further from price) of two stops for this side.
    fn looser(&self, a: f64, b: f64) -> f64 {
        match self.side {
            Side::Buy => a.min(b),
            Side::Sell => a.max(b),
        }
    }
}

// =============================================================================
// Protective stop reconstruction
// =============================================================================

/// The protective stop for a position discovered without one: the wider of
/// the percent floor and the ATR stop, on the protective side of entry.
pub fn protective_stop(side: Side, entry_price: f64, atr: f64, config: &RuntimeConfig) -> f64 {
    let floor_dist = entry_price * config.min_stop_pct;
    let atr_dist = atr * config.stop_atr_mult;
    let dist = floor_dist.max(atr_dist);
    match side {
        Side::Buy => entry_price - dist,
        Side::Sell => entry_price + dist,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RuntimeConfig {
        RuntimeConfig::default()
    }

    /// Long entry $100, stop $98 (R = $2), qty 100 — the canonical ladder
    /// walk-through.
    fn long_state() -> ProtectionState {
        ProtectionState::new(Side::Buy, 100.0, 98.0, 0.0)
    }

    fn stop_moves(actions: &[ProtectionAction]) -> Vec<f64> {
        actions
            .iter()
            .filter_map(|a| match a {
                ProtectionAction::MoveStop { new_stop, .. } => Some(*new_stop),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn ladder_walkthrough_with_partials() {
        let cfg = config();
        let mut state = long_state();

        // +2R ($104): sell 50, stop to breakeven, trailing activates.
        let actions = state.evaluate(104.0, 100.0, 100.0, true, &cfg);
        assert!(
            actions.contains(&ProtectionAction::PartialExit {
                qty: 50.0,
                rung: "2R".to_string(),
                r_level: 2.0
            }),
            "missing 2R partial: {actions:?}"
        );
        assert_eq!(stop_moves(&actions), vec![100.0]);
        assert!(state.trailing_active);

        // +3R ($106): sell 25, stop to $101 (0.5R locked by the trail).
        let actions = state.evaluate(106.0, 100.0, 50.0, true, &cfg);
        assert!(
            actions.contains(&ProtectionAction::PartialExit {
                qty: 25.0,
                rung: "3R".to_string(),
                r_level: 3.0
            }),
            "missing 3R partial: {actions:?}"
        );
        assert_eq!(stop_moves(&actions), vec![101.0]);

        // +4R ($108): close the remaining 25.
        let actions = state.evaluate(108.0, 100.0, 25.0, true, &cfg);
        assert_eq!(
            actions,
            vec![ProtectionAction::CloseRemainder {
                rung: "4R".to_string(),
                r_level: 4.0
            }]
        );
    }

    #[test]
    fn rungs_fire_at_most_once() {
        let cfg = config();
        let mut state = long_state();

        let first = state.evaluate(104.0, 100.0, 100.0, true, &cfg);
        assert!(first
            .iter()
            .any(|a| matches!(a, ProtectionAction::PartialExit { .. })));

        // Same price again: no second 2R exit, no duplicate stop move.
        let second = state.evaluate(104.0, 100.0, 50.0, true, &cfg);
        assert!(second.is_empty(), "unexpected repeat actions: {second:?}");
    }

    #[test]
    fn hydrated_rungs_do_not_double_take() {
        let cfg = config();
        let mut state = long_state().with_partials_taken(vec!["2R".to_string()]);

        let actions = state.evaluate(104.0, 100.0, 50.0, true, &cfg);
        assert!(
            !actions
                .iter()
                .any(|a| matches!(a, ProtectionAction::PartialExit { .. })),
            "restart double-took the 2R rung: {actions:?}"
        );
    }

    #[test]
    fn stop_never_loosens_on_pullback() {
        let cfg = config();
        let mut state = long_state();

        state.evaluate(104.0, 100.0, 100.0, true, &cfg);
        let stop_after_high = state.current_stop;
        assert_eq!(stop_after_high, 100.0);

        // Pull back hard: stop must hold.
        let actions = state.evaluate(101.0, 100.0, 50.0, true, &cfg);
        assert!(stop_moves(&actions).is_empty());
        assert_eq!(state.current_stop, stop_after_high);

        // New high resumes the ratchet upward only.
        state.evaluate(107.0, 100.0, 50.0, true, &cfg);
        assert!(state.current_stop >= stop_after_high);
    }

    #[test]
    fn trailing_respects_min_distance_floor() {
        let mut cfg = config();
        cfg.partial_profit_enabled = false;
        cfg.trailing_distance_r = 1.0; // aggressive lock...
        cfg.trailing_pct = 0.05; // ...but a 5% floor keeps distance honest

        let mut state = long_state();
        // +6R ($112): the aggressive lock alone would trail at $108, but the
        // 5% floor (112 * 0.05 = 5.6) caps the stop at $106.40.
        state.evaluate(112.0, 100.0, 100.0, true, &cfg);

        assert!(
            (state.current_stop - 106.4).abs() < 1e-9,
            "stop {} should sit at the distance floor",
            state.current_stop
        );
    }

    #[test]
    fn full_ladder_when_partials_disabled() {
        let mut cfg = config();
        cfg.partial_profit_enabled = false;
        cfg.trailing_enabled = false;

        let mut state = long_state();

        state.evaluate(102.0, 100.0, 100.0, false, &cfg); // +1R
        assert_eq!(state.current_stop, 100.0); // breakeven

        state.evaluate(103.0, 100.0, 100.0, false, &cfg); // +1.5R
        assert_eq!(state.current_stop, 101.0); // lock 0.5R

        state.evaluate(104.0, 100.0, 100.0, false, &cfg); // +2R
        assert_eq!(state.current_stop, 102.0); // lock 1R

        state.evaluate(106.0, 100.0, 100.0, false, &cfg); // +3R
        assert_eq!(state.current_stop, 103.0); // lock 1.5R

        state.evaluate(108.0, 100.0, 100.0, false, &cfg); // +4R
        assert_eq!(state.current_stop, 104.0); // lock 2R

        // No partial exits ever fired.
        assert!(state.partials_taken.is_empty());
    }

    #[test]
    fn short_side_mirrors() {
        let cfg = config();
        // Short entry $100, stop $102 (R = $2).
        let mut state = ProtectionState::new(Side::Sell, 100.0, 102.0, 0.0);

        // +2R for a short is $96.
        let actions = state.evaluate(96.0, 100.0, 100.0, true, &cfg);
        assert!(actions.contains(&ProtectionAction::PartialExit {
            qty: 50.0,
            rung: "2R".to_string(),
            r_level: 2.0
        }));
        assert_eq!(stop_moves(&actions), vec![100.0]); // breakeven from above

        // +3R ($94): stop to $99 (0.5R locked).
        let actions = state.evaluate(94.0, 100.0, 50.0, true, &cfg);
        assert_eq!(stop_moves(&actions), vec![99.0]);

        // Stop never loosens upward on a bounce.
        let actions = state.evaluate(97.0, 100.0, 25.0, true, &cfg);
        assert!(stop_moves(&actions).is_empty());
        assert_eq!(state.current_stop, 99.0);
    }

    #[test]
    fn trailing_not_allowed_keeps_ladder_only() {
        let cfg = config();
        let mut state = long_state();

        // +2.5R with trailing disallowed (position not in the top-N).
        state.evaluate(105.0, 100.0, 100.0, false, &cfg);
        assert!(!state.trailing_active);
        // Ladder still moved the stop to breakeven.
        assert_eq!(state.current_stop, 100.0);
    }

    #[test]
    fn underwater_position_takes_no_action() {
        let cfg = config();
        let mut state = long_state();

        let actions = state.evaluate(99.0, 100.0, 100.0, true, &cfg);
        assert!(actions.is_empty());
        assert_eq!(state.current_stop, 98.0);
        assert!(!state.trailing_active);
    }

    #[test]
    fn r_at_signs() {
        let state = long_state();
        assert!((state.r_at(104.0) - 2.0).abs() < 1e-10);
        assert!((state.r_at(98.0) + 1.0).abs() < 1e-10);

        let short = ProtectionState::new(Side::Sell, 100.0, 102.0, 0.0);
        assert!((short.r_at(96.0) - 2.0).abs() < 1e-10);
    }

    #[test]
    fn protective_stop_takes_the_wider_distance() {
        let cfg = config();
        // ATR stop wider: 2.5 * 0.8 = 2.0 > 1.5% of 50 = 0.75.
        let stop = protective_stop(Side::Buy, 50.0, 0.8, &cfg);
        assert!((stop - 48.0).abs() < 1e-10);

        // Percent floor wider: 2.5 * 0.1 = 0.25 < 0.75.
        let stop = protective_stop(Side::Buy, 50.0, 0.1, &cfg);
        assert!((stop - 49.25).abs() < 1e-10);

        // Short mirrors above entry.
        let stop = protective_stop(Side::Sell, 50.0, 0.8, &cfg);
        assert!((stop - 52.0).abs() < 1e-10);
    }
}
