//! Per-leg stop-loss and profit-retreat (trailing stop) state.
//!
//! A tracker is created when a leg opens and dropped when it closes. Its risk
//! parameters are frozen at creation, so later profile edits do not move an
//! open position's exits. Once armed, the trailing stop stays armed until the
//! tracker is dropped.

use crate::domain::entities::order::PositionSide;
use crate::domain::entities::robot::{MarketState, RiskParams};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Peak profits at or below this are too small to measure a retreat against
const MIN_PEAK_PROFIT: f64 = 0.001;

/// Retreat beyond this percent closes regardless of the configured value
const HARD_RETREAT_PERCENT: f64 = 200.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrozenRisk {
    pub stop_loss_percent: f64,
    pub auto_start_retreat_percent: f64,
    pub profit_retreat_percent: f64,
    pub margin_percent: f64,
    pub market_state: MarketState,
}

impl FrozenRisk {
    /// Used for adopted legs when the robot has no params for the state
    pub fn fallback(market_state: MarketState) -> Self {
        Self {
            stop_loss_percent: 10.0,
            auto_start_retreat_percent: 5.0,
            profit_retreat_percent: 30.0,
            margin_percent: 0.0,
            market_state,
        }
    }

    pub fn capture(params: &RiskParams, market_state: MarketState) -> Self {
        Self {
            stop_loss_percent: params.stop_loss_percent,
            auto_start_retreat_percent: params.auto_start_retreat_percent,
            profit_retreat_percent: params.profit_retreat_percent,
            margin_percent: params.margin_percent,
            market_state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TrackerDecision {
    Hold,
    StopLoss { progress: f64 },
    ProfitRetreat { retreat_percent: f64, peak: f64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionTracker {
    pub side: PositionSide,
    /// Ledger row this tracker belongs to
    pub order_id: Option<i64>,
    pub entry_margin: f64,
    pub entry_time: DateTime<Utc>,
    pub highest_profit: f64,
    pub lowest_profit: f64,
    trailing_armed: bool,
    pub risk: FrozenRisk,
}

impl PositionTracker {
    pub fn new(side: PositionSide, order_id: Option<i64>, entry_margin: f64, risk: FrozenRisk) -> Self {
        Self {
            side,
            order_id,
            entry_margin,
            entry_time: Utc::now(),
            highest_profit: 0.0,
            lowest_profit: 0.0,
            trailing_armed: false,
            risk,
        }
    }

    pub fn is_trailing_armed(&self) -> bool {
        self.trailing_armed
    }

    /// Feeds one profit observation and decides whether the leg must close.
    ///
    /// `margin` is the margin currently committed; the entry margin is used when it is unknown.
    pub fn observe(&mut self, pnl: f64, margin: f64) -> TrackerDecision {
        if !pnl.is_finite() {
            return TrackerDecision::Hold;
        }
        self.highest_profit = self.highest_profit.max(pnl);
        self.lowest_profit = self.lowest_profit.min(pnl);

        let margin = if margin > 0.0 { margin } else { self.entry_margin };
        if !(margin > 0.0) {
            return TrackerDecision::Hold;
        }

        if pnl < 0.0 && self.risk.stop_loss_percent > 0.0 {
            let allowed_loss = margin * self.risk.stop_loss_percent / 100.0;
            let progress = pnl.abs() / allowed_loss * 100.0;
            if progress >= 100.0 {
                return TrackerDecision::StopLoss { progress };
            }
        }

        if !self.trailing_armed
            && self.risk.auto_start_retreat_percent > 0.0
            && pnl > 0.0
            && pnl / margin * 100.0 >= self.risk.auto_start_retreat_percent
        {
            self.trailing_armed = true;
        }

        if self.trailing_armed && self.risk.profit_retreat_percent > 0.0 {
            let peak = self.highest_profit;
            if peak <= MIN_PEAK_PROFIT {
                return TrackerDecision::Hold;
            }
            let retreat_percent = (peak - pnl) / peak * 100.0;
            if retreat_percent >= self.risk.profit_retreat_percent
                || retreat_percent > HARD_RETREAT_PERCENT
            {
                return TrackerDecision::ProfitRetreat {
                    retreat_percent,
                    peak,
                };
            }
        }

        TrackerDecision::Hold
    }
}

/// Unrealized profit of a leg at `current` price
pub fn realtime_pnl(side: PositionSide, entry: f64, current: f64, amount: f64) -> f64 {
    match side {
        PositionSide::Long => (current - entry) * amount.abs(),
        PositionSide::Short => (entry - current) * amount.abs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn risk(stop: f64, auto: f64, retreat: f64) -> FrozenRisk {
        FrozenRisk {
            stop_loss_percent: stop,
            auto_start_retreat_percent: auto,
            profit_retreat_percent: retreat,
            margin_percent: 10.0,
            market_state: MarketState::Trend,
        }
    }

    #[test]
    fn test_stop_loss_progress() {
        let mut tracker = PositionTracker::new(PositionSide::Long, Some(1), 100.0, risk(10.0, 5.0, 30.0));
        assert_eq!(tracker.observe(-5.0, 100.0), TrackerDecision::Hold);
        match tracker.observe(-10.0, 100.0) {
            TrackerDecision::StopLoss { progress } => assert!((progress - 100.0).abs() < 1e-9),
            other => panic!("expected stop loss, got {:?}", other),
        }
    }

    #[test]
    fn test_trailing_arms_then_triggers_on_retreat() {
        let mut tracker = PositionTracker::new(PositionSide::Long, Some(1), 100.0, risk(10.0, 5.0, 30.0));
        assert_eq!(tracker.observe(4.0, 100.0), TrackerDecision::Hold);
        assert!(!tracker.is_trailing_armed());

        assert_eq!(tracker.observe(10.0, 100.0), TrackerDecision::Hold);
        assert!(tracker.is_trailing_armed());

        // 20% retreat from the 10.0 peak
        assert_eq!(tracker.observe(8.0, 100.0), TrackerDecision::Hold);
        match tracker.observe(7.0, 100.0) {
            TrackerDecision::ProfitRetreat { retreat_percent, peak } => {
                assert!((retreat_percent - 30.0).abs() < 1e-9);
                assert_eq!(peak, 10.0);
            }
            other => panic!("expected retreat, got {:?}", other),
        }
    }

    #[test]
    fn test_highest_profit_is_monotonic_and_arming_sticks() {
        let mut tracker = PositionTracker::new(PositionSide::Short, Some(1), 100.0, risk(50.0, 5.0, 90.0));
        let observations = [1.0, 6.0, 3.0, 12.0, 2.0, 11.0, 1.5, -3.0, 4.0];
        let mut last_peak = f64::MIN;
        let mut armed_seen = false;
        for pnl in observations {
            tracker.observe(pnl, 100.0);
            assert!(tracker.highest_profit >= last_peak);
            last_peak = tracker.highest_profit;
            if armed_seen {
                assert!(tracker.is_trailing_armed());
            }
            armed_seen |= tracker.is_trailing_armed();
        }
        assert_eq!(tracker.highest_profit, 12.0);
        assert_eq!(tracker.lowest_profit, -3.0);
    }

    #[test]
    fn test_hard_retreat_limit() {
        let mut tracker = PositionTracker::new(PositionSide::Long, None, 100.0, risk(90.0, 1.0, 100.0));
        tracker.observe(2.0, 100.0);
        assert!(tracker.is_trailing_armed());
        // profit swung to a loss: retreat of 250%
        assert!(matches!(
            tracker.observe(-3.0, 100.0),
            TrackerDecision::ProfitRetreat { .. }
        ));
    }

    #[test]
    fn test_realtime_pnl_sides() {
        assert_eq!(realtime_pnl(PositionSide::Long, 100.0, 110.0, 2.0), 20.0);
        assert_eq!(realtime_pnl(PositionSide::Short, 100.0, 110.0, -2.0), -20.0);
    }
}
