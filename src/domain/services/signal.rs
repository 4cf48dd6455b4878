//! Price-window breakout signal.
//!
//! Stateless: the result depends only on the window contents and threshold.

use crate::domain::entities::order::PositionSide;
use crate::domain::services::price_window::PriceWindow;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalDirection {
    Long,
    Short,
    Neutral,
}

impl SignalDirection {
    pub fn position_side(&self) -> Option<PositionSide> {
        match self {
            SignalDirection::Long => Some(PositionSide::Long),
            SignalDirection::Short => Some(PositionSide::Short),
            SignalDirection::Neutral => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalAction {
    OpenLong,
    OpenShort,
    Hold,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowSignal {
    pub direction: SignalDirection,
    pub action: SignalAction,
    /// 100 when triggered, 0 otherwise
    pub strength: f64,
    /// Percent of the way to the nearer trigger, capped at 100
    pub progress: f64,
    pub min: f64,
    pub max: f64,
    pub current: f64,
    pub sample_count: usize,
}

impl WindowSignal {
    fn neutral(sample_count: usize) -> Self {
        Self {
            direction: SignalDirection::Neutral,
            action: SignalAction::Hold,
            strength: 0.0,
            progress: 0.0,
            min: 0.0,
            max: 0.0,
            current: 0.0,
            sample_count,
        }
    }
}

/// LONG when price rose `threshold` above the window low, SHORT when it fell
/// `threshold` below the window high; both at once is NEUTRAL.
pub fn evaluate_window_signal(window: &PriceWindow, threshold: f64) -> WindowSignal {
    let Some(stats) = window.stats() else {
        return WindowSignal::neutral(0);
    };
    if stats.count < 2 || !(threshold > 0.0) {
        return WindowSignal::neutral(stats.count);
    }

    let distance_from_max = stats.max - stats.current;
    let distance_from_min = stats.current - stats.min;
    let short_triggered = distance_from_max >= threshold;
    let long_triggered = distance_from_min >= threshold;

    let (direction, action, strength, progress) = match (long_triggered, short_triggered) {
        (true, true) => (SignalDirection::Neutral, SignalAction::Hold, 0.0, 100.0),
        (true, false) => (SignalDirection::Long, SignalAction::OpenLong, 100.0, 100.0),
        (false, true) => (SignalDirection::Short, SignalAction::OpenShort, 100.0, 100.0),
        (false, false) => {
            let long_progress = distance_from_min / threshold * 100.0;
            let short_progress = distance_from_max / threshold * 100.0;
            (
                SignalDirection::Neutral,
                SignalAction::Hold,
                0.0,
                long_progress.max(short_progress).min(100.0),
            )
        }
    };

    WindowSignal {
        direction,
        action,
        strength,
        progress,
        min: stats.min,
        max: stats.max,
        current: stats.current,
        sample_count: stats.count,
    }
}
