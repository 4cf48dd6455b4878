//! Rolling price history feeding the engine's range signal.
//!
//! Samples arrive in time order from the ticker poll; the window keeps only
//! the trailing `window_secs` and reports min, max and latest price.

use serde::Serialize;
use std::collections::VecDeque;

/// Hard cap on retained samples regardless of window length
pub const MAX_WINDOW_POINTS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PricePoint {
    pub timestamp_ms: i64,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowStats {
    pub min: f64,
    pub max: f64,
    pub current: f64,
    pub count: usize,
}

/// Trailing time window of price samples.
///
/// Every insert evicts samples older than `window_secs` relative to the
/// newest sample, then trims to [`MAX_WINDOW_POINTS`].
#[derive(Debug, Clone)]
pub struct PriceWindow {
    points: VecDeque<PricePoint>,
    window_secs: u64,
    capacity: usize,
}

impl PriceWindow {
    pub fn new(window_secs: u64) -> Self {
        Self::with_capacity(window_secs, MAX_WINDOW_POINTS)
    }

    pub fn with_capacity(window_secs: u64, capacity: usize) -> Self {
        Self {
            points: VecDeque::new(),
            window_secs,
            capacity: capacity.max(1),
        }
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    /// Changes the window length and prunes immediately
    pub fn set_window(&mut self, window_secs: u64) {
        if self.window_secs != window_secs {
            self.window_secs = window_secs;
            if let Some(last) = self.points.back().copied() {
                self.evict(last.timestamp_ms);
            }
        }
    }

    pub fn push(&mut self, timestamp_ms: i64, price: f64) {
        if !(price > 0.0) || !price.is_finite() {
            return;
        }
        // keep samples ordered; late samples are dropped
        if let Some(last) = self.points.back() {
            if timestamp_ms < last.timestamp_ms {
                return;
            }
        }
        self.points.push_back(PricePoint {
            timestamp_ms,
            price,
        });
        self.evict(timestamp_ms);
    }

    fn evict(&mut self, now_ms: i64) {
        let cutoff = now_ms - (self.window_secs as i64) * 1000;
        while let Some(front) = self.points.front() {
            if front.timestamp_ms < cutoff {
                self.points.pop_front();
            } else {
                break;
            }
        }
        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn latest(&self) -> Option<PricePoint> {
        self.points.back().copied()
    }

    pub fn stats(&self) -> Option<WindowStats> {
        let current = self.points.back()?.price;
        let (min, max) = self
            .points
            .iter()
            .fold((f64::MAX, f64::MIN), |(lo, hi), p| (lo.min(p.price), hi.max(p.price)));
        Some(WindowStats {
            min,
            max,
            current,
            count: self.points.len(),
        })
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_samples_older_than_window() {
        let mut window = PriceWindow::new(10);
        window.push(0, 100.0);
        window.push(5_000, 101.0);
        window.push(10_000, 102.0);
        assert_eq!(window.len(), 3);

        window.push(15_001, 103.0);
        let stats = window.stats().unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.min, 102.0);
        assert_eq!(stats.max, 103.0);
        assert_eq!(stats.current, 103.0);
    }

    #[test]
    fn test_capacity_bound() {
        let mut window = PriceWindow::with_capacity(3600, 3);
        for i in 0..10 {
            window.push(i * 1000, 100.0 + i as f64);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.stats().unwrap().min, 107.0);
    }

    #[test]
    fn test_rejects_invalid_and_late_samples() {
        let mut window = PriceWindow::new(60);
        window.push(1_000, 0.0);
        window.push(1_000, f64::NAN);
        window.push(2_000, 10.0);
        window.push(1_500, 11.0);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_shrinking_window_prunes() {
        let mut window = PriceWindow::new(60);
        window.push(0, 1.0);
        window.push(30_000, 2.0);
        window.push(50_000, 3.0);
        window.set_window(10);
        assert_eq!(window.len(), 1);
        assert!(PriceWindow::new(5).stats().is_none());
    }
}
