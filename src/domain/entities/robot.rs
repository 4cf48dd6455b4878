//! Robot desired state and its structured risk profile.

use crate::domain::entities::platform::Platform;
use crate::domain::errors::ValidationError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Desired-state status codes as persisted in `robots.status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RobotStatus {
    NotStarted,
    Running,
    Paused,
    Stopped,
}

impl RobotStatus {
    pub fn code(&self) -> i64 {
        match self {
            RobotStatus::NotStarted => 1,
            RobotStatus::Running => 2,
            RobotStatus::Paused => 3,
            RobotStatus::Stopped => 4,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, ValidationError> {
        match code {
            1 => Ok(RobotStatus::NotStarted),
            2 => Ok(RobotStatus::Running),
            3 => Ok(RobotStatus::Paused),
            4 => Ok(RobotStatus::Stopped),
            other => Err(ValidationError::UnknownRobotStatus(other)),
        }
    }
}

/// Regime reported by the external market analyser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketState {
    Trend,
    Volatile,
    HighVolatility,
    LowVolatility,
}

impl MarketState {
    pub const ALL: [MarketState; 4] = [
        MarketState::Trend,
        MarketState::Volatile,
        MarketState::HighVolatility,
        MarketState::LowVolatility,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketState::Trend => "trend",
            MarketState::Volatile => "volatile",
            MarketState::HighVolatility => "high_volatility",
            MarketState::LowVolatility => "low_volatility",
        }
    }
}

impl fmt::Display for MarketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketState {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trend" | "trending" => Ok(MarketState::Trend),
            "volatile" | "range" | "ranging" => Ok(MarketState::Volatile),
            "high_volatility" | "high-volatility" => Ok(MarketState::HighVolatility),
            "low_volatility" | "low-volatility" => Ok(MarketState::LowVolatility),
            other => Err(ValidationError::UnknownMarketState(other.to_string())),
        }
    }
}

/// Trading and risk parameters for one market state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskParams {
    pub window_secs: u64,
    /// Absolute price move that triggers a window signal
    pub threshold: f64,
    pub stop_loss_percent: f64,
    pub auto_start_retreat_percent: f64,
    pub profit_retreat_percent: f64,
    pub margin_percent: f64,
}

impl RiskParams {
    pub fn validate(&self, state: MarketState) -> Result<(), ValidationError> {
        let invalid = |field: &'static str, value: f64| ValidationError::InvalidRiskParameter {
            state: state.to_string(),
            field,
            value,
        };

        if self.window_secs == 0 {
            return Err(invalid("window_secs", 0.0));
        }
        if !(self.threshold > 0.0) {
            return Err(invalid("threshold", self.threshold));
        }
        if !(self.stop_loss_percent > 0.0 && self.stop_loss_percent <= 100.0) {
            return Err(invalid("stop_loss_percent", self.stop_loss_percent));
        }
        if !(self.auto_start_retreat_percent >= 0.0) {
            return Err(invalid(
                "auto_start_retreat_percent",
                self.auto_start_retreat_percent,
            ));
        }
        if !(self.profit_retreat_percent >= 0.0 && self.profit_retreat_percent <= 100.0) {
            return Err(invalid("profit_retreat_percent", self.profit_retreat_percent));
        }
        if !(self.margin_percent > 0.0 && self.margin_percent <= 100.0) {
            return Err(invalid("margin_percent", self.margin_percent));
        }
        Ok(())
    }
}

/// Per-market-state parameters owned by a robot.
///
/// Validated as a whole on write: every [`MarketState`] must be present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskProfile {
    params: BTreeMap<MarketState, RiskParams>,
}

impl RiskProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same parameters for every market state
    pub fn uniform(params: RiskParams) -> Self {
        let mut profile = Self::new();
        for state in MarketState::ALL {
            profile.set(state, params.clone());
        }
        profile
    }

    pub fn with(mut self, state: MarketState, params: RiskParams) -> Self {
        self.set(state, params);
        self
    }

    pub fn set(&mut self, state: MarketState, params: RiskParams) {
        self.params.insert(state, params);
    }

    pub fn params_for(&self, state: MarketState) -> Result<&RiskParams, ValidationError> {
        self.params
            .get(&state)
            .ok_or_else(|| ValidationError::MissingMarketState(state.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MarketState, &RiskParams)> {
        self.params.iter()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for state in MarketState::ALL {
            self.params_for(state)?.validate(state)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Robot {
    pub id: i64,
    pub name: String,
    pub credential_id: i64,
    pub platform: Platform,
    pub symbol: String,
    pub status: RobotStatus,
    pub leverage: f64,
    pub max_runtime_secs: Option<i64>,
    pub schedule_start: Option<DateTime<Utc>>,
    pub schedule_stop: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub pause_time: Option<DateTime<Utc>>,
    pub default_market_state: MarketState,
    pub total_profit: f64,
    pub risk_profile: RiskProfile,
}

impl Robot {
    pub fn runtime_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.max_runtime_secs, self.start_time) {
            (Some(max), Some(start)) if max > 0 => start + Duration::seconds(max) <= now,
            _ => false,
        }
    }

    pub fn effective_leverage(&self) -> f64 {
        if self.leverage > 0.0 {
            self.leverage
        } else {
            1.0
        }
    }
}
