//! Database Models
//!
//! Row types for the ledger, raw exchange orders, fills, robots and
//! credentials, plus the write-side inputs.

use crate::domain::entities::credential::{Credential, ProxyConfig, ProxyKind};
use crate::domain::entities::market::ExchangeOrder;
use crate::domain::entities::order::{LedgerSource, LedgerStatus, OrderSide, PositionSide};
use crate::domain::entities::platform::Platform;
use crate::domain::entities::robot::{
    MarketState, RiskParams, RiskProfile, Robot, RobotStatus,
};
use crate::domain::errors::ValidationError;
use crate::domain::services::position_tracker::FrozenRisk;
use crate::domain::services::trade_aggregation::OpenLeg;
use super::exchange_order_repository::SYNC_MISSING_STATUS;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Ledger row in `orders`
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderRecord {
    pub id: i64,
    pub robot_id: i64,
    pub credential_id: i64,
    pub platform: String,
    pub symbol: String,
    pub exchange_order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub side: String,
    pub position_side: String,
    pub order_type: String,
    pub price: f64,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub avg_price: f64,
    pub leverage: f64,
    pub margin: f64,
    pub status: String,
    pub raw_status: Option<String>,
    pub is_open: bool,
    /// Venue update time of the last exchange fact applied to the row
    pub exchange_update_time_ms: Option<i64>,
    pub source: String,
    pub open_fee: Option<f64>,
    pub open_fee_currency: Option<String>,
    pub close_fee: Option<f64>,
    pub close_fee_currency: Option<String>,
    pub close_price: Option<f64>,
    pub close_order_id: Option<String>,
    pub realized_profit: Option<f64>,
    pub open_time: Option<DateTime<Utc>>,
    pub close_time: Option<DateTime<Utc>>,
    pub hold_duration_secs: Option<i64>,
    pub close_reason: Option<String>,
    pub mark_price: Option<f64>,
    pub unrealized_profit: Option<f64>,
    pub close_mark_price: Option<f64>,
    pub highest_profit: f64,
    pub stop_loss_percent: Option<f64>,
    pub auto_start_retreat_percent: Option<f64>,
    pub profit_retreat_percent: Option<f64>,
    pub margin_percent: Option<f64>,
    pub market_state: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRecord {
    pub fn leg(&self) -> Result<PositionSide, ValidationError> {
        self.position_side.parse()
    }

    pub fn ledger_status(&self) -> Result<LedgerStatus, ValidationError> {
        self.status.parse()
    }

    /// Still waiting on the exchange: PENDING, or canceled only because the
    /// order left the open-orders snapshot
    pub fn awaits_fill(&self) -> bool {
        match self.status.as_str() {
            "PENDING" => true,
            "CANCELED" => self.raw_status.as_deref() == Some(SYNC_MISSING_STATUS),
            _ => false,
        }
    }

    pub fn entry_price(&self) -> f64 {
        if self.avg_price > 0.0 {
            self.avg_price
        } else {
            self.price
        }
    }

    pub fn position_quantity(&self) -> f64 {
        if self.filled_quantity > 0.0 {
            self.filled_quantity
        } else {
            self.quantity
        }
    }

    pub fn open_time_ms(&self) -> i64 {
        self.open_time
            .or(Some(self.created_at))
            .map(|t| t.timestamp_millis())
            .unwrap_or_default()
    }

    pub fn open_leg(&self) -> Result<OpenLeg, ValidationError> {
        Ok(OpenLeg {
            side: self.leg()?,
            open_price: self.entry_price(),
            quantity: self.position_quantity(),
            open_time_ms: self.open_time_ms(),
        })
    }

    /// Risk parameters captured when the leg opened, if any were recorded
    pub fn frozen_risk(&self) -> Option<FrozenRisk> {
        Some(FrozenRisk {
            stop_loss_percent: self.stop_loss_percent?,
            auto_start_retreat_percent: self.auto_start_retreat_percent?,
            profit_retreat_percent: self.profit_retreat_percent?,
            margin_percent: self.margin_percent.unwrap_or_default(),
            market_state: self
                .market_state
                .as_deref()
                .and_then(|s| s.parse::<MarketState>().ok())
                .unwrap_or(MarketState::Trend),
        })
    }
}

/// Input for a new ledger row
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub robot_id: i64,
    pub credential_id: i64,
    pub platform: Platform,
    pub symbol: String,
    pub exchange_order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub side: OrderSide,
    pub position_side: PositionSide,
    pub order_type: String,
    pub price: f64,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub avg_price: f64,
    pub leverage: f64,
    pub margin: f64,
    pub status: LedgerStatus,
    pub raw_status: Option<String>,
    pub is_open: bool,
    pub exchange_update_time_ms: Option<i64>,
    pub source: LedgerSource,
    pub open_fee: Option<f64>,
    pub open_fee_currency: Option<String>,
    pub open_time: Option<DateTime<Utc>>,
    pub frozen_risk: Option<FrozenRisk>,
}

impl NewOrder {
    /// Row for an exchange order seen on a stream or in order history
    pub fn from_exchange(
        robot_id: i64,
        credential_id: i64,
        platform: Platform,
        order: &ExchangeOrder,
        status: LedgerStatus,
        source: LedgerSource,
    ) -> Self {
        let open_time = if status == LedgerStatus::Open {
            DateTime::from_timestamp_millis(order.update_time_ms.max(order.create_time_ms))
        } else {
            None
        };
        Self {
            robot_id,
            credential_id,
            platform,
            symbol: order.symbol.clone(),
            exchange_order_id: Some(order.order_id.clone()),
            client_order_id: order.client_order_id.clone(),
            side: order.side,
            position_side: order.leg(),
            order_type: order.order_type.clone(),
            price: order.price,
            quantity: order.quantity,
            filled_quantity: order.filled_quantity,
            avg_price: order.avg_price,
            leverage: 1.0,
            margin: 0.0,
            status,
            raw_status: Some(order.raw_status.clone()),
            is_open: order.is_open,
            exchange_update_time_ms: Some(order.update_time_ms),
            source,
            open_fee: None,
            open_fee_currency: None,
            open_time,
            frozen_risk: None,
        }
    }
}

/// Fields attached when a row closes; only missing values are written
#[derive(Debug, Clone, Default)]
pub struct CloseUpdate {
    pub close_price: f64,
    pub close_time: DateTime<Utc>,
    pub realized_profit: f64,
    pub close_order_id: Option<String>,
    pub close_fee: Option<f64>,
    pub close_fee_currency: Option<String>,
    pub close_mark_price: Option<f64>,
    pub close_reason: String,
    pub highest_profit: Option<f64>,
}

/// Result of the incremental ledger upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Updated(i64),
    Inserted(i64),
    /// Nothing written: not a ledger leg, or another OPEN row holds the side
    Skipped,
}

/// Row in `exchange_orders`
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExchangeOrderRecord {
    pub id: i64,
    pub platform: String,
    pub credential_id: i64,
    pub robot_id: Option<i64>,
    pub symbol: String,
    pub exchange_order_id: String,
    pub client_order_id: Option<String>,
    pub side: String,
    pub position_side: Option<String>,
    pub order_type: String,
    pub reduce_only: bool,
    pub price: f64,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub avg_price: f64,
    pub raw_status: String,
    pub status: String,
    pub is_open: bool,
    pub create_time_ms: i64,
    pub update_time_ms: i64,
    pub updated_at: DateTime<Utc>,
}

/// Row in `trade_fills`
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradeFillRecord {
    pub id: i64,
    pub credential_id: i64,
    pub platform: String,
    pub symbol: String,
    pub exchange_order_id: String,
    pub trade_id: String,
    pub side: String,
    pub position_side: Option<String>,
    pub price: f64,
    pub quantity: f64,
    pub realized_pnl: f64,
    pub fee: f64,
    pub fee_currency: String,
    pub trade_time_ms: i64,
    pub robot_id: Option<i64>,
    pub order_ledger_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Owner resolved for a fill's exchange order id
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow)]
pub struct OrderLink {
    pub robot_id: i64,
    pub ledger_id: i64,
}

/// Row in `robots`
#[derive(Debug, Clone, FromRow)]
pub struct RobotRecord {
    pub id: i64,
    pub name: String,
    pub credential_id: i64,
    pub platform: String,
    pub symbol: String,
    pub status: i64,
    pub leverage: f64,
    pub max_runtime_secs: Option<i64>,
    pub schedule_start: Option<DateTime<Utc>>,
    pub schedule_stop: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub pause_time: Option<DateTime<Utc>>,
    pub default_market_state: String,
    pub total_profit: f64,
}

impl RobotRecord {
    pub fn into_robot(self, risk_profile: RiskProfile) -> Result<Robot, ValidationError> {
        Ok(Robot {
            id: self.id,
            name: self.name,
            credential_id: self.credential_id,
            platform: self.platform.parse()?,
            symbol: self.symbol,
            status: RobotStatus::from_code(self.status)?,
            leverage: self.leverage,
            max_runtime_secs: self.max_runtime_secs,
            schedule_start: self.schedule_start,
            schedule_stop: self.schedule_stop,
            start_time: self.start_time,
            pause_time: self.pause_time,
            default_market_state: self.default_market_state.parse()?,
            total_profit: self.total_profit,
            risk_profile,
        })
    }
}

/// Row in `robot_risk_params`
#[derive(Debug, Clone, FromRow)]
pub struct RiskParamsRecord {
    pub robot_id: i64,
    pub market_state: String,
    pub window_secs: i64,
    pub threshold: f64,
    pub stop_loss_percent: f64,
    pub auto_start_retreat_percent: f64,
    pub profit_retreat_percent: f64,
    pub margin_percent: f64,
}

impl RiskParamsRecord {
    pub fn into_params(self) -> Result<(MarketState, RiskParams), ValidationError> {
        Ok((
            self.market_state.parse()?,
            RiskParams {
                window_secs: self.window_secs.max(0) as u64,
                threshold: self.threshold,
                stop_loss_percent: self.stop_loss_percent,
                auto_start_retreat_percent: self.auto_start_retreat_percent,
                profit_retreat_percent: self.profit_retreat_percent,
                margin_percent: self.margin_percent,
            },
        ))
    }
}

/// Input for a new robot
#[derive(Debug, Clone)]
pub struct NewRobot {
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
    pub default_market_state: MarketState,
}

/// Row in `credentials`
#[derive(Clone, FromRow)]
pub struct CredentialRecord {
    pub id: i64,
    pub platform: String,
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: Option<String>,
    pub proxy_type: Option<String>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<i64>,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
}

impl CredentialRecord {
    pub fn into_credential(self) -> Result<Credential, ValidationError> {
        let proxy = match (self.proxy_host.as_deref(), self.proxy_port) {
            (Some(host), Some(port)) if !host.trim().is_empty() => {
                let kind: ProxyKind = self.proxy_type.as_deref().unwrap_or("http").parse()?;
                let port = u16::try_from(port)
                    .map_err(|_| ValidationError::InvalidProxy(format!("invalid port {}", port)))?;
                Some(
                    ProxyConfig::from_host_port(kind, &format!("{}:{}", host.trim(), port))?
                        .with_auth(self.proxy_username.clone(), self.proxy_password.clone()),
                )
            }
            _ => None,
        };

        Ok(Credential {
            id: self.id,
            platform: self.platform.parse()?,
            api_key: self.api_key,
            secret_key: self.secret_key,
            passphrase: self.passphrase.filter(|p| !p.is_empty()),
            proxy,
        })
    }
}

/// Input for a new credential; key fields are stored as given
#[derive(Clone)]
pub struct NewCredential {
    pub platform: Platform,
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: Option<String>,
    pub proxy: Option<ProxyConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential_record(host: Option<&str>, port: Option<i64>) -> CredentialRecord {
        CredentialRecord {
            id: 3,
            platform: "okx".to_string(),
            api_key: "k".to_string(),
            secret_key: "s".to_string(),
            passphrase: Some(String::new()),
            proxy_type: Some("socks5".to_string()),
            proxy_host: host.map(str::to_string),
            proxy_port: port,
            proxy_username: None,
            proxy_password: None,
        }
    }

    #[test]
    fn test_credential_record_conversion() {
        let credential = credential_record(Some("10.1.1.1"), Some(1080))
            .into_credential()
            .unwrap();
        assert_eq!(credential.platform, Platform::Okx);
        assert!(credential.passphrase.is_none());
        assert_eq!(
            credential.proxy.unwrap().proxy_url(),
            "socks5://10.1.1.1:1080"
        );

        let credential = credential_record(None, None).into_credential().unwrap();
        assert!(credential.proxy.is_none());

        assert!(credential_record(Some("h"), Some(70_000)).into_credential().is_err());
    }

    #[test]
    fn test_new_order_from_exchange_uses_inferred_leg() {
        let order = ExchangeOrder {
            order_id: "9".to_string(),
            client_order_id: None,
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Sell,
            position_side: None,
            order_type: "MARKET".to_string(),
            reduce_only: false,
            price: 0.0,
            quantity: 1.0,
            filled_quantity: 1.0,
            avg_price: 100.0,
            raw_status: "FILLED".to_string(),
            status: "FILLED".to_string(),
            is_open: false,
            create_time_ms: 1_700_000_000_000,
            update_time_ms: 1_700_000_001_000,
        };
        let row = NewOrder::from_exchange(
            1,
            2,
            Platform::Binance,
            &order,
            LedgerStatus::Open,
            LedgerSource::Stream,
        );
        assert_eq!(row.position_side, PositionSide::Short);
        assert_eq!(
            row.open_time.map(|t| t.timestamp_millis()),
            Some(1_700_000_001_000)
        );
    }
}
