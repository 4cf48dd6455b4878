pub mod fill_events;
pub mod order_events;
pub mod payload;
pub mod position_events;
pub mod position_tracker;
pub mod price_window;
pub mod signal;
pub mod trade_aggregation;
