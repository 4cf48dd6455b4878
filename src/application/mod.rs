pub mod debounce;
pub mod event_router;
pub mod private_stream_manager;
pub mod reconciliation;
pub mod robot_engine;
pub mod robot_supervisor;
pub mod trade_fill_ledger;
