//! Infrastructure: credential decryption, exchange sessions and the private
//! WebSocket adapters.

pub mod credential_store;
pub mod exchange_client_factory;
pub mod exchange_session_manager;
pub mod private_stream_factory;
pub mod proxy_tunnel;
pub mod throttled_client;
pub mod ws_private_stream;
