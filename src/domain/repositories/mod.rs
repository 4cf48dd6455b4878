pub mod credential_source;
pub mod exchange_client;
pub mod private_stream;
