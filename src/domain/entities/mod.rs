pub mod credential;
pub mod market;
pub mod order;
pub mod platform;
pub mod robot;
