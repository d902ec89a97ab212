pub mod config;
pub mod control;
pub mod health;
pub mod messages;
pub mod mirror;
pub mod motor;
pub mod runtime;
pub mod safety;
pub mod server;
pub mod session;
pub mod shared;
pub mod telemetry;
