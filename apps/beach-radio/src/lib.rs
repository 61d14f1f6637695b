pub mod candidates;
pub mod config;
pub mod engine;
pub mod producer;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
pub mod telemetry;
