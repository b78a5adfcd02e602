pub mod cli;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod host;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod surface;
pub mod telemetry;
pub mod transport;
