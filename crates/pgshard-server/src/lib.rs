pub mod admin;
pub mod aggregator;
pub mod auth;
pub mod config;
pub mod coordinator;
pub mod copy;
pub mod server;
pub mod session;

pub use config::Config;
pub use server::{run, Proxy, ShutdownSignal};

#[cfg(test)]
mod memory;
