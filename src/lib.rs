pub mod achievements;
pub mod config;
pub mod core;
pub mod error;
pub mod harness;
pub mod heartbeat;
pub mod intake;
pub mod judger;
pub mod notifications;
pub mod queue;
pub mod queue_health;
pub mod rate_limit;
pub mod reaper;
pub mod redis_manager;
pub mod sandbox;
pub mod server;
pub mod store;
pub mod worker;

#[cfg(test)]
mod testing;
