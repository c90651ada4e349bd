pub mod api;
pub mod cache;
pub mod cohorts;
pub mod config;
pub mod database;
pub mod db_monitor;
pub mod flags;
pub mod metrics;
pub mod persons;
pub mod properties;
pub mod redis;
pub mod router;
pub mod server;
pub mod team;

// Compiled into the library so the integration tests under tests/ can use the in-memory store
pub mod test_utils;
