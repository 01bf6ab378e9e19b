//! Scan runner: local job execution daemon for scan jobs.

pub mod bundle;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod job;
pub mod lock;
pub mod shutdown;
pub mod store;
pub mod worker;
