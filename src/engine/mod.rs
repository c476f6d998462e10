pub mod config;
pub mod dedup;
pub mod format;
pub mod logging;
pub mod market;
pub mod publisher;
pub mod rate_limit;
pub mod scheduler;
pub mod snapshot;
pub mod supervisor;
pub mod token;
pub mod types;

#[cfg(test)]
pub(crate) mod fixture_http;
