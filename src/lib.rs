//! aerocache library
//!
//! Two-tier caching, daily rate limiting and graceful degradation for
//! aviation weather (METAR/TAF) and NOTAM feeds. The `aerocache` binary and
//! the integration tests are built on these modules.

pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod logging;
pub mod rate_limit;
pub mod services;
pub mod sources;
