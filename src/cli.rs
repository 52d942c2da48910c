//! Command-line interface parsing for aerocache
//!
//! Parsing is done with clap derive; anything clap cannot check on its own
//! (ICAO identifiers, config loading) is validated in [`Cli::app_config`]
//! and [`Command::validate`] before any cache or network activity.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use thiserror::Error;

use crate::config::AppConfig;
use crate::error::ConfigError;
use crate::sources::normalize_icao;

/// Error types for CLI argument handling
#[derive(Debug, Error)]
pub enum CliError {
    /// The identifier is not a 3-4 character ICAO location code
    #[error("Invalid ICAO identifier: '{0}'. Expected 3-4 letters or digits, e.g. KJFK")]
    InvalidIcao(String),

    /// The config file could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Cached, rate-limited access to aviation weather and NOTAM feeds
#[derive(Parser, Debug)]
#[command(name = "aerocache")]
#[command(about = "Cached, rate-limited access to aviation weather and NOTAM feeds")]
#[command(version)]
pub struct Cli {
    /// JSON config file; defaults apply when omitted
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory for persisted cache records, overriding the config
    #[arg(long, global = true, value_name = "DIR")]
    pub storage_root: Option<PathBuf>,

    /// Debug logging on stderr (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Latest METAR for a station
    Metar { icao: String },
    /// Current TAF for a station
    Taf { icao: String },
    /// Active NOTAMs for a location
    Notam { icao: String },
    /// Print a cached value, fresh or stale
    Get { namespace: String, key: String },
    /// Remove a cached value
    Delete { namespace: String, key: String },
    /// Remove every value in a namespace
    Clear { namespace: String },
    /// Remove expired values in a namespace
    Cleanup { namespace: String },
    /// Cache statistics for one namespace, or all of them
    Stats { namespace: Option<String> },
    /// Daily request budget usage per source
    Budget,
}

/// Parses an ICAO argument into its normalized uppercase form.
///
/// # Returns
/// * `Ok(String)` such as `"KJFK"` for input `"kjfk"`
/// * `Err(CliError::InvalidIcao)` if the identifier is malformed
pub fn parse_icao_arg(s: &str) -> Result<String, CliError> {
    normalize_icao(s).map_err(|_| CliError::InvalidIcao(s.to_string()))
}

impl Cli {
    /// Loads the config file (if any) and applies command-line overrides.
    pub fn app_config(&self) -> Result<AppConfig, CliError> {
        let mut config = AppConfig::load_or_default(self.config.as_deref())?;
        if let Some(root) = &self.storage_root {
            config.cache.storage_root = root.clone();
        }
        Ok(config)
    }
}

impl Command {
    /// Checks and normalizes identifiers in the command.
    pub fn validate(self) -> Result<Self, CliError> {
        Ok(match self {
            Command::Metar { icao } => Command::Metar {
                icao: parse_icao_arg(&icao)?,
            },
            Command::Taf { icao } => Command::Taf {
                icao: parse_icao_arg(&icao)?,
            },
            Command::Notam { icao } => Command::Notam {
                icao: parse_icao_arg(&icao)?,
            },
            other => other,
        })
    }
}
