//! aerocache - cached, rate-limited aviation weather and NOTAM lookups
//!
//! Prints payloads and stats as JSON on stdout. Whether data was fresh or
//! stale, and any errors, go to stderr.

use std::collections::BTreeMap;
use std::process::ExitCode;

use clap::Parser;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use aerocache::cache::CacheStore;
use aerocache::cli::{Cli, Command};
use aerocache::fetcher::FetchOutcome;
use aerocache::logging::init_logging;
use aerocache::services::Services;
use aerocache::sources::SourceError;

/// Exit code when data is unavailable or a cache operation fails
const EXIT_UNAVAILABLE: u8 = 1;
/// Exit code for bad arguments or config, matching clap
const EXIT_USAGE: u8 = 2;

fn print_json<T: Serialize + ?Sized>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(EXIT_UNAVAILABLE)
        }
    }
}

fn report_outcome(what: &str, result: Result<FetchOutcome<Value>, SourceError>) -> ExitCode {
    match result {
        Ok(FetchOutcome::Fresh(data)) => {
            eprintln!("{}: fresh", what);
            print_json(&data)
        }
        Ok(FetchOutcome::Stale(data)) => {
            eprintln!("{}: stale", what);
            print_json(&data)
        }
        Ok(FetchOutcome::Unavailable) => {
            eprintln!("{}: unavailable", what);
            ExitCode::from(EXIT_UNAVAILABLE)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(EXIT_UNAVAILABLE)
        }
    }
}

async fn all_stats(store: &CacheStore, namespace: Option<String>) -> ExitCode {
    let namespaces = match namespace {
        Some(ns) => vec![ns],
        None => store.namespaces().await,
    };

    let results = join_all(namespaces.iter().map(|ns| store.stats(ns))).await;

    let mut stats = BTreeMap::new();
    for (ns, result) in namespaces.iter().zip(results) {
        match result {
            Ok(s) => {
                stats.insert(ns.as_str(), s);
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::from(EXIT_UNAVAILABLE);
            }
        }
    }
    print_json(&stats)
}

async fn run(services: &Services, command: Command) -> ExitCode {
    let store = services.store();

    match command {
        Command::Metar { icao } => report_outcome(&format!("METAR {}", icao), services.metar(&icao).await),
        Command::Taf { icao } => report_outcome(&format!("TAF {}", icao), services.taf(&icao).await),
        Command::Notam { icao } => {
            report_outcome(&format!("NOTAM {}", icao), services.notams(&icao).await)
        }
        Command::Get { namespace, key } => {
            match store.get_with_stale::<Value>(&namespace, &key, None).await {
                Ok(Some(cached)) => {
                    let freshness = if cached.is_stale { "stale" } else { "fresh" };
                    eprintln!("{}/{}: {} (cached {})", namespace, key, freshness, cached.cached_at.to_rfc3339());
                    print_json(&cached.data)
                }
                Ok(None) => {
                    eprintln!("{}/{}: not cached", namespace, key);
                    ExitCode::from(EXIT_UNAVAILABLE)
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    ExitCode::from(EXIT_UNAVAILABLE)
                }
            }
        }
        Command::Delete { namespace, key } => match store.delete(&namespace, &key).await {
            Ok(()) => {
                eprintln!("Deleted {}/{}", namespace, key);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::from(EXIT_UNAVAILABLE)
            }
        },
        Command::Clear { namespace } => match store.clear(&namespace).await {
            Ok(()) => {
                eprintln!("Cleared {}", namespace);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::from(EXIT_UNAVAILABLE)
            }
        },
        Command::Cleanup { namespace } => match store.cleanup_expired(&namespace).await {
            Ok(removed) => {
                eprintln!("Removed {} expired entries from {}", removed, namespace);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::from(EXIT_UNAVAILABLE)
            }
        },
        Command::Stats { namespace } => all_stats(store, namespace).await,
        Command::Budget => print_json(&services.budgets()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let prepared = cli
        .app_config()
        .and_then(|config| Ok((config, cli.command.clone().validate()?)));
    let (config, command) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let services = Services::start(&config).await;
    let code = run(&services, command).await;

    for (source, stats) in services.fetcher_stats() {
        debug!(source, ?stats, "Fetcher summary");
    }
    services.shutdown().await;
    code
}
