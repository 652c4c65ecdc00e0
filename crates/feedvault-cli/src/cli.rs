//! CLI argument definitions for feedvault.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fetch` | Fetch one request through the cache and rate limiter |
//! | `run` | Fetch every request in a TOML manifest |
//! | `cache` | Inspect and maintain the response cache |
//! | `sources` | Show the effective per-source policies |
//!
//! # Examples
//!
//! ```bash
//! # Fetch a FRED series, served from cache when fresh
//! feedvault fetch fred series/observations -p series_id=CPIAUCSL -p file_type=json
//!
//! # Nightly batch
//! feedvault run nightly.toml --pretty
//!
//! # Drop entries older than 30 days
//! feedvault cache prune --older-than-days 30
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Rate-limited, cache-first fetcher for financial data APIs.
#[derive(Debug, Parser)]
#[command(
    name = "feedvault",
    author,
    version,
    about = "Rate-limited, cache-first fetcher for financial data APIs"
)]
pub struct Cli {
    /// Configuration file (TOML). Defaults to ./feedvault.toml when present.
    #[arg(long, global = true, env = "FEEDVAULT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Cache file, overriding the configured `cache_path`.
    #[arg(long, global = true)]
    pub cache_path: Option<PathBuf>,

    /// Pretty-print JSON output.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Log output format (logs go to stderr).
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable output.
    Pretty,
    /// One JSON object per event.
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch a single request.
    Fetch(FetchArgs),

    /// Fetch every request listed in a manifest file.
    Run(RunArgs),

    /// Cache management commands.
    Cache(CacheArgs),

    /// List sources and their effective policies.
    Sources,
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Source identifier (finnhub, fred, cftc, yahoo, ecb, sec).
    pub source: String,

    /// Endpoint path below the source's base URL.
    pub endpoint: String,

    /// Query parameter as name=value. Repeatable.
    #[arg(short = 'p', long = "param")]
    pub params: Vec<String>,

    /// Ignore a fresh cached entry and call the network.
    #[arg(long, default_value_t = false)]
    pub refresh: bool,

    /// Override the ttl for this request, in seconds.
    #[arg(long)]
    pub ttl_secs: Option<u64>,

    /// Override the retry count for this request.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Accept any non-empty text body instead of requiring JSON.
    #[arg(long, default_value_t = false)]
    pub text: bool,

    /// Fall back to a stale cached entry when the fetch fails.
    #[arg(long, default_value_t = false)]
    pub allow_stale: bool,

    /// Print the payload body instead of a JSON summary.
    #[arg(long, default_value_t = false)]
    pub body: bool,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Manifest file listing the requests to fetch.
    pub manifest: PathBuf,

    /// Failure threshold, overriding the configured `failure_threshold`.
    #[arg(long)]
    pub failure_threshold: Option<u32>,
}

#[derive(Debug, Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Entry counts and fetch time range.
    Stats,

    /// List cached keys.
    List {
        /// Only keys starting with this prefix, e.g. `fred|`.
        #[arg(long, default_value = "")]
        prefix: String,

        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Show one entry by key.
    Show {
        key: String,

        /// Print the payload body only.
        #[arg(long, default_value_t = false)]
        body: bool,
    },

    /// Remove one entry by key.
    Invalidate { key: String },

    /// Remove old entries, or expired ones when no age is given.
    Prune {
        /// Remove entries fetched more than this many days ago.
        #[arg(long, conflicts_with = "expired")]
        older_than_days: Option<u32>,

        /// Remove entries whose ttl has elapsed (the default).
        #[arg(long, default_value_t = false)]
        expired: bool,
    },
}

impl CacheCommand {
    /// Whether the command modifies the cache file.
    pub const fn writes(&self) -> bool {
        matches!(self, Self::Invalidate { .. } | Self::Prune { .. })
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_fetch_with_repeated_params() {
        let cli = Cli::try_parse_from([
            "feedvault",
            "fetch",
            "fred",
            "series/observations",
            "-p",
            "series_id=CPIAUCSL",
            "--param",
            "file_type=json",
            "--refresh",
        ])
        .expect("valid arguments");

        let Command::Fetch(args) = cli.command else {
            panic!("expected fetch command");
        };
        assert_eq!(args.params, vec!["series_id=CPIAUCSL", "file_type=json"]);
        assert!(args.refresh);
    }

    #[test]
    fn prune_modes_are_exclusive() {
        let result = Cli::try_parse_from([
            "feedvault",
            "cache",
            "prune",
            "--older-than-days",
            "3",
            "--expired",
        ]);

        assert!(result.is_err());
    }

    #[test]
    fn only_maintenance_cache_commands_write() {
        let writes = |args: &[&str]| {
            let cli = Cli::try_parse_from(args).expect("valid arguments");
            let Command::Cache(cache) = cli.command else {
                panic!("expected cache command");
            };
            cache.command.writes()
        };

        assert!(!writes(&["feedvault", "cache", "stats"]));
        assert!(!writes(&["feedvault", "cache", "list", "--prefix", "fred|"]));
        assert!(!writes(&["feedvault", "cache", "show", "k"]));
        assert!(writes(&["feedvault", "cache", "invalidate", "k"]));
        assert!(writes(&["feedvault", "cache", "prune"]));
    }
}
