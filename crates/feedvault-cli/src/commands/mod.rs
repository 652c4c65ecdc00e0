mod cache;
mod fetch;
mod run;
mod sources;

use std::process::ExitCode;
use std::sync::Arc;

use feedvault_core::{FeedConfig, FetchClient, SourcePolicies};
use feedvault_store::{CacheStore, StoreConfig};
use tokio_util::sync::CancellationToken;

use crate::cli::{Cli, Command};
use crate::error::CliError;
use crate::settings;

/// Exit status for fetches that completed without a usable payload.
pub const EXIT_FETCH_FAILED: u8 = 3;
/// Exit status for runs interrupted by Ctrl-C.
pub const EXIT_CANCELLED: u8 = 130;

/// Everything a command needs, resolved once at startup.
pub struct Context {
    pub config: FeedConfig,
    pub policies: SourcePolicies,
    pub cancel: CancellationToken,
    pub pretty: bool,
    store_config: StoreConfig,
}

impl Context {
    pub fn from_cli(cli: &Cli, cancel: CancellationToken) -> Result<Self, CliError> {
        let config = settings::load(cli.config.as_deref())?;
        let policies = config.policies()?;

        let store_config = match cli.cache_path.clone().or_else(|| config.cache_path.clone()) {
            Some(path) => StoreConfig::at(path),
            None => StoreConfig::default(),
        };

        Ok(Self {
            config,
            policies,
            cancel,
            pretty: cli.pretty,
            store_config,
        })
    }

    /// Read-write store for commands that fetch or maintain the cache.
    pub fn open_store(&self) -> Result<CacheStore, CliError> {
        Ok(CacheStore::open(self.store_config.clone())?)
    }

    /// Read-only store for inspection commands.
    pub fn open_store_read_only(&self) -> Result<CacheStore, CliError> {
        Ok(CacheStore::open_read_only_with(self.store_config.clone())?)
    }

    pub fn fetch_client(&self, store: CacheStore) -> FetchClient {
        FetchClient::builder(Arc::new(store))
            .policies(self.policies.clone())
            .cancellation(self.cancel.clone())
            .build()
    }
}

pub async fn run(cli: &Cli, cancel: CancellationToken) -> Result<ExitCode, CliError> {
    let context = Context::from_cli(cli, cancel)?;

    match &cli.command {
        Command::Fetch(args) => fetch::run(args, &context).await,
        Command::Run(args) => run::run(args, &context).await,
        Command::Cache(args) => cache::run(&args.command, &context),
        Command::Sources => sources::run(&context),
    }
}
