//! Configuration loading and credential lookup.
//!
//! Layers, lowest precedence first: built-in defaults, the TOML file, then
//! `FEEDVAULT_*` environment variables with `__` between nested keys, e.g.
//! `FEEDVAULT_SOURCES__FINNHUB__MAX_CALLS_PER_MINUTE=30`.

use std::env;
use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use feedvault_core::{Credential, FeedConfig, SourceId};

use crate::error::CliError;

const DEFAULT_CONFIG_NAME: &str = "feedvault";

pub fn load(path: Option<&Path>) -> Result<FeedConfig, CliError> {
    let file = match path {
        Some(path) => File::from(path).format(FileFormat::Toml).required(true),
        None => File::with_name(DEFAULT_CONFIG_NAME)
            .format(FileFormat::Toml)
            .required(false),
    };

    Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix("FEEDVAULT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(Config::try_deserialize::<FeedConfig>)
        .map_err(|error| CliError::Settings(error.to_string()))
}

/// API credential for `source` from the environment, if one is set.
pub fn credential_for(source: SourceId) -> Option<Credential> {
    match source {
        SourceId::Finnhub => first_env(&["FINNHUB_TOKEN", "FINNHUB_API_KEY"]).map(|value| {
            Credential::QueryParam {
                name: String::from("token"),
                value,
            }
        }),
        SourceId::Fred => first_env(&["FRED_API_KEY"]).map(|value| Credential::QueryParam {
            name: String::from("api_key"),
            value,
        }),
        SourceId::Cftc | SourceId::Yahoo | SourceId::Ecb | SourceId::Sec => None,
    }
}

fn first_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| env::var(name).ok())
        .map(|value| value.trim().to_owned())
        .find(|value| !value.is_empty())
}
