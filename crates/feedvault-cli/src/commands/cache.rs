//! `feedvault cache ...`: inspection and maintenance of the response cache.

use std::process::ExitCode;

use feedvault_store::CacheStore;
use serde_json::json;
use time::{Duration, OffsetDateTime};
use tracing::info;

use crate::cli::CacheCommand;
use crate::error::CliError;
use crate::output;

use super::Context;

const EXIT_NOT_FOUND: u8 = 1;

pub fn run(command: &CacheCommand, context: &Context) -> Result<ExitCode, CliError> {
    let store = if command.writes() {
        context.open_store()?
    } else {
        context.open_store_read_only()?
    };

    match command {
        CacheCommand::Stats => stats(&store, context.pretty),
        CacheCommand::List { prefix, limit } => {
            let keys = store.list_keys(prefix, *limit)?;
            output::render(&json!({ "keys": keys }), context.pretty)?;
            Ok(ExitCode::SUCCESS)
        }
        CacheCommand::Show { key, body } => show(&store, key, *body, context.pretty),
        CacheCommand::Invalidate { key } => {
            let removed = store.invalidate(key)?;
            info!(key = %key, removed, "cache invalidate");
            output::render(&json!({ "key": key, "removed": removed }), context.pretty)?;
            Ok(if removed {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_NOT_FOUND)
            })
        }
        CacheCommand::Prune {
            older_than_days, ..
        } => {
            let now = OffsetDateTime::now_utc();
            let removed = match older_than_days {
                Some(days) => store.prune(now - Duration::days(i64::from(*days)))?,
                None => store.prune_expired(now)?,
            };
            info!(removed, "cache prune");
            output::render(&json!({ "removed": removed }), context.pretty)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn stats(store: &CacheStore, pretty: bool) -> Result<ExitCode, CliError> {
    let stats = store.stats()?;
    let per_source = stats
        .per_source
        .iter()
        .map(|(source, count)| (source.clone(), json!(count)))
        .collect::<serde_json::Map<_, _>>();

    output::render(
        &json!({
            "path": store.db_path().map(|path| path.display().to_string()),
            "entries": stats.entries,
            "oldest_fetched_at": stats.oldest_fetched_at.map(output::timestamp),
            "newest_fetched_at": stats.newest_fetched_at.map(output::timestamp),
            "per_source": per_source,
        }),
        pretty,
    )?;
    Ok(ExitCode::SUCCESS)
}

fn show(store: &CacheStore, key: &str, body: bool, pretty: bool) -> Result<ExitCode, CliError> {
    let Some(entry) = store.get(key)? else {
        output::render(&json!({ "key": key, "found": false }), pretty)?;
        return Ok(ExitCode::from(EXIT_NOT_FOUND));
    };

    if body {
        output::render_body(&entry.payload)?;
    } else {
        let now = OffsetDateTime::now_utc();
        output::render(
            &json!({
                "key": entry.key,
                "found": true,
                "source": entry.source,
                "endpoint": entry.endpoint,
                "fetched_at": output::timestamp(entry.fetched_at),
                "expires_at": output::timestamp(entry.expires_at()),
                "ttl_seconds": entry.ttl_seconds,
                "fresh": entry.is_fresh(now),
                "bytes": entry.payload.len(),
            }),
            pretty,
        )?;
    }
    Ok(ExitCode::SUCCESS)
}
