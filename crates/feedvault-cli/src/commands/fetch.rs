//! `feedvault fetch`: one request through the cache and rate limiter.

use std::process::ExitCode;
use std::time::Duration;

use feedvault_core::{parse_param, FetchOptions, PayloadFormat, RequestDescriptor, SourceId};
use serde_json::json;
use tracing::warn;

use crate::cli::FetchArgs;
use crate::error::CliError;
use crate::output;
use crate::settings;

use super::{Context, EXIT_FETCH_FAILED};

pub async fn run(args: &FetchArgs, context: &Context) -> Result<ExitCode, CliError> {
    let source = args.source.parse::<SourceId>()?;
    let params = args
        .params
        .iter()
        .map(|param| parse_param(param))
        .collect::<Result<Vec<_>, _>>()?;

    let mut request = RequestDescriptor::new(source, &args.endpoint)?.with_params(params);
    if let Some(credential) = settings::credential_for(source) {
        request = request.with_credential(credential);
    }

    let options = build_options(args);
    let client = context.fetch_client(context.open_store()?);
    let outcome = client.fetch(&request, &options).await?;

    if let Some(payload) = outcome.payload() {
        if args.body {
            output::render_body(&payload.body)?;
        } else {
            output::render(
                &json!({
                    "outcome": outcome.label(),
                    "key": payload.key,
                    "fetched_at": output::timestamp(payload.fetched_at),
                    "attempts": payload.attempts,
                    "bytes": payload.body.len(),
                    "storage_error": payload.storage_error,
                }),
                context.pretty,
            )?;
        }
        return Ok(ExitCode::SUCCESS);
    }

    let Some(failure) = outcome.failure() else {
        return Ok(ExitCode::from(EXIT_FETCH_FAILED));
    };

    if args.allow_stale {
        if let Some(entry) = client.get_stale_if_present(&request)? {
            warn!(
                source = %source,
                key = %failure.key,
                fetched_at = %output::timestamp(entry.fetched_at),
                "fetch failed; serving stale cache entry"
            );
            if args.body {
                output::render_body(&entry.payload)?;
            } else {
                output::render(
                    &json!({
                        "outcome": "stale",
                        "key": entry.key,
                        "fetched_at": output::timestamp(entry.fetched_at),
                        "bytes": entry.payload.len(),
                        "error": failure.message,
                    }),
                    context.pretty,
                )?;
            }
            return Ok(ExitCode::SUCCESS);
        }
    }

    output::render(
        &json!({
            "outcome": outcome.label(),
            "key": failure.key,
            "status": failure.status,
            "attempts": failure.attempts,
            "error": failure.message,
        }),
        context.pretty,
    )?;
    Ok(ExitCode::from(EXIT_FETCH_FAILED))
}

fn build_options(args: &FetchArgs) -> FetchOptions {
    let mut options = FetchOptions::default();
    if args.refresh {
        options = options.refresh();
    }
    if let Some(ttl_secs) = args.ttl_secs {
        options = options.with_ttl(Duration::from_secs(ttl_secs));
    }
    if let Some(max_retries) = args.max_retries {
        options = options.with_max_retries(max_retries);
    }
    if args.text {
        options = options.with_format(PayloadFormat::Text);
    }
    options
}
