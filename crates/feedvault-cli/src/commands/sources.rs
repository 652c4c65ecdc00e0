use std::process::ExitCode;

use serde_json::{json, Value};

use crate::error::CliError;
use crate::output;
use crate::settings;

use super::Context;

pub fn run(context: &Context) -> Result<ExitCode, CliError> {
    let sources = context
        .policies
        .iter()
        .map(|policy| {
            let endpoint_ttls = policy
                .endpoint_ttls
                .iter()
                .map(|(class, ttl)| (class.clone(), json!(ttl.as_secs())))
                .collect::<serde_json::Map<_, _>>();

            json!({
                "source": policy.source,
                "base_url": policy.base_url,
                "max_calls_per_window": policy.rate_limit.max_calls,
                "window_secs": policy.rate_limit.window.as_secs(),
                "min_spacing_ms": policy.rate_limit.min_spacing.as_millis() as u64,
                "default_ttl_secs": policy.default_ttl.as_secs(),
                "endpoint_ttl_secs": endpoint_ttls,
                "max_retries": policy.retry.max_retries,
                "backoff_base_ms": policy.retry.backoff.delay(0).as_millis() as u64,
                "backoff_cap_ms": policy.retry.backoff.cap().as_millis() as u64,
                "throttle_markers": policy.throttle_markers,
                "credential_configured": settings::credential_for(policy.source).is_some(),
            })
        })
        .collect::<Vec<Value>>();

    output::render(
        &json!({
            "failure_threshold": context.config.failure_threshold,
            "sources": sources,
        }),
        context.pretty,
    )?;
    Ok(ExitCode::SUCCESS)
}
