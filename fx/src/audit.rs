//! Audited execution of engine calls on behalf of a caller.

use std::future::Future;
use std::time::Instant;

use ratemesh_common::RequestContext;
use tracing::{info, info_span, warn, Instrument};

use crate::error::RateResult;

/// Run `fut` inside a span carrying the caller's identity and log its outcome.
pub async fn audited<T, F>(ctx: &RequestContext, operation: &'static str, fut: F) -> RateResult<T>
where
    F: Future<Output = RateResult<T>>,
{
    let span = info_span!(
        "audit",
        operation,
        actor = ctx.actor(),
        tenant = ctx.tenant(),
        correlation_id = %ctx.correlation_id,
    );

    async move {
        let started = Instant::now();
        let result = fut.await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match &result {
            Ok(_) => info!(elapsed_ms, "Call completed"),
            Err(e) => warn!(elapsed_ms, code = e.error_code(), error = %e, "Call failed"),
        }
        result
    }
    .instrument(span)
    .await
}
