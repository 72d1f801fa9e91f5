//! Structured access-log filter.
//!
//! Installed as a pair: the request side (order 0) logs the inbound call
//! and records its start time in the request scope; the response side
//! (order 999) logs the daemon status and round-trip latency.

use super::native::{NativeFilter, NativeFilterDefinition, NativeFilterSpec};
use async_trait::async_trait;
use dockhorse_kernel::{Filter, FilterError, FilterResult, Invoke, RequestContext};
use std::sync::Arc;
use tracing::{error, info};

const START_KEY: &str = "log.request_start_ms";

/// Logs inbound requests and outbound responses.
pub struct AccessLogFilter {
    side: Invoke,
}

impl AccessLogFilter {
    pub fn new(side: Invoke) -> Self {
        Self { side }
    }

    /// Both sides, ready for the pipeline.
    pub fn filters() -> Vec<Arc<dyn Filter>> {
        vec![
            NativeFilter::boxed(Arc::new(Self::new(Invoke::Before))),
            NativeFilter::boxed(Arc::new(Self::new(Invoke::After))),
        ]
    }
}

#[async_trait]
impl NativeFilterDefinition for AccessLogFilter {
    fn spec(&self) -> NativeFilterSpec {
        match self.side {
            Invoke::Before => NativeFilterSpec::new("access-log", 0, ".*", Invoke::Before),
            Invoke::After => NativeFilterSpec::new("access-log", 999, ".*", Invoke::After),
        }
    }

    async fn exec(&self, ctx: &RequestContext, body: &str) -> Result<FilterResult, FilterError> {
        match self.side {
            Invoke::Before => {
                info!(
                    request_id  = %ctx.id,
                    method      = %ctx.method,
                    path        = %ctx.path,
                    body_bytes  = ctx.body.len(),
                    "→ inbound request"
                );
                ctx.scope.set(START_KEY, now_ms().to_string());
            }
            Invoke::After => {
                let start_ms: u64 = ctx.scope.get(START_KEY).parse().unwrap_or(0);
                let elapsed = now_ms().saturating_sub(start_ms);
                let status = ctx.response_status.unwrap_or(0);

                if status >= 500 {
                    error!(
                        request_id  = %ctx.id,
                        path        = %ctx.path,
                        status      = status,
                        body_bytes  = body.len(),
                        latency_ms  = elapsed,
                        "← upstream error response"
                    );
                } else {
                    info!(
                        request_id  = %ctx.id,
                        path        = %ctx.path,
                        status      = status,
                        body_bytes  = body.len(),
                        latency_ms  = elapsed,
                        "← outbound response"
                    );
                }
            }
        }
        Ok(FilterResult::proceed())
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}
