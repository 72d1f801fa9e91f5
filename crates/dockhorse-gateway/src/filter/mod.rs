//! Filter module.
//!
//! [`FilterManager`] owns the active filter set and runs one phase at a
//! time for a request.

mod logger;
mod native;

pub use logger::AccessLogFilter;
pub use native::{NativeFilter, NativeFilterDefinition, NativeFilterSpec};

use dockhorse_kernel::{
    BodyOperation, Filter, FilterError, FilterResult, Invoke, RequestContext, normalize_json_body,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Result of running one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Every matching filter let the request through.
    Continue {
        /// Phase body after all Writes (normalized JSON text).
        body: String,
        /// `true` if at least one filter performed a Write.
        rewritten: bool,
    },
    /// A filter stopped the phase; answer the client with this.
    ShortCircuit {
        filter: String,
        status: u16,
        body: String,
    },
}

/// Filters of both phases, sorted by order.
///
/// Immutable after construction and shared by every in-flight request.
pub struct FilterManager {
    before: Vec<Arc<dyn Filter>>,
    after: Vec<Arc<dyn Filter>>,
}

impl FilterManager {
    /// Partition `filters` by phase and sort each phase by order.  Equal
    /// orders keep the order in which filters were supplied.
    pub fn new(filters: Vec<Arc<dyn Filter>>) -> Self {
        let mut seen = HashSet::new();
        for filter in &filters {
            let config = filter.config();
            if !seen.insert((config.invoke, config.name.clone())) {
                warn!(filter = %config.name, phase = %config.invoke, "duplicate filter name");
            }
            // Compile now so a bad pattern is reported at startup.
            config.warm_matcher();
        }

        let (mut before, mut after): (Vec<_>, Vec<_>) = filters
            .into_iter()
            .partition(|f| f.config().invoke == Invoke::Before);
        before.sort_by_key(|f| f.config().order);
        after.sort_by_key(|f| f.config().order);

        Self { before, after }
    }

    /// Filters of `phase` in execution order.
    pub fn filters(&self, phase: Invoke) -> &[Arc<dyn Filter>] {
        match phase {
            Invoke::Before => &self.before,
            Invoke::After => &self.after,
        }
    }

    pub fn len(&self) -> usize {
        self.before.len() + self.after.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every filter of `phase` whose pattern matches the request path.
    ///
    /// `raw_body` is normalized to JSON first (`{}` for empty or non-JSON
    /// payloads).  A Write replaces the body seen by the next filter.  The
    /// phase stops at the first `next = false`, answering with that filter's
    /// status and body, or at the first failure.
    pub async fn run_phase(
        &self,
        phase: Invoke,
        ctx: &RequestContext,
        raw_body: &[u8],
    ) -> PhaseOutcome {
        let mut body = normalize_json_body(raw_body);
        let mut rewritten = false;

        for filter in self.filters(phase) {
            if !filter.matches_url(&ctx.path) {
                continue;
            }
            let config = filter.config();
            debug!(
                request_id = %ctx.id,
                filter = %config.name,
                order = %config.order,
                phase = %phase,
                "running filter"
            );

            let result = match filter.exec(ctx, &body).await.and_then(|r| checked(&config.name, r)) {
                Ok(result) => result,
                Err(e) => {
                    error!(request_id = %ctx.id, filter = %config.name, phase = %phase, error = %e, "filter failed");
                    let failure = e.to_result();
                    return PhaseOutcome::ShortCircuit {
                        filter: config.name.clone(),
                        status: failure.status,
                        body: failure.body,
                    };
                }
            };

            if !result.next {
                let status = if (100..=599).contains(&result.status) {
                    result.status
                } else {
                    warn!(filter = %config.name, status = result.status, "invalid short-circuit status, using 500");
                    500
                };
                debug!(request_id = %ctx.id, filter = %config.name, status, "phase short-circuited");
                return PhaseOutcome::ShortCircuit {
                    filter: config.name.clone(),
                    status,
                    body: result.body,
                };
            }

            if result.operation == BodyOperation::Write {
                body = result.body;
                rewritten = true;
            }
        }

        PhaseOutcome::Continue { body, rewritten }
    }
}

/// Reject results that report an error, or whose body would reach the
/// daemon or the client without being valid JSON.
fn checked(filter: &str, result: FilterResult) -> Result<FilterResult, FilterError> {
    if let Some(message) = result.failure() {
        return Err(FilterError::execution(filter, message));
    }
    let emits_body = !result.next || result.operation == BodyOperation::Write;
    if emits_body && serde_json::from_str::<serde::de::IgnoredAny>(&result.body).is_err() {
        return Err(FilterError::execution(filter, "filter body is not valid JSON"));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dockhorse_kernel::{FilterConfig, FilterOrder};
    use parking_lot::Mutex;

    /// Records its name into a shared log and returns a fixed result.
    struct Probe {
        config: FilterConfig,
        log: Arc<Mutex<Vec<(String, String)>>>,
        result: FilterResult,
    }

    impl Probe {
        fn new(
            name: &str,
            order: u32,
            pattern: &str,
            invoke: Invoke,
            log: &Arc<Mutex<Vec<(String, String)>>>,
            result: FilterResult,
        ) -> Arc<dyn Filter> {
            Arc::new(Self {
                config: FilterConfig::new(name, FilterOrder(order), pattern, invoke),
                log: Arc::clone(log),
                result,
            })
        }
    }

    #[async_trait]
    impl Filter for Probe {
        fn config(&self) -> &FilterConfig {
            &self.config
        }

        async fn exec(&self, _ctx: &RequestContext, body: &str) -> Result<FilterResult, FilterError> {
            self.log.lock().push((self.config.name.clone(), body.to_string()));
            Ok(self.result.clone())
        }
    }

    fn names(log: &Arc<Mutex<Vec<(String, String)>>>) -> Vec<String> {
        log.lock().iter().map(|(n, _)| n.clone()).collect()
    }

    #[tokio::test]
    async fn runs_in_order_with_stable_ties() {
        let log = Arc::default();
        let manager = FilterManager::new(vec![
            Probe::new("five", 5, ".*", Invoke::Before, &log, FilterResult::proceed()),
            Probe::new("one-a", 1, ".*", Invoke::Before, &log, FilterResult::proceed()),
            Probe::new("one-b", 1, ".*", Invoke::Before, &log, FilterResult::proceed()),
            Probe::new("ten", 10, ".*", Invoke::Before, &log, FilterResult::proceed()),
            Probe::new("after", 0, ".*", Invoke::After, &log, FilterResult::proceed()),
        ]);
        assert_eq!(manager.len(), 5);

        let ctx = RequestContext::new("r", "GET", "/info");
        let outcome = manager.run_phase(Invoke::Before, &ctx, b"").await;
        assert_eq!(
            outcome,
            PhaseOutcome::Continue {
                body: "{}".into(),
                rewritten: false
            }
        );
        assert_eq!(names(&log), vec!["one-a", "one-b", "five", "ten"]);
    }

    #[tokio::test]
    async fn write_threads_body_to_next_filter() {
        let log = Arc::default();
        let manager = FilterManager::new(vec![
            Probe::new("w", 1, ".*", Invoke::Before, &log, FilterResult::rewrite(r#"{"a":1}"#)),
            Probe::new("r", 2, ".*", Invoke::Before, &log, FilterResult::proceed()),
        ]);

        let ctx = RequestContext::new("r", "POST", "/containers/create");
        let outcome = manager.run_phase(Invoke::Before, &ctx, b"{}").await;

        let seen = log.lock().clone();
        let received: serde_json::Value = serde_json::from_str(&seen[1].1).unwrap();
        assert_eq!(received, serde_json::json!({ "a": 1 }));
        assert_eq!(
            outcome,
            PhaseOutcome::Continue {
                body: r#"{"a":1}"#.into(),
                rewritten: true
            }
        );
    }

    #[tokio::test]
    async fn next_false_stops_the_phase() {
        let log = Arc::default();
        let manager = FilterManager::new(vec![
            Probe::new("deny", 1, ".*", Invoke::Before, &log, FilterResult::halt(403, r#"{"message":"no"}"#)),
            Probe::new("later", 2, ".*", Invoke::Before, &log, FilterResult::proceed()),
        ]);

        let ctx = RequestContext::new("r", "GET", "/info");
        let outcome = manager.run_phase(Invoke::Before, &ctx, b"").await;
        assert_eq!(
            outcome,
            PhaseOutcome::ShortCircuit {
                filter: "deny".into(),
                status: 403,
                body: r#"{"message":"no"}"#.into()
            }
        );
        assert_eq!(names(&log), vec!["deny"]);
    }

    #[tokio::test]
    async fn halting_filter_answers_with_its_own_body() {
        let log = Arc::default();
        let mut halt = FilterResult::proceed();
        halt.next = false;
        halt.status = 409;
        halt.body = r#"{"message":"conflict"}"#.into();
        let manager = FilterManager::new(vec![Probe::new("c", 1, ".*", Invoke::Before, &log, halt)]);

        let ctx = RequestContext::new("r", "POST", "/containers/create");
        let outcome = manager.run_phase(Invoke::Before, &ctx, br#"{"Image":"x"}"#).await;
        assert_eq!(
            outcome,
            PhaseOutcome::ShortCircuit {
                filter: "c".into(),
                status: 409,
                body: r#"{"message":"conflict"}"#.into()
            }
        );
    }

    #[tokio::test]
    async fn only_matching_filters_run() {
        let log = Arc::default();
        let manager = FilterManager::new(vec![
            Probe::new("containers", 1, "^/containers/.*", Invoke::Before, &log, FilterResult::proceed()),
            Probe::new("images", 2, "^/images/.*", Invoke::Before, &log, FilterResult::proceed()),
            Probe::new("broken", 3, "^/(", Invoke::Before, &log, FilterResult::proceed()),
        ]);

        let ctx = RequestContext::new("r", "GET", "/containers/123/json");
        manager.run_phase(Invoke::Before, &ctx, b"").await;
        assert_eq!(names(&log), vec!["containers"]);
    }

    #[tokio::test]
    async fn reported_error_is_a_failure() {
        let log = Arc::default();
        let mut failing = FilterResult::proceed();
        failing.error = Some("quota exceeded".into());
        let manager = FilterManager::new(vec![
            Probe::new("quota", 1, ".*", Invoke::After, &log, failing),
            Probe::new("later", 2, ".*", Invoke::After, &log, FilterResult::proceed()),
        ]);

        let ctx = RequestContext::new("r", "GET", "/info");
        let PhaseOutcome::ShortCircuit { status, body, .. } =
            manager.run_phase(Invoke::After, &ctx, b"{}").await
        else {
            panic!("expected short-circuit");
        };
        assert_eq!(status, 500);
        assert!(body.contains("Proxy error: "));
        assert!(body.contains("quota exceeded"));
        assert_eq!(names(&log), vec!["quota"]);
    }

    #[tokio::test]
    async fn invalid_json_write_and_bad_status() {
        let log = Arc::default();
        let manager = FilterManager::new(vec![Probe::new(
            "garbage",
            1,
            ".*",
            Invoke::Before,
            &log,
            FilterResult::rewrite("not json"),
        )]);
        let ctx = RequestContext::new("r", "GET", "/info");
        assert!(matches!(
            manager.run_phase(Invoke::Before, &ctx, b"").await,
            PhaseOutcome::ShortCircuit { status: 500, .. }
        ));

        let manager = FilterManager::new(vec![Probe::new(
            "zero",
            1,
            ".*",
            Invoke::Before,
            &log,
            FilterResult::halt(0, "{}"),
        )]);
        assert!(matches!(
            manager.run_phase(Invoke::Before, &ctx, b"").await,
            PhaseOutcome::ShortCircuit { status: 500, .. }
        ));
    }
}
