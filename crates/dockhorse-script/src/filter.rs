//! The script variant of [`Filter`].

use crate::context::ScriptContext;
use crate::engine::SandboxEngine;
use async_trait::async_trait;
use dockhorse_kernel::{Filter, FilterConfig, FilterError, FilterResult, RequestContext};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// A filter whose behaviour is a Rhai function loaded from disk.
pub struct ScriptFilter {
    config: FilterConfig,
    engine: Arc<SandboxEngine>,
}

impl ScriptFilter {
    pub fn new(config: FilterConfig, engine: Arc<SandboxEngine>) -> Self {
        Self { config, engine }
    }

    /// Wrap loaded configs as pipeline filters.
    pub fn from_configs(
        configs: Vec<FilterConfig>,
        engine: &Arc<SandboxEngine>,
    ) -> Vec<Arc<dyn Filter>> {
        configs
            .into_iter()
            .map(|config| Arc::new(Self::new(config, Arc::clone(engine))) as Arc<dyn Filter>)
            .collect()
    }
}

#[async_trait]
impl Filter for ScriptFilter {
    fn config(&self) -> &FilterConfig {
        &self.config
    }

    async fn exec(&self, ctx: &RequestContext, body: &str) -> Result<FilterResult, FilterError> {
        let name = self.config.name.clone();
        let Some(source) = self.config.function_source.clone() else {
            return Err(FilterError::execution(name, "filter has no function source"));
        };

        let engine = Arc::clone(&self.engine);
        let script_ctx = ScriptContext::new(ctx, body, engine.http());
        let label = name.clone();
        let started = Instant::now();

        let outcome = tokio::task::spawn_blocking(move || engine.run(&label, &source, script_ctx))
            .await
            .map_err(|e| FilterError::execution(&name, format!("sandbox task failed: {e}")))?;

        debug!(
            request_id = %ctx.id,
            filter = %name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "script filter finished"
        );
        outcome.map_err(|e| FilterError::execution(name, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{OutboundHttp, OutboundRequest, OutboundResponse};
    use crate::error::{ScriptError, ScriptResult};
    use dockhorse_kernel::{FilterOrder, Invoke, SandboxSettings};

    struct NoHttp;

    impl OutboundHttp for NoHttp {
        fn send(&self, _request: OutboundRequest) -> ScriptResult<OutboundResponse> {
            Err(ScriptError::Bridge("disabled".into()))
        }
    }

    fn script_filter(source: &str) -> ScriptFilter {
        let engine = Arc::new(SandboxEngine::with_http(
            SandboxSettings::default(),
            Arc::new(NoHttp),
        ));
        let config = FilterConfig::new("count", FilterOrder(1), "^/", Invoke::Before)
            .with_function_source(source);
        ScriptFilter::new(config, engine)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn runs_on_blocking_pool_and_updates_scope() {
        let filter = script_filter(
            r#"|ctx, plugins| {
                ctx.setVar("seen", ctx.method);
                #{ next: true, body: ctx.body, status: 200, operation: ctx.operation.READ }
            }"#,
        );
        let ctx = RequestContext::new("r1", "delete", "/containers/abc");

        let result = filter.exec(&ctx, r#"{"force":true}"#).await.unwrap();
        assert!(result.next);
        assert_eq!(ctx.scope.get("seen"), "DELETE");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn script_errors_become_execution_errors() {
        let filter = script_filter(r#"|ctx, plugins| #{ body: (), status: 200, operation: 0 }"#);
        let ctx = RequestContext::new("r2", "GET", "/info");

        let err = filter.exec(&ctx, "{}").await.unwrap_err();
        assert!(err.is_execution());
        assert!(err.to_string().contains("'next'"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_source_is_an_execution_error() {
        let engine = Arc::new(SandboxEngine::with_http(
            SandboxSettings::default(),
            Arc::new(NoHttp),
        ));
        let config = FilterConfig::new("native-ish", FilterOrder(1), "^/", Invoke::Before);
        let filter = ScriptFilter::new(config, engine);

        let ctx = RequestContext::new("r3", "GET", "/info");
        assert!(filter.exec(&ctx, "{}").await.unwrap_err().is_execution());
    }
}
