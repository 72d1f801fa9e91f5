//! Native (compiled-in) filters.
//!
//! A [`NativeFilterDefinition`] is the capability bundle a Rust filter
//! implements; [`NativeFilter`] wraps it with the [`FilterConfig`] built
//! from its spec so it runs in the same pipeline as script filters.

use async_trait::async_trait;
use dockhorse_kernel::{
    Filter, FilterConfig, FilterError, FilterOrder, FilterResult, Invoke, RequestContext,
};
use std::sync::Arc;

/// Static description of a native filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeFilterSpec {
    pub name: String,
    pub order: FilterOrder,
    pub path_pattern: String,
    pub invoke: Invoke,
}

impl NativeFilterSpec {
    pub fn new(
        name: impl Into<String>,
        order: u32,
        path_pattern: impl Into<String>,
        invoke: Invoke,
    ) -> Self {
        Self {
            name: name.into(),
            order: FilterOrder(order),
            path_pattern: path_pattern.into(),
            invoke,
        }
    }
}

/// Behaviour of a native filter.
#[async_trait]
pub trait NativeFilterDefinition: Send + Sync {
    fn spec(&self) -> NativeFilterSpec;

    async fn exec(&self, ctx: &RequestContext, body: &str) -> Result<FilterResult, FilterError>;
}

/// Pipeline adapter for a [`NativeFilterDefinition`].
pub struct NativeFilter {
    config: FilterConfig,
    definition: Arc<dyn NativeFilterDefinition>,
}

impl NativeFilter {
    pub fn new(definition: Arc<dyn NativeFilterDefinition>) -> Self {
        let spec = definition.spec();
        Self {
            config: FilterConfig::new(spec.name, spec.order, spec.path_pattern, spec.invoke),
            definition,
        }
    }

    /// Convenience: wrap and erase to a pipeline filter.
    pub fn boxed(definition: Arc<dyn NativeFilterDefinition>) -> Arc<dyn Filter> {
        Arc::new(Self::new(definition))
    }
}

#[async_trait]
impl Filter for NativeFilter {
    fn config(&self) -> &FilterConfig {
        &self.config
    }

    async fn exec(&self, ctx: &RequestContext, body: &str) -> Result<FilterResult, FilterError> {
        self.definition.exec(ctx, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Deny;

    #[async_trait]
    impl NativeFilterDefinition for Deny {
        fn spec(&self) -> NativeFilterSpec {
            NativeFilterSpec::new("deny-exec", 3, "^/containers/[^/]+/exec$", Invoke::Before)
        }

        async fn exec(&self, _ctx: &RequestContext, _body: &str) -> Result<FilterResult, FilterError> {
            Ok(FilterResult::halt(403, r#"{"message":"exec disabled"}"#))
        }
    }

    #[tokio::test]
    async fn wraps_spec_into_config() {
        let filter = NativeFilter::new(Arc::new(Deny));
        let config = filter.config();
        assert_eq!(config.name, "deny-exec");
        assert_eq!(config.order, FilterOrder(3));
        assert_eq!(config.invoke, Invoke::Before);
        assert!(config.function_source.is_none());

        assert!(filter.matches_url("/containers/abc/exec"));
        assert!(!filter.matches_url("/containers/abc/json"));

        let ctx = RequestContext::new("r", "POST", "/containers/abc/exec");
        let result = filter.exec(&ctx, "{}").await.unwrap();
        assert!(!result.next);
        assert_eq!(result.status, 403);
    }
}
