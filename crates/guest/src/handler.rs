//! The user-code entry point.

use crate::context::Web3FunctionContext;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// A web3 function. The returned JSON value is validated by the supervisor
/// against the declared schema version after the run.
#[async_trait]
pub trait Web3Function: Send + Sync + 'static {
    async fn run(&self, ctx: Web3FunctionContext) -> anyhow::Result<serde_json::Value>;
}

/// Wraps an async closure as a [`Web3Function`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Web3Function>
where
    F: Fn(Web3FunctionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    struct FnHandler<F>(F);

    #[async_trait]
    impl<F, Fut> Web3Function for FnHandler<F>
    where
        F: Fn(Web3FunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        async fn run(&self, ctx: Web3FunctionContext) -> anyhow::Result<serde_json::Value> {
            (self.0)(ctx).await
        }
    }

    Arc::new(FnHandler(f))
}
