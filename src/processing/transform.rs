use crate::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

/// Turns a validated raw payload into the shape consumers see. May suspend.
#[async_trait]
pub trait PayloadTransform: Send + Sync {
    async fn transform(&self, raw: Value) -> Result<Value>;
}

/// Passes the payload through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

#[async_trait]
impl PayloadTransform for IdentityTransform {
    async fn transform(&self, raw: Value) -> Result<Value> {
        Ok(raw)
    }
}

type TransformFn = dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// Transform backed by an async closure.
pub struct FnTransform {
    f: Box<TransformFn>,
}

impl FnTransform {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            f: Box::new(move |raw| Box::pin(f(raw))),
        }
    }

    /// Wrap a synchronous mapping.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        let f = std::sync::Arc::new(f);
        Self::new(move |raw| {
            let f = f.clone();
            async move { f(raw) }
        })
    }
}

#[async_trait]
impl PayloadTransform for FnTransform {
    async fn transform(&self, raw: Value) -> Result<Value> {
        (self.f)(raw).await
    }
}
