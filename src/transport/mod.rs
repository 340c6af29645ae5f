//! Resource fetching.
//!
//! The synchronization core never talks to the network directly; it goes
//! through a [`ResourceFetcher`]. [`HttpFetcher`] is the reqwest-backed
//! implementation, [`FnFetcher`] adapts an async closure.

mod http;

pub use http::HttpFetcher;

use crate::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Fetch the current payload for `endpoint`.
    async fn fetch(&self, endpoint: &str) -> Result<serde_json::Value>;
}

type FetchFn = dyn Fn(String) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync;

/// Fetcher backed by an async closure.
pub struct FnFetcher {
    f: Box<FetchFn>,
}

impl FnFetcher {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            f: Box::new(move |endpoint| Box::pin(f(endpoint))),
        }
    }

    pub fn shared<F, Fut>(f: F) -> Arc<dyn ResourceFetcher>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        Arc::new(Self::new(f))
    }
}

#[async_trait]
impl ResourceFetcher for FnFetcher {
    async fn fetch(&self, endpoint: &str) -> Result<serde_json::Value> {
        (self.f)(endpoint.to_string()).await
    }
}
