//! Named middleware run around method handlers.
//!
//! Middleware are registered on the server once, by name; each method lists
//! the names it wants in execution order. `before` hooks run in order and
//! the first error short-circuits the call. `after` hooks run, in the same
//! order, for every middleware whose `before` succeeded.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use meridian_protocol::{HandlerResult, ServiceError};
use serde_json::Value;
use tracing::debug;

use crate::context::RequestContext;

/// Trait for request middleware.
pub trait Middleware: Send + Sync + 'static {
    /// Inspect or modify the context and the decoded request. An error
    /// aborts dispatch and becomes the call's response.
    fn before(
        &self,
        ctx: &mut RequestContext,
        request: &mut Value,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;

    /// Inspect the handler's result (optional).
    fn after(
        &self,
        _ctx: &RequestContext,
        _result: &HandlerResult,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Object-safe version of Middleware trait; all refs share lifetime `'a`.
pub(crate) trait MiddlewareDyn: Send + Sync {
    fn before_dyn<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        request: &'a mut Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + 'a>>;

    fn after_dyn<'a>(
        &'a self,
        ctx: &'a RequestContext,
        result: &'a HandlerResult,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

impl<T: Middleware> MiddlewareDyn for T {
    fn before_dyn<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        request: &'a mut Value,
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + 'a>> {
        Box::pin(self.before(ctx, request))
    }

    fn after_dyn<'a>(
        &'a self,
        ctx: &'a RequestContext,
        result: &'a HandlerResult,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.after(ctx, result))
    }
}

/// Middleware known to a server, by name.
#[derive(Default, Clone)]
pub struct MiddlewareSet {
    by_name: HashMap<String, Arc<dyn MiddlewareDyn>>,
}

impl MiddlewareSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the middleware called `name`.
    pub fn insert<M: Middleware>(&mut self, name: impl Into<String>, middleware: M) {
        self.by_name.insert(name.into(), Arc::new(middleware));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.by_name.keys().map(String::as_str).collect()
    }

    /// Resolve `names` into a runnable chain.
    pub(crate) fn chain<'n>(
        &self,
        names: impl IntoIterator<Item = &'n str>,
    ) -> Result<MiddlewareChain, ServiceError> {
        let mut chain = Vec::new();
        for name in names {
            let middleware = self.by_name.get(name).ok_or_else(|| {
                ServiceError::internal(format!("middleware {name:?} is not registered"))
            })?;
            chain.push((name.to_string(), middleware.clone()));
        }
        Ok(MiddlewareChain { middlewares: chain })
    }
}

/// An ordered, resolved list of middleware for one call.
pub(crate) struct MiddlewareChain {
    middlewares: Vec<(String, Arc<dyn MiddlewareDyn>)>,
}

impl MiddlewareChain {
    /// Run the before-chain. Returns how many middleware passed, plus the
    /// error of the one that rejected the call, if any.
    pub(crate) async fn run_before(
        &self,
        ctx: &mut RequestContext,
        request: &mut Value,
    ) -> (usize, Result<(), ServiceError>) {
        for (index, (name, mw)) in self.middlewares.iter().enumerate() {
            if let Err(e) = mw.before_dyn(ctx, request).await {
                debug!("{} rejected by middleware {name}: {e}", ctx.full_method());
                return (index, Err(e));
            }
        }
        (self.middlewares.len(), Ok(()))
    }

    /// Run the after-chain for the first `passed` middleware.
    pub(crate) async fn run_after(
        &self,
        passed: usize,
        ctx: &RequestContext,
        result: &HandlerResult,
    ) {
        for (_, mw) in self.middlewares.iter().take(passed) {
            mw.after_dyn(ctx, result).await;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.middlewares.len()
    }
}
