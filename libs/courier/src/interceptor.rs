//! Ordered request and response interceptor chains.
//!
//! Each client owns its own pair of managers. A chain folds a
//! `Result<T, HttpError>` through its entries in registration order: `Ok`
//! values reach the entry's fulfilled handler, errors reach its rejected
//! handler, and either handler may switch the track.

use crate::error::HttpError;
use crate::request::RequestConfig;
use crate::response::Response;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub type Fulfilled<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<T, HttpError>> + Send + Sync>;
pub type Rejected<T> =
    Arc<dyn Fn(HttpError) -> BoxFuture<'static, Result<T, HttpError>> + Send + Sync>;
pub type RunWhen = Arc<dyn Fn(&RequestConfig) -> bool + Send + Sync>;

/// Handle returned by [`InterceptorManager::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterceptorId(u64);

impl InterceptorId {
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InterceptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Values an interceptor chain can carry.
pub trait Intercepted: Send + 'static {
    /// The request config the value belongs to, for `run_when` checks.
    fn request_config(&self) -> Option<&RequestConfig>;
}

impl Intercepted for RequestConfig {
    fn request_config(&self) -> Option<&RequestConfig> {
        Some(self)
    }
}

impl Intercepted for Response {
    fn request_config(&self) -> Option<&RequestConfig> {
        Some(&self.config)
    }
}

/// One entry of a chain.
pub struct Interceptor<T> {
    fulfilled: Option<Fulfilled<T>>,
    rejected: Option<Rejected<T>>,
    synchronous: bool,
    run_when: Option<RunWhen>,
}

impl<T: Intercepted> Interceptor<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            fulfilled: None,
            rejected: None,
            synchronous: false,
            run_when: None,
        }
    }

    /// Synchronous fulfilled handler.
    #[must_use]
    pub fn fulfilled<F>(mut self, handler: F) -> Self
    where
        F: Fn(T) -> Result<T, HttpError> + Send + Sync + 'static,
    {
        self.fulfilled = Some(Arc::new(move |value| {
            futures::future::ready(handler(value)).boxed()
        }));
        self
    }

    #[must_use]
    pub fn fulfilled_async<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, HttpError>> + Send + 'static,
    {
        self.fulfilled = Some(Arc::new(move |value| handler(value).boxed()));
        self
    }

    /// Synchronous rejected handler; return `Ok` to recover.
    #[must_use]
    pub fn rejected<F>(mut self, handler: F) -> Self
    where
        F: Fn(HttpError) -> Result<T, HttpError> + Send + Sync + 'static,
    {
        self.rejected = Some(Arc::new(move |err| {
            futures::future::ready(handler(err)).boxed()
        }));
        self
    }

    #[must_use]
    pub fn rejected_async<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(HttpError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, HttpError>> + Send + 'static,
    {
        self.rejected = Some(Arc::new(move |err| handler(err).boxed()));
        self
    }

    /// Mark the handlers as never suspending.
    ///
    /// A synchronous entry is resolved inline without yielding to the
    /// runtime. A handler that suspends anyway fails the chain with a
    /// `validation` error.
    #[must_use]
    pub fn synchronous(mut self) -> Self {
        self.synchronous = true;
        self
    }

    /// Skip this entry unless `predicate` holds for the request config.
    #[must_use]
    pub fn run_when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&RequestConfig) -> bool + Send + Sync + 'static,
    {
        self.run_when = Some(Arc::new(predicate));
        self
    }

    #[must_use]
    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    fn applies_to(&self, config: Option<&RequestConfig>) -> bool {
        match (&self.run_when, config) {
            (Some(predicate), Some(config)) => predicate(config),
            _ => true,
        }
    }

    async fn apply(
        &self,
        id: InterceptorId,
        current: Result<T, HttpError>,
    ) -> Result<T, HttpError> {
        let step = match (current, &self.fulfilled, &self.rejected) {
            (Ok(value), Some(handler), _) => handler(value),
            (Err(err), _, Some(handler)) => handler(err),
            (passthrough, _, _) => return passthrough,
        };
        if !self.synchronous {
            return step.await;
        }
        step.now_or_never().unwrap_or_else(|| {
            let message = format!("synchronous interceptor {id} suspended");
            Err(HttpError::config(message))
        })
    }
}

impl<T: Intercepted> Default for Interceptor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Interceptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("fulfilled", &self.fulfilled.is_some())
            .field("rejected", &self.rejected.is_some())
            .field("synchronous", &self.synchronous)
            .field("run_when", &self.run_when.is_some())
            .finish()
    }
}

/// Ordered, mutable chain of interceptors.
///
/// Ids are monotonic and never reused, so ejecting a stale id can never
/// remove a later registration.
pub struct InterceptorManager<T> {
    next_id: AtomicU64,
    entries: RwLock<BTreeMap<InterceptorId, Arc<Interceptor<T>>>>,
}

impl<T: Intercepted> InterceptorManager<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Append `interceptor` to the chain.
    pub fn register(&self, interceptor: Interceptor<T>) -> InterceptorId {
        let id = InterceptorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().insert(id, Arc::new(interceptor));
        id
    }

    /// Remove an entry. Returns `false` if it was already gone.
    pub fn eject(&self, id: InterceptorId) -> bool {
        self.entries.write().remove(&id).is_some()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of the chain in registration order.
    #[must_use]
    pub fn handlers(&self) -> Vec<(InterceptorId, Arc<Interceptor<T>>)> {
        self.entries
            .read()
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect()
    }

    /// Fold `initial` through the chain.
    ///
    /// The chain is snapshotted first; registrations made by a running
    /// handler take effect on the next run.
    ///
    /// # Errors
    ///
    /// Returns whatever error is left after the last entry.
    pub async fn run(&self, initial: Result<T, HttpError>) -> Result<T, HttpError> {
        let mut current = initial;
        for (id, entry) in self.handlers() {
            let config = match &current {
                Ok(value) => value.request_config(),
                Err(err) => err.config_ref(),
            };
            if !entry.applies_to(config) {
                tracing::trace!(interceptor = %id, "interceptor skipped by run_when");
                continue;
            }
            current = entry.apply(id, current).await;
        }
        current
    }
}

impl<T: Intercepted> Default for InterceptorManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for InterceptorManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorManager")
            .field("len", &self.entries.read().len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

/// The request and response chains of one client.
#[derive(Debug, Default)]
pub struct Interceptors {
    pub request: InterceptorManager<RequestConfig>,
    pub response: InterceptorManager<Response>,
}
