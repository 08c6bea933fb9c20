use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::errors::{BoxError, RouteError};
use crate::matcher::RouteMatcher;
use crate::request::{MockRequest, RequestOrigin};
use crate::route::{ReplayFetcher, Route, RouteDecision};

pub(crate) type RouteHandler =
    Arc<dyn Fn(Route) -> BoxFuture<'static, Result<RouteDecision, BoxError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId(u64);

/// Which interception paths consider this entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteScope {
    ServerOnly,
    ClientOnly,
    #[default]
    Both,
}

impl RouteScope {
    pub fn applies_to(self, origin: RequestOrigin) -> bool {
        match self {
            RouteScope::ServerOnly => origin == RequestOrigin::Server,
            RouteScope::ClientOnly => origin == RequestOrigin::Client,
            RouteScope::Both => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteOptions {
    /// Remove the entry after this many terminal results.
    pub times: Option<u64>,
    pub scope: RouteScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub scope: RouteScope,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5_000),
            scope: RouteScope::Both,
        }
    }
}

struct RouteEntry {
    id: RouteId,
    matcher: RouteMatcher,
    handler: RouteHandler,
    scope: RouteScope,
    times: Option<u64>,
    calls: AtomicU64,
}

impl RouteEntry {
    fn exhausted(&self) -> bool {
        self.times
            .is_some_and(|times| self.calls.load(Ordering::SeqCst) >= times)
    }
}

struct RequestWaiter {
    id: u64,
    matcher: RouteMatcher,
    scope: RouteScope,
    sender: oneshot::Sender<MockRequest>,
}

/// Ordered chain of URL-matched handlers. Entries are tried in registration
/// order; the first non-fallback decision terminates resolution. The only
/// tie-break between entries sharing a pattern is registration order, which
/// holds even with asynchronous matcher predicates because matching is
/// awaited sequentially.
pub struct RouteTable {
    entries: Mutex<Vec<Arc<RouteEntry>>>,
    waiters: Mutex<Vec<RequestWaiter>>,
    next_route_id: AtomicU64,
    next_waiter_id: AtomicU64,
    fetcher: Arc<ReplayFetcher>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(Arc::new(ReplayFetcher::default()))
    }
}

impl RouteTable {
    pub fn new(fetcher: Arc<ReplayFetcher>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            waiters: Mutex::new(Vec::new()),
            next_route_id: AtomicU64::new(1),
            next_waiter_id: AtomicU64::new(1),
            fetcher,
        }
    }

    pub fn route<H, Fut>(&self, matcher: RouteMatcher, handler: H, options: RouteOptions) -> RouteId
    where
        H: Fn(Route) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RouteDecision, BoxError>> + Send + 'static,
    {
        self.route_boxed(
            matcher,
            Arc::new(move |route| Box::pin(handler(route))),
            options,
        )
    }

    pub(crate) fn route_boxed(
        &self,
        matcher: RouteMatcher,
        handler: RouteHandler,
        options: RouteOptions,
    ) -> RouteId {
        let id = RouteId(self.next_route_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(RouteEntry {
            id,
            matcher,
            handler,
            scope: options.scope,
            times: options.times,
            calls: AtomicU64::new(0),
        });
        self.entries.lock().push(entry);
        id
    }

    pub fn unroute(&self, id: RouteId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    pub fn unroute_all(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Resolves one intercepted request against the chain. No match, or all
    /// matches falling back, is an implicit passthrough.
    pub async fn resolve(
        &self,
        request: &MockRequest,
        origin: RequestOrigin,
    ) -> Result<RouteDecision, RouteError> {
        self.notify_waiters(request, origin).await;

        let snapshot: Vec<Arc<RouteEntry>> = self.entries.lock().clone();
        for entry in snapshot {
            if !entry.scope.applies_to(origin) || entry.exhausted() {
                continue;
            }
            if !entry.matcher.matches(request).await {
                continue;
            }

            let route = Route::new(request.clone(), Arc::clone(&self.fetcher));
            let decision = (entry.handler)(route).await.map_err(RouteError::Handler)?;
            if matches!(decision, RouteDecision::Fallback) {
                continue;
            }

            self.record_terminal_call(&entry);
            return Ok(decision);
        }

        Ok(RouteDecision::Passthrough)
    }

    fn record_terminal_call(&self, entry: &Arc<RouteEntry>) {
        let calls = entry.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if entry.times == Some(calls) {
            self.entries.lock().retain(|candidate| candidate.id != entry.id);
        }
    }

    /// Resolves with the first request matching `matcher` observed after the
    /// call; times out with a distinct error if none arrives.
    pub async fn wait_for_request(
        &self,
        matcher: RouteMatcher,
        options: WaitOptions,
    ) -> Result<MockRequest, RouteError> {
        let (sender, receiver) = oneshot::channel();
        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        self.waiters.lock().push(RequestWaiter {
            id,
            matcher,
            scope: options.scope,
            sender,
        });

        match tokio::time::timeout(options.timeout, receiver).await {
            Ok(Ok(request)) => Ok(request),
            _ => {
                self.waiters.lock().retain(|waiter| waiter.id != id);
                Err(RouteError::WaitForRequestTimeout)
            }
        }
    }

    async fn notify_waiters(&self, request: &MockRequest, origin: RequestOrigin) {
        let pending = std::mem::take(&mut *self.waiters.lock());
        if pending.is_empty() {
            return;
        }

        let mut kept = Vec::with_capacity(pending.len());
        for waiter in pending {
            if waiter.scope.applies_to(origin) && waiter.matcher.matches(request).await {
                let _ = waiter.sender.send(request.clone());
            } else {
                kept.push(waiter);
            }
        }
        self.waiters.lock().extend(kept);
    }
}
