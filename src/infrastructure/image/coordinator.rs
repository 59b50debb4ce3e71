//! Request coalescing for image fetches.
//!
//! At most one fetch per [`CacheKey`] is in flight at any time. The first
//! caller to miss both cache tiers spawns the fetch; callers arriving while it
//! runs join it and all of them observe the same outcome.
//!
//! ```text
//! load(A) ─┐
//! load(A) ─┼──► RequestCoordinator ──► one spawned fetch task
//! load(A) ─┘          ▲                        │
//!                     └──── watch channel ◄────┘
//! ```
//!
//! Per key the table moves `absent → in-flight → absent`. The fetch task
//! removes its own entry when it finishes, success or failure, so a failed
//! key is retried from scratch by the next caller.
//!
//! Waiters are reference counted. A caller that goes away (its future is
//! dropped) releases its share; when the last one leaves before the fetch
//! completes, the fetch task is aborted and the entry removed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::domain::entities::CacheKey;
use crate::domain::errors::{CacheError, CacheResult};

type Outcome<T> = Option<CacheResult<T>>;

struct Flight<T> {
    id: u64,
    waiters: usize,
    result: watch::Receiver<Outcome<T>>,
    abort: AbortHandle,
}

struct Shared<T> {
    flights: Mutex<HashMap<CacheKey, Flight<T>>>,
    next_id: AtomicU64,
    total_requests: AtomicU64,
    coalesced_requests: AtomicU64,
    new_requests: AtomicU64,
    cancelled_requests: AtomicU64,
}

/// Deduplicates concurrent fetches of the same key.
pub struct RequestCoordinator<T> {
    shared: Arc<Shared<T>>,
}

/// Snapshot of coordinator activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Total calls to [`RequestCoordinator::run`].
    pub total_requests: u64,
    /// Calls that joined a fetch already in flight.
    pub coalesced_requests: u64,
    /// Calls that started a new fetch.
    pub new_requests: u64,
    /// Fetches aborted because every waiter went away.
    pub cancelled_requests: u64,
}

impl CoordinatorStats {
    /// Returns the share of requests that were coalesced (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.coalesced_requests as f64 / self.total_requests as f64
        }
    }
}

impl<T> RequestCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                flights: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                total_requests: AtomicU64::new(0),
                coalesced_requests: AtomicU64::new(0),
                new_requests: AtomicU64::new(0),
                cancelled_requests: AtomicU64::new(0),
            }),
        }
    }

    /// Runs `fetch` for `key` unless a fetch for it is already in flight, in
    /// which case the caller waits for that one instead.
    ///
    /// `fetch` is only invoked by the caller that starts the flight.
    ///
    /// # Errors
    /// Returns the shared fetch error, or [`CacheError::Cancelled`] if the
    /// fetch task ended without producing a result.
    pub async fn run<F, Fut>(&self, key: &CacheKey, fetch: F) -> CacheResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
    {
        let (id, mut result) = self.join_or_start(key, fetch);
        let _waiter = Waiter {
            shared: Arc::clone(&self.shared),
            key: key.clone(),
            id,
        };

        match result.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.as_ref().cloned().unwrap_or(Err(CacheError::Cancelled)),
            Err(_) => Err(CacheError::Cancelled),
        }
    }

    fn join_or_start<F, Fut>(&self, key: &CacheKey, fetch: F) -> (u64, watch::Receiver<Outcome<T>>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
    {
        let shared = &self.shared;
        let mut flights = shared.flights.lock();
        shared.total_requests.fetch_add(1, Ordering::Relaxed);

        if let Some(flight) = flights.get_mut(key) {
            flight.waiters += 1;
            shared.coalesced_requests.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, waiters = flight.waiters, "Joining in-flight fetch");
            return (flight.id, flight.result.clone());
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(drive(Arc::clone(shared), key.clone(), id, fetch(), tx));
        flights.insert(
            key.clone(),
            Flight {
                id,
                waiters: 1,
                result: rx.clone(),
                abort: task.abort_handle(),
            },
        );
        shared.new_requests.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, in_flight = flights.len(), "Starting fetch");
        (id, rx)
    }

    /// Returns the number of keys currently being fetched.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.shared.flights.lock().len()
    }

    /// Returns true if a fetch for `key` is in flight.
    #[must_use]
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.shared.flights.lock().contains_key(key)
    }

    /// Returns a snapshot of the coordinator statistics.
    #[must_use]
    pub fn stats(&self) -> CoordinatorStats {
        let shared = &self.shared;
        CoordinatorStats {
            total_requests: shared.total_requests.load(Ordering::Relaxed),
            coalesced_requests: shared.coalesced_requests.load(Ordering::Relaxed),
            new_requests: shared.new_requests.load(Ordering::Relaxed),
            cancelled_requests: shared.cancelled_requests.load(Ordering::Relaxed),
        }
    }
}

impl<T> Default for RequestCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for RequestCoordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoordinator")
            .field("in_flight", &self.shared.flights.lock().len())
            .finish_non_exhaustive()
    }
}

async fn drive<T, Fut>(
    shared: Arc<Shared<T>>,
    key: CacheKey,
    id: u64,
    fetch: Fut,
    tx: watch::Sender<Outcome<T>>,
) where
    Fut: Future<Output = CacheResult<T>>,
{
    let outcome = fetch.await;

    {
        let mut flights = shared.flights.lock();
        if flights.get(&key).is_some_and(|flight| flight.id == id) {
            flights.remove(&key);
        }
    }

    trace!(key = %key, ok = outcome.is_ok(), "Fetch finished");
    let _ = tx.send(Some(outcome));
}

/// One caller's share of a flight.
struct Waiter<T> {
    shared: Arc<Shared<T>>,
    key: CacheKey,
    id: u64,
}

impl<T> Drop for Waiter<T> {
    fn drop(&mut self) {
        let mut flights = self.shared.flights.lock();

        let abandoned = match flights.get_mut(&self.key) {
            Some(flight) if flight.id == self.id => {
                flight.waiters -= 1;
                flight.waiters == 0
            }
            // Finished flights have already left the table.
            _ => false,
        };

        if abandoned && let Some(flight) = flights.remove(&self.key) {
            flight.abort.abort();
            self.shared
                .cancelled_requests
                .fetch_add(1, Ordering::Relaxed);
            debug!(key = %self.key, "Last waiter left, fetch aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio_test::assert_pending;

    fn key() -> CacheKey {
        CacheKey::from_url("https://example.com/a.png")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    type BoxFetch = Pin<Box<dyn Future<Output = CacheResult<u32>> + Send>>;

    /// A fetch that blocks on `gate` and counts how often it was started.
    fn gated_fetch(
        gate: &Arc<Semaphore>,
        calls: &Arc<AtomicUsize>,
        outcome: CacheResult<u32>,
    ) -> impl FnOnce() -> BoxFetch + Send + 'static {
        let gate = Arc::clone(gate);
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let fetch: BoxFetch = Box::pin(async move {
                let _permit = gate.acquire().await.map_err(|_| CacheError::Cancelled)?;
                outcome
            });
            fetch
        }
    }

    #[tokio::test]
    async fn test_single_request() {
        let coordinator = RequestCoordinator::new();

        let result = coordinator.run(&key(), || async { Ok(7u32) }).await;

        assert_eq!(result, Ok(7));
        assert_eq!(coordinator.in_flight_count(), 0);
        assert_eq!(coordinator.stats().new_requests, 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let coordinator = Arc::new(RequestCoordinator::new());
        let gate = Arc::new(Semaphore::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                let fetch = gated_fetch(&gate, &calls, Ok(42));
                tokio::spawn(async move { coordinator.run(&key(), fetch).await })
            })
            .collect();

        wait_until(|| coordinator.stats().total_requests == 8).await;
        assert!(coordinator.is_in_flight(&key()));
        gate.add_permits(1);

        for result in futures_util::future::join_all(handles).await {
            assert_eq!(result.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = coordinator.stats();
        assert_eq!(stats.new_requests, 1);
        assert_eq!(stats.coalesced_requests, 7);
        assert!((stats.coalescing_ratio() - 0.875).abs() < 1e-9);
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_replayed() {
        let coordinator = Arc::new(RequestCoordinator::<u32>::new());
        let gate = Arc::new(Semaphore::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                let fetch = gated_fetch(&gate, &calls, Err(CacheError::network("HTTP 503")));
                tokio::spawn(async move { coordinator.run(&key(), fetch).await })
            })
            .collect();

        wait_until(|| coordinator.stats().total_requests == 3).await;
        gate.add_permits(1);

        for result in futures_util::future::join_all(handles).await {
            assert_eq!(result.unwrap(), Err(CacheError::network("HTTP 503")));
        }
        assert!(!coordinator.is_in_flight(&key()));

        gate.add_permits(1);
        let retry = coordinator
            .run(&key(), gated_fetch(&gate, &calls, Ok(1)))
            .await;
        assert_eq!(retry, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_different_keys_fetch_independently() {
        let coordinator = RequestCoordinator::new();
        let (key_a, key_b) = (CacheKey::from_url("a"), CacheKey::from_url("b"));
        let a = coordinator.run(&key_a, || async { Ok(1u32) });
        let b = coordinator.run(&key_b, || async { Ok(2u32) });

        let (a, b) = tokio::join!(a, b);

        assert_eq!((a, b), (Ok(1), Ok(2)));
        assert_eq!(coordinator.stats().new_requests, 2);
        assert_eq!(coordinator.stats().coalesced_requests, 0);
    }

    #[tokio::test]
    async fn test_one_caller_cancelling_keeps_fetch_alive() {
        let coordinator = Arc::new(RequestCoordinator::new());
        let gate = Arc::new(Semaphore::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let spawn_caller = || {
            let coordinator = Arc::clone(&coordinator);
            let fetch = gated_fetch(&gate, &calls, Ok(5));
            tokio::spawn(async move { coordinator.run(&key(), fetch).await })
        };
        let first = spawn_caller();
        let second = spawn_caller();
        wait_until(|| coordinator.stats().total_requests == 2).await;

        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());
        assert!(coordinator.is_in_flight(&key()));

        gate.add_permits(1);
        assert_eq!(second.await.unwrap(), Ok(5));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.stats().cancelled_requests, 0);
    }

    #[tokio::test]
    async fn test_last_caller_cancelling_aborts_fetch() {
        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let coordinator = Arc::new(RequestCoordinator::<u32>::new());
        let fetch_dropped = Arc::new(AtomicBool::new(false));

        let caller = {
            let coordinator = Arc::clone(&coordinator);
            let flag = Arc::clone(&fetch_dropped);
            tokio::spawn(async move {
                coordinator
                    .run(&key(), move || {
                        // Owned by the future from creation, so it drops even
                        // if the fetch is aborted before its first poll.
                        let guard = SetOnDrop(flag);
                        async move {
                            let _guard = guard;
                            std::future::pending::<CacheResult<u32>>().await
                        }
                    })
                    .await
            })
        };
        wait_until(|| coordinator.is_in_flight(&key())).await;

        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        assert_eq!(coordinator.in_flight_count(), 0);
        assert_eq!(coordinator.stats().cancelled_requests, 1);
        wait_until(|| fetch_dropped.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn test_dropping_pending_waiter_releases_entry() {
        let coordinator = RequestCoordinator::<u32>::new();
        let key = key();

        let mut waiter = tokio_test::task::spawn(
            coordinator.run(&key, || std::future::pending::<CacheResult<u32>>()),
        );
        assert_pending!(waiter.poll());
        assert_eq!(coordinator.in_flight_count(), 1);

        drop(waiter);

        assert_eq!(coordinator.in_flight_count(), 0);
        assert_eq!(coordinator.stats().cancelled_requests, 1);
    }

    #[tokio::test]
    async fn test_completed_key_starts_fresh_flight() {
        let coordinator = RequestCoordinator::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let result = coordinator
                .run(&key(), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(9u32) }
                })
                .await;
            assert_eq!(result, Ok(9));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.stats().new_requests, 3);
    }
}
