//! Lookup, the leader/waiter decision and the entry mutation happen under
//! one lock; nothing awaits while it is held.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError<E> {
    #[error("{0}")]
    Producer(E),
    /// The producer panicked before settling.
    #[error("upstream invocation was abandoned before completing")]
    Abandoned,
}

impl<E> AggregateError<E> {
    pub fn producer_error(&self) -> Option<&E> {
        match self {
            AggregateError::Producer(e) => Some(e),
            AggregateError::Abandoned => None,
        }
    }
}

type Outcome<T, E> = Result<T, AggregateError<E>>;
type Waiter<T, E> = oneshot::Sender<Outcome<T, E>>;

enum EntryState<T, E> {
    /// `last` is only set after a success.
    Idle { last: Option<T> },
    Executing { waiters: Vec<Waiter<T, E>> },
}

struct Entry<T, E> {
    state: EntryState<T, E>,
    completed_at: Option<Instant>,
}

impl<T: Clone, E> Entry<T, E> {
    fn executing(leader: Waiter<T, E>) -> Self {
        Self {
            state: EntryState::Executing {
                waiters: vec![leader],
            },
            completed_at: None,
        }
    }

    fn admit(&mut self, now: Instant, window: Duration) -> Decision<T, E> {
        let fresh = self.is_fresh(now, window);
        let joined = match &mut self.state {
            EntryState::Executing { waiters } => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(Decision::Join(rx))
            }
            EntryState::Idle { last: Some(value) } if fresh => Some(Decision::Reuse(value.clone())),
            EntryState::Idle { .. } => None,
        };
        match joined {
            Some(decision) => decision,
            None => {
                let (tx, rx) = oneshot::channel();
                self.state = EntryState::Executing { waiters: vec![tx] };
                Decision::Lead(rx)
            }
        }
    }
}

impl<T, E> Entry<T, E> {
    fn is_fresh(&self, now: Instant, window: Duration) -> bool {
        self.completed_at
            .is_some_and(|at| now.duration_since(at) < window)
    }

    fn is_reapable(&self, now: Instant, window: Duration) -> bool {
        matches!(self.state, EntryState::Idle { .. }) && !self.is_fresh(now, window)
    }
}

struct Table<T, E> {
    entries: HashMap<String, Entry<T, E>>,
    last_sweep: Instant,
}

impl<T, E> Table<T, E> {
    fn sweep(&mut self, now: Instant, window: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_reapable(now, window));
        self.last_sweep = now;
        before - self.entries.len()
    }
}

#[derive(Debug, Default)]
struct AggregatorStats {
    executions: AtomicU64,
    coalesced: AtomicU64,
    reused: AtomicU64,
    failures: AtomicU64,
    swept: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStatsSnapshot {
    pub entries: usize,
    pub executions: u64,
    /// Callers that joined an invocation already in flight.
    pub coalesced: u64,
    /// Callers served from a value inside the window.
    pub reused: u64,
    pub failures: u64,
    pub swept: u64,
}

struct Shared<T, E> {
    window: Duration,
    table: Mutex<Table<T, E>>,
    stats: AggregatorStats,
}

impl<T: Clone, E: Clone> Shared<T, E> {
    fn lock(&self) -> MutexGuard<'_, Table<T, E>> {
        // Every mutation leaves the table consistent, so a poisoned lock is
        // still safe to use.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `None` means the invocation was abandoned.
    fn complete(&self, key: &str, outcome: Option<Result<T, E>>) {
        let waiters = {
            let mut table = self.lock();
            let Some(entry) = table.entries.get_mut(key) else {
                warn!(key, "completed invocation has no entry");
                return;
            };
            let last = match &outcome {
                Some(Ok(value)) => Some(value.clone()),
                _ => None,
            };
            entry.completed_at = Some(Instant::now());
            match std::mem::replace(&mut entry.state, EntryState::Idle { last }) {
                EntryState::Executing { waiters } => waiters,
                EntryState::Idle { .. } => Vec::new(),
            }
        };

        let fanned_out = waiters.len();
        match outcome {
            Some(Ok(value)) => {
                for waiter in waiters {
                    let _ = waiter.send(Ok(value.clone()));
                }
            }
            Some(Err(err)) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                for waiter in waiters {
                    let _ = waiter.send(Err(AggregateError::Producer(err.clone())));
                }
            }
            None => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!(key, "invocation abandoned, releasing {} waiters", fanned_out);
                for waiter in waiters {
                    let _ = waiter.send(Err(AggregateError::Abandoned));
                }
            }
        }
        trace!(key, fanned_out, "invocation settled");
    }
}

/// Scoped ownership of an `Executing` entry.
///
/// Dropping an unsettled flight (unwinding out of the producer, or the
/// driving task being torn down) returns the entry to `Idle` and releases
/// every waiter.
struct Flight<T: Clone, E: Clone> {
    shared: Arc<Shared<T, E>>,
    key: Option<String>,
}

impl<T: Clone, E: Clone> Flight<T, E> {
    fn settle(mut self, outcome: Result<T, E>) {
        if let Some(key) = self.key.take() {
            self.shared.complete(&key, Some(outcome));
        }
    }
}

impl<T: Clone, E: Clone> Drop for Flight<T, E> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.shared.complete(&key, None);
        }
    }
}

enum Decision<T, E> {
    Lead(oneshot::Receiver<Outcome<T, E>>),
    Join(oneshot::Receiver<Outcome<T, E>>),
    Reuse(T),
}

/// Collapses concurrent calls for the same key onto one producer invocation.
pub struct RequestAggregator<T, E> {
    inner: Arc<Shared<T, E>>,
}

impl<T, E> Clone for RequestAggregator<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> std::fmt::Debug for RequestAggregator<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self
            .inner
            .table
            .try_lock()
            .map(|t| t.entries.len())
            .unwrap_or_default();
        f.debug_struct("RequestAggregator")
            .field("window", &self.inner.window)
            .field("entries", &entries)
            .finish()
    }
}

impl<T, E> RequestAggregator<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Arc::new(Shared {
                window,
                table: Mutex::new(Table {
                    entries: HashMap::new(),
                    last_sweep: Instant::now(),
                }),
                stats: AggregatorStats::default(),
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// The producer's future runs on its own task, so dropping the leader's
    /// future does not cancel it for the other waiters.
    pub async fn execute<F, Fut>(&self, key: &str, producer: F) -> Result<T, AggregateError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let decision = {
            let now = Instant::now();
            let window = self.inner.window;
            let mut table = self.inner.lock();

            if now.duration_since(table.last_sweep) >= window {
                let removed = table.sweep(now, window);
                if removed > 0 {
                    self.inner.stats.swept.fetch_add(removed as u64, Ordering::Relaxed);
                    trace!(removed, "opportunistic sweep");
                }
            }

            // Only a new key pays for an owned copy.
            let decision = match table.entries.get_mut(key) {
                Some(entry) => entry.admit(now, window),
                None => {
                    let (tx, rx) = oneshot::channel();
                    table.entries.insert(key.to_owned(), Entry::executing(tx));
                    Decision::Lead(rx)
                }
            };
            decision
        };

        let rx = match decision {
            Decision::Reuse(value) => {
                self.inner.stats.reused.fetch_add(1, Ordering::Relaxed);
                debug!(key, "reusing result within window");
                return Ok(value);
            }
            Decision::Join(rx) => {
                self.inner.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key, "joining in-flight invocation");
                rx
            }
            Decision::Lead(rx) => {
                self.inner.stats.executions.fetch_add(1, Ordering::Relaxed);
                debug!(key, "leading new invocation");
                let flight = Flight {
                    shared: Arc::clone(&self.inner),
                    key: Some(key.to_owned()),
                };
                // A panic while building the future drops `flight` here.
                let fut = producer();
                tokio::spawn(async move {
                    let outcome = fut.await;
                    flight.settle(outcome);
                });
                rx
            }
        };

        rx.await.unwrap_or(Err(AggregateError::Abandoned))
    }

    pub fn sweep(&self) -> usize {
        let removed = self.inner.lock().sweep(Instant::now(), self.inner.window);
        self.inner.stats.swept.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Panics if `every` is zero.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let shared: Weak<Shared<T, E>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let removed = shared.lock().sweep(Instant::now(), shared.window);
                if removed > 0 {
                    shared.stats.swept.fetch_add(removed as u64, Ordering::Relaxed);
                    debug!(removed, "swept stale aggregator entries");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> AggregatorStatsSnapshot {
        let stats = &self.inner.stats;
        AggregatorStatsSnapshot {
            entries: self.len(),
            executions: stats.executions.load(Ordering::Relaxed),
            coalesced: stats.coalesced.load(Ordering::Relaxed),
            reused: stats.reused.load(Ordering::Relaxed),
            failures: stats.failures.load(Ordering::Relaxed),
            swept: stats.swept.load(Ordering::Relaxed),
        }
    }
}
