//! Coalesces repeated calls on the same key into one deferred invocation.
//!
//! A call on key `k` either creates an entry (first call) or replaces the
//! entry's pending call (later calls). The entry fires `waitFor` after the
//! most recent call, but never later than `maxWaitFor` after the first call
//! of the current window. Firing removes the entry under the lock and runs
//! the pending call outside it.

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures_util::{FutureExt, future::BoxFuture};
use tokio::{
    task::AbortHandle,
    time::{Instant, sleep_until, timeout},
};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::{clients::consumer::panic_message, error::DispatchError, models::listener::DebounceConfig};

/// A deferred handler invocation carrying its own arguments.
pub type PendingCall = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// First call on the key; a timer was armed.
    Scheduled,
    /// Replaced the pending call of an existing entry.
    Coalesced,
    /// The coordinator is drained; the call was started right away.
    Immediate,
}

struct Entry {
    generation: u64,
    first_seen: Instant,
    last_seen: Instant,
    deadline: Instant,
    config: DebounceConfig,
    calls: u64,
    pending: PendingCall,
    timer: Option<AbortHandle>,
}

impl Entry {
    fn refresh(&mut self, now: Instant) {
        self.last_seen = now;
        self.deadline = deadline(self.first_seen, now, &self.config);
    }
}

fn deadline(first_seen: Instant, last_seen: Instant, config: &DebounceConfig) -> Instant {
    (last_seen + config.wait_for()).min(first_seen + config.max_wait_for())
}

enum TimerStep {
    Sleep(Instant),
    Fire(Entry),
    Stop,
}

struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    generations: AtomicU64,
    firing: AtomicUsize,
    closed: AtomicBool,
    tracker: TaskTracker,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Counts one debounced call as in flight until dropped, however the call ends.
struct FiringGuard {
    inner: Arc<Inner>,
}

impl FiringGuard {
    fn new(inner: Arc<Inner>) -> Self {
        inner.firing.fetch_add(1, Ordering::SeqCst);
        Self { inner }
    }
}

impl Drop for FiringGuard {
    fn drop(&mut self) {
        self.inner.firing.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct DebounceCoordinator {
    inner: Arc<Inner>,
}

impl Default for DebounceCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl DebounceCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                firing: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Absorbs `call` into the entry for `key`. Never waits for the handler.
    pub fn submit(&self, key: String, config: DebounceConfig, call: PendingCall) -> Submission {
        if self.inner.closed.load(Ordering::SeqCst) {
            self.inner.tracker.spawn(fire(Arc::clone(&self.inner), key, call, 1));
            return Submission::Immediate;
        }

        let now = Instant::now();
        let mut entries = self.inner.entries();

        if let Some(entry) = entries.get_mut(&key) {
            entry.pending = call;
            entry.calls += 1;
            entry.refresh(now);

            debug!(key = %key, calls = entry.calls, "Debounced call coalesced");
            return Submission::Coalesced;
        }

        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst);
        entries.insert(
            key.clone(),
            Entry {
                generation,
                first_seen: now,
                last_seen: now,
                deadline: deadline(now, now, &config),
                config,
                calls: 1,
                pending: call,
                timer: None,
            },
        );

        let timer = self
            .inner
            .tracker
            .spawn(run_timer(Arc::clone(&self.inner), key.clone(), generation));

        if let Some(entry) = entries.get_mut(&key) {
            entry.timer = Some(timer.abort_handle());
        }

        debug!(key = %key, wait_for_ms = config.wait_for_ms, "Debounce window opened");
        Submission::Scheduled
    }

    pub fn pending(&self) -> usize {
        self.inner.entries().len()
    }

    /// Fires every pending entry now and waits for all in-flight debounced
    /// calls. Later submissions run immediately instead of being deferred.
    pub async fn drain(&self, grace: Duration) -> Result<(), DispatchError> {
        self.inner.closed.store(true, Ordering::SeqCst);

        let drained: Vec<(String, Entry)> = self.inner.entries().drain().collect();
        info!(pending = drained.len(), "Draining debounce entries");

        for (key, entry) in drained {
            if let Some(timer) = &entry.timer {
                timer.abort();
            }
            self.inner
                .tracker
                .spawn(fire(Arc::clone(&self.inner), key, entry.pending, entry.calls));
        }

        self.inner.tracker.close();

        timeout(grace, self.inner.tracker.wait())
            .await
            .map_err(|_| DispatchError::DebounceDrainTimeout {
                pending: self.inner.firing.load(Ordering::SeqCst),
            })
    }
}

async fn run_timer(inner: Arc<Inner>, key: String, generation: u64) {
    loop {
        let step = {
            let mut entries = inner.entries();
            let current = entries.get(&key).map(|e| (e.generation, e.deadline));
            match current {
                Some((owner, _)) if owner != generation => TimerStep::Stop,
                Some((_, deadline)) if deadline > Instant::now() => TimerStep::Sleep(deadline),
                Some(_) => entries
                    .remove(&key)
                    .map_or(TimerStep::Stop, TimerStep::Fire),
                None => TimerStep::Stop,
            }
        };

        match step {
            TimerStep::Sleep(deadline) => sleep_until(deadline).await,
            TimerStep::Fire(entry) => {
                debug!(
                    key = %key,
                    calls = entry.calls,
                    window_ms = entry.last_seen.duration_since(entry.first_seen).as_millis() as u64,
                    "Debounce window closed"
                );
                fire(inner, key, entry.pending, entry.calls).await;
                return;
            }
            TimerStep::Stop => return,
        }
    }
}

/// The call is counted as firing from the moment this is called, not from
/// its first poll.
fn fire(
    inner: Arc<Inner>,
    key: String,
    call: PendingCall,
    calls: u64,
) -> impl Future<Output = ()> + Send + 'static {
    let guard = FiringGuard::new(inner);

    async move {
        let _guard = guard;
        let outcome = AssertUnwindSafe(async move { call().await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(DispatchError::Handler(panic_message(panic.as_ref())).into()));

        if let Err(e) = outcome {
            error!(key = %key, calls, error = %e, "Debounced handler failed");
        }
    }
}
