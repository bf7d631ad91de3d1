//! helmop queue: deduplicating work queue keyed by resource identity.
//!
//! A key is queued at most once, handed to at most one worker at a time, and
//! re-run after completion if it was added again while in flight. Delayed
//! requeues keep the earliest deadline per key; failed keys back off
//! exponentially until their next success. [`WorkQueue::add`] is for changes
//! and supersedes any schedule; [`WorkQueue::resync`] is for relists and never
//! pulls a scheduled key forward.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use helmop_core::{Action, BackoffProfile};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-key retry delay after a failed reconcile.
pub const ERROR_BACKOFF: BackoffProfile =
    BackoffProfile { base: Duration::from_secs(5), factor: 2.0, jitter: 0.0, steps: 8, cap: Duration::from_secs(300) };

fn tick_period() -> Duration {
    std::env::var("HELMOP_QUEUE_TICK_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(250))
}

struct Inner<K> {
    ready: VecDeque<K>,
    queued: FxHashSet<K>,
    in_flight: FxHashSet<K>,
    dirty: FxHashSet<K>,
    delayed: FxHashMap<K, Instant>,
    failures: FxHashMap<K, u32>,
}

pub struct WorkQueue<K> {
    name: &'static str,
    inner: Mutex<Inner<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                queued: FxHashSet::default(),
                in_flight: FxHashSet::default(),
                dirty: FxHashSet::default(),
                delayed: FxHashMap::default(),
                failures: FxHashMap::default(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &'static str { self.name }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> { self.inner.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Queue for immediate processing.
    pub fn add(&self, key: K) {
        let mut g = self.lock();
        if Self::push(&mut g, key) {
            drop(g);
            self.notify.notify_one();
        }
    }

    /// Queue a key seen again without a change. A key that is in flight,
    /// already queued or waiting on a delayed requeue keeps its schedule.
    pub fn resync(&self, key: K) {
        let mut g = self.lock();
        if g.in_flight.contains(&key) || g.delayed.contains_key(&key) {
            return;
        }
        if Self::push(&mut g, key) {
            drop(g);
            self.notify.notify_one();
        }
    }

    fn push(g: &mut Inner<K>, key: K) -> bool {
        g.delayed.remove(&key);
        if g.in_flight.contains(&key) {
            g.dirty.insert(key);
            return false;
        }
        if !g.queued.insert(key.clone()) {
            return false;
        }
        g.ready.push_back(key);
        true
    }

    /// Queue after `delay`; an earlier pending deadline for the same key wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let at = Instant::now() + delay;
        let mut g = self.lock();
        if g.queued.contains(&key) || g.dirty.contains(&key) {
            return;
        }
        let slot = g.delayed.entry(key).or_insert(at);
        if at < *slot { *slot = at; }
    }

    /// Move every delayed key due at `now` to the ready list. Returns how many moved.
    pub fn promote_due(&self, now: Instant) -> usize {
        let mut g = self.lock();
        let due: Vec<K> = g.delayed.iter().filter(|(_, at)| **at <= now).map(|(k, _)| k.clone()).collect();
        let mut woke = 0;
        for k in due {
            if Self::push(&mut g, k) { woke += 1; }
        }
        drop(g);
        for _ in 0..woke { self.notify.notify_one(); }
        woke
    }

    fn try_pop(&self) -> Option<K> {
        let mut g = self.lock();
        let key = g.ready.pop_front()?;
        g.queued.remove(&key);
        g.in_flight.insert(key.clone());
        Some(key)
    }

    /// Wait for the next ready key and mark it in flight.
    pub async fn next(&self) -> K {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(k) = self.try_pop() {
                return k;
            }
            notified.await;
        }
    }

    /// Release a key after a successful pass and schedule what it asked for.
    pub fn complete(&self, key: &K, action: Action) {
        let rerun = {
            let mut g = self.lock();
            g.in_flight.remove(key);
            g.failures.remove(key);
            g.dirty.remove(key)
        };
        if rerun {
            self.add(key.clone());
        } else if let Action::Requeue(d) = action {
            self.add_after(key.clone(), d);
        }
    }

    /// Release a key after a failed pass; returns the backoff applied.
    pub fn fail(&self, key: &K) -> Duration {
        let (rerun, attempts) = {
            let mut g = self.lock();
            g.in_flight.remove(key);
            let n = g.failures.entry(key.clone()).or_insert(0);
            *n += 1;
            let n = *n;
            (g.dirty.remove(key), n)
        };
        let delay = ERROR_BACKOFF.delay_for_attempt(attempts);
        if rerun {
            self.add(key.clone());
        } else {
            self.add_after(key.clone(), delay);
        }
        delay
    }

    /// Drop all pending state for a key; in-flight work still completes.
    pub fn forget(&self, key: &K) {
        let mut g = self.lock();
        g.delayed.remove(key);
        g.failures.remove(key);
        g.dirty.remove(key);
        if g.queued.remove(key) {
            g.ready.retain(|k| k != key);
        }
    }

    pub fn len(&self) -> usize { self.lock().ready.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn delayed_len(&self) -> usize { self.lock().delayed.len() }
    pub fn in_flight_len(&self) -> usize { self.lock().in_flight.len() }

    pub fn deadline(&self, key: &K) -> Option<Instant> { self.lock().delayed.get(key).copied() }
}

/// A reconciler drives one key toward its desired state.
#[async_trait::async_trait]
pub trait Reconcile<K>: Send + Sync + 'static {
    async fn reconcile(&self, key: &K) -> anyhow::Result<Action>;
}

/// Promote delayed keys on a fixed tick until cancelled.
pub fn spawn_ticker<K>(queue: Arc<WorkQueue<K>>, token: CancellationToken) -> JoinHandle<()>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_period());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    queue.promote_due(Instant::now());
                    metrics::gauge!("helmop_queue_depth", queue.len() as f64, "queue" => queue.name());
                    metrics::gauge!("helmop_queue_delayed", queue.delayed_len() as f64, "queue" => queue.name());
                }
            }
        }
        debug!(queue = queue.name(), "ticker stopped");
    })
}

/// Spawn `workers` tasks pulling from `queue`. Each finishes its current key
/// before observing cancellation.
pub fn spawn_workers<K, R>(queue: Arc<WorkQueue<K>>, reconciler: Arc<R>, workers: usize, token: CancellationToken) -> Vec<JoinHandle<()>>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    R: Reconcile<K>,
{
    (0..workers.max(1))
        .map(|id| {
            let queue = Arc::clone(&queue);
            let reconciler = Arc::clone(&reconciler);
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    let key = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        k = queue.next() => k,
                    };
                    match reconciler.reconcile(&key).await {
                        Ok(action) => {
                            debug!(queue = queue.name(), key = %key, ?action, "reconciled");
                            queue.complete(&key, action);
                        }
                        Err(e) => {
                            let backoff = queue.fail(&key);
                            warn!(queue = queue.name(), key = %key, error = %format!("{:#}", e), backoff_ms = backoff.as_millis() as u64, "reconcile failed");
                        }
                    }
                }
                info!(queue = queue.name(), worker = id, "worker stopped");
            })
        })
        .collect()
}
