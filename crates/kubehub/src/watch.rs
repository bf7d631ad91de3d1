//! Watch streams feeding the work queues.

use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use helmop_core::ObjectKey;
use helmop_queue::WorkQueue;
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    runtime::WatchStreamExt,
};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The parts of an object a reconcile pass reacts to. Status writes and
/// finalizer edits leave it unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    generation: Option<i64>,
    deleting: bool,
}

impl Fingerprint {
    fn of<K: kube::Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self { generation: meta.generation, deleting: meta.deletion_timestamp.is_some() }
    }
}

/// Per-key memory of the last fingerprint seen on the watch.
#[derive(Debug, Default)]
pub struct ChangeFilter {
    seen: FxHashMap<ObjectKey, Fingerprint>,
}

impl ChangeFilter {
    pub fn new() -> Self { Self::default() }

    /// Record `obj` and report whether it changed in a way that needs a pass.
    /// Unknown objects always do.
    pub fn admit<K: kube::Resource>(&mut self, obj: &K) -> bool {
        let fp = Fingerprint::of(obj);
        self.seen.insert(ObjectKey::of(obj), fp) != Some(fp)
    }

    pub fn forget(&mut self, key: &ObjectKey) { self.seen.remove(key); }

    /// Keys remembered but absent from a fresh listing; they are dropped.
    pub fn retain_listed(&mut self, listed: &FxHashSet<ObjectKey>) -> Vec<ObjectKey> {
        let gone: Vec<ObjectKey> = self.seen.keys().filter(|k| !listed.contains(*k)).cloned().collect();
        for k in &gone {
            self.seen.remove(k);
        }
        gone
    }
}

/// List+watch `api` and feed changed objects' keys into `queue` until
/// cancelled. Updates that only touch status or finalizers are dropped, and a
/// relist re-adds unchanged keys without disturbing their schedule. Watch
/// errors are retried with backoff.
pub async fn watch_into<K>(api: Api<K>, kind: &'static str, queue: Arc<WorkQueue<ObjectKey>>, token: CancellationToken)
where
    K: kube::Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    let mut filter = ChangeFilter::new();
    info!(kind, "watcher started");
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            ev = stream.next() => ev,
        };
        match next {
            Some(Ok(Event::Applied(o))) => {
                if filter.admit(&o) {
                    queue.add(ObjectKey::of(&o));
                } else {
                    metrics::counter!("helmop_watch_events_filtered_total", 1u64, "kind" => kind);
                }
            }
            Some(Ok(Event::Deleted(o))) => {
                let key = ObjectKey::of(&o);
                debug!(kind, key = %key, "object gone");
                filter.forget(&key);
                queue.forget(&key);
            }
            Some(Ok(Event::Restarted(list))) => {
                debug!(kind, count = list.len(), "watch restart");
                let mut listed = FxHashSet::default();
                for o in list.iter() {
                    let key = ObjectKey::of(o);
                    listed.insert(key.clone());
                    if filter.admit(o) {
                        queue.add(key);
                    } else {
                        queue.resync(key);
                    }
                }
                for key in filter.retain_listed(&listed) {
                    queue.forget(&key);
                }
            }
            Some(Err(e)) => {
                metrics::counter!("helmop_watch_errors_total", 1u64, "kind" => kind);
                warn!(kind, error = %e, "watch error");
            }
            None => {
                warn!(kind, "watcher stream ended");
                break;
            }
        }
    }
    info!(kind, "watcher stopped");
}
