//! Retry plumbing: optimistic-concurrency writes against the store, and the
//! backoff window a failed pass leaves behind in status.

use std::fmt::Debug;
use std::time::Duration;

use chrono::{DateTime, Utc};
use helmop_core::{ObjectKey, RetryWindow};
use helmop_kubehub::ResourceStore;
use tracing::debug;

use crate::ReconcileError;

pub const DEFAULT_CONFLICT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Write {
    /// Metadata and spec (finalizers).
    Object,
    /// Status subresource.
    Status,
}

/// Read the latest object, apply `mutate`, write it back; on conflict start over
/// from a fresh read, at most `attempts` times. `Ok(None)` when the object is gone.
pub async fn with_conflict_retry<K, F>(
    store: &dyn ResourceStore<K>,
    key: &ObjectKey,
    write: Write,
    attempts: u32,
    mut mutate: F,
) -> Result<Option<K>, ReconcileError>
where
    K: kube::Resource + Clone + Debug + serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
    F: FnMut(&mut K) + Send,
{
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        let Some(mut obj) = store.get(key).await? else { return Ok(None) };
        mutate(&mut obj);
        let res = match write {
            Write::Object => store.update(&obj).await,
            Write::Status => store.update_status(&obj).await,
        };
        match res {
            Ok(updated) => return Ok(Some(updated)),
            Err(e) if e.is_conflict() => {
                debug!(key = %key, attempt, ?write, "write conflict, retrying");
            }
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
    metrics::counter!("helmop_conflict_retries_exhausted_total", 1u64);
    Err(ReconcileError::ConflictRetriesExhausted { key: key.to_string(), attempts })
}

/// Time left in the retry window a failed pass left behind, or `None` when a
/// pass may run now. A spec change since the failure closes the window.
pub fn backoff_remaining(window: Option<&RetryWindow>, generation: i64, now: DateTime<Utc>) -> Option<Duration> {
    let w = window.filter(|w| w.generation == generation)?;
    let left = (w.not_before - now).to_std().ok()?;
    (!left.is_zero()).then_some(left)
}

/// Window for a failure on `generation` that waits `delay` from `now`.
pub fn retry_window(generation: i64, delay: Duration, now: DateTime<Utc>) -> RetryWindow {
    RetryWindow { generation, not_before: now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmop_core::{HelmRepository, HelmRepositorySpec};
    use helmop_kubehub::MemoryStore;

    fn seeded() -> (MemoryStore<HelmRepository>, ObjectKey) {
        let store = MemoryStore::new();
        let mut repo = HelmRepository::new("bitnami", HelmRepositorySpec { url: "https://charts.bitnami.com/bitnami".into(), ..Default::default() });
        repo.metadata.namespace = Some("infra".into());
        store.insert(repo);
        (store, ObjectKey::new("infra", "bitnami"))
    }

    #[tokio::test]
    async fn retries_through_transient_conflicts() {
        let (store, key) = seeded();
        store.inject_conflicts(3);
        let out = with_conflict_retry(&store, &key, Write::Status, 5, |r: &mut HelmRepository| {
            r.status.get_or_insert_with(Default::default).consecutive_failures = 7;
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(out.status.unwrap().consecutive_failures, 7);
        assert_eq!(store.status_writes(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let (store, key) = seeded();
        store.inject_conflicts(10);
        let err = with_conflict_retry(&store, &key, Write::Object, 5, |_r: &mut HelmRepository| {}).await.unwrap_err();
        assert!(matches!(err, ReconcileError::ConflictRetriesExhausted { attempts: 5, .. }));
    }

    #[tokio::test]
    async fn missing_object_is_none() {
        let (store, _) = seeded();
        let gone = ObjectKey::new("infra", "nope");
        assert!(with_conflict_retry(&store, &gone, Write::Status, 5, |_r: &mut HelmRepository| {}).await.unwrap().is_none());
    }

    #[test]
    fn retry_window_holds_for_the_failed_generation() {
        let now = Utc::now();
        let w = retry_window(3, Duration::from_secs(30), now);
        assert_eq!(backoff_remaining(Some(&w), 3, now), Some(Duration::from_secs(30)));
        // spec moved on
        assert_eq!(backoff_remaining(Some(&w), 4, now), None);
        assert_eq!(backoff_remaining(Some(&w), 3, now + chrono::Duration::seconds(31)), None);
        assert_eq!(backoff_remaining(None, 3, now), None);
    }
}
