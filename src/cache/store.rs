//! In-memory snapshot store keyed by (resource, subject).

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::clock::{Clock, SystemClock};
use super::detector::ChangeDetector;
use super::notifier::ChangeNotifier;
use super::traits::{Record, ResourceKey, SubjectId};

/// Default time-to-live for cached snapshots, in seconds.
pub const DEFAULT_TTL_SECS: i64 = 15 * 60;

/// One cached snapshot.
///
/// Items are shared behind an `Arc` and replaced wholesale on every write,
/// so a reader never sees a partially written list.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub items: Arc<Vec<Record>>,
  pub fetched_at: DateTime<Utc>,
  /// Sequence ticket of the fetch that produced this snapshot
  seq: u64,
  /// Set by a forced refresh; cleared by the next write
  invalidated: bool,
}

impl CacheEntry {
  /// Fresh while younger than `ttl` and not invalidated.
  pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
    !self.invalidated && now - self.fetched_at < ttl
  }

  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    now - self.fetched_at
  }
}

/// Summary of a cached snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetadata {
  pub fetched_at: DateTime<Utc>,
  pub age: Duration,
  pub is_fresh: bool,
  pub count: usize,
}

type EntryKey = (ResourceKey, SubjectId);

/// Keyed storage of fetched record sets.
///
/// This is the only shared mutable state of the cache. Every operation takes
/// the internal lock for its whole duration and nothing outside the store
/// touches the map.
pub struct CacheStore {
  entries: Mutex<HashMap<EntryKey, CacheEntry>>,
  detector: ChangeDetector,
  notifier: Arc<ChangeNotifier>,
  clock: Arc<dyn Clock>,
  default_ttl: Duration,
  next_seq: AtomicU64,
}

impl CacheStore {
  pub fn new(detector: ChangeDetector, notifier: Arc<ChangeNotifier>) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      detector,
      notifier,
      clock: Arc::new(SystemClock),
      default_ttl: Duration::seconds(DEFAULT_TTL_SECS),
      next_seq: AtomicU64::new(1),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Set the TTL used when callers do not pass one.
  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  pub fn detector(&self) -> &ChangeDetector {
    &self.detector
  }

  pub fn notifier(&self) -> &Arc<ChangeNotifier> {
    &self.notifier
  }

  pub fn get(&self, resource: &ResourceKey, subject: &SubjectId) -> Option<CacheEntry> {
    self.lock().get(&entry_key(resource, subject)).cloned()
  }

  /// Take a sequence ticket for a fetch that is about to start.
  pub fn begin_fetch(&self) -> u64 {
    self.next_seq.fetch_add(1, Ordering::SeqCst)
  }

  /// Replace the snapshot, notifying the subject about records that were
  /// not in the previous one.
  pub fn set(&self, resource: &ResourceKey, subject: &SubjectId, items: Vec<Record>) {
    let seq = self.begin_fetch();
    self.set_versioned(resource, subject, items, seq);
  }

  /// Replace the snapshot unless a newer fetch already wrote one.
  ///
  /// Returns `false` when the write was rejected as out of date.
  pub fn set_versioned(
    &self,
    resource: &ResourceKey,
    subject: &SubjectId,
    items: Vec<Record>,
    seq: u64,
  ) -> bool {
    let items = Arc::new(items);
    let now = self.clock.now();

    let previous = {
      let mut entries = self.lock();
      let key = entry_key(resource, subject);
      let previous = entries.get(&key).cloned();

      if let Some(prev) = &previous {
        if prev.seq > seq {
          tracing::debug!(
            %resource, %subject, seq, stored = prev.seq,
            "discarding snapshot from an older fetch"
          );
          return false;
        }
      }

      // fetched_at never moves backward, even if the clock does
      let fetched_at = previous
        .as_ref()
        .map_or(now, |prev| prev.fetched_at.max(now));

      entries.insert(
        key,
        CacheEntry {
          items: Arc::clone(&items),
          fetched_at,
          seq,
          invalidated: false,
        },
      );
      previous
    };

    tracing::debug!(%resource, %subject, count = items.len(), "cache snapshot stored");

    if let Some(prev) = previous {
      let added = self.detector.new_records(resource, &prev.items, &items);
      if !added.is_empty() {
        tracing::debug!(%resource, %subject, added = added.len(), "new records detected");
        self.notifier.notify(subject, resource, added);
      }
    }

    true
  }

  /// `now - fetched_at < ttl`; an absent entry is never fresh.
  pub fn is_fresh(&self, resource: &ResourceKey, subject: &SubjectId, ttl: Option<Duration>) -> bool {
    let ttl = ttl.unwrap_or(self.default_ttl);
    let now = self.clock.now();
    self
      .lock()
      .get(&entry_key(resource, subject))
      .is_some_and(|entry| entry.is_fresh(now, ttl))
  }

  pub fn metadata(
    &self,
    resource: &ResourceKey,
    subject: &SubjectId,
    ttl: Option<Duration>,
  ) -> Option<CacheMetadata> {
    let ttl = ttl.unwrap_or(self.default_ttl);
    let now = self.clock.now();
    self
      .lock()
      .get(&entry_key(resource, subject))
      .map(|entry| CacheMetadata {
        fetched_at: entry.fetched_at,
        age: entry.age(now),
        is_fresh: entry.is_fresh(now, ttl),
        count: entry.items.len(),
      })
  }

  /// Mark the snapshot stale without evicting it.
  pub fn invalidate(&self, resource: &ResourceKey, subject: &SubjectId) {
    if let Some(entry) = self.lock().get_mut(&entry_key(resource, subject)) {
      entry.invalidated = true;
    }
  }

  pub fn clear(&self, resource: &ResourceKey, subject: &SubjectId) {
    if self.lock().remove(&entry_key(resource, subject)).is_some() {
      tracing::debug!(%resource, %subject, "cache entry cleared");
    }
  }

  // Each critical section is a single insert, remove or flag flip, and no
  // caller code runs under the lock, so a poisoned map is still consistent.
  fn lock(&self) -> MutexGuard<'_, HashMap<EntryKey, CacheEntry>> {
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }
}

fn entry_key(resource: &ResourceKey, subject: &SubjectId) -> EntryKey {
  (resource.clone(), subject.clone())
}

impl Default for CacheStore {
  fn default() -> Self {
    Self::new(ChangeDetector::new(), Arc::new(ChangeNotifier::new()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;
  use crate::cache::detector::FieldPolicy;
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;

  fn store_with_clock() -> (CacheStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let detector = ChangeDetector::new()
      .with_strategy("tasks", FieldPolicy::default().with_business_key("id"));
    let store = CacheStore::new(detector, Arc::new(ChangeNotifier::new())).with_clock(clock.clone());
    (store, clock)
  }

  fn keys() -> (ResourceKey, SubjectId) {
    ("tasks".into(), "alice".into())
  }

  #[test]
  fn test_get_absent() {
    let (store, _) = store_with_clock();
    let (r, s) = keys();
    assert!(store.get(&r, &s).is_none());
    assert!(!store.is_fresh(&r, &s, None));
    assert!(store.metadata(&r, &s, None).is_none());
  }

  #[test]
  fn test_fresh_until_ttl_boundary() {
    let (store, clock) = store_with_clock();
    let (r, s) = keys();
    let ttl = Duration::minutes(10);

    store.set(&r, &s, vec![json!({"id": 1})]);

    clock.advance(Duration::minutes(10) - Duration::milliseconds(1));
    assert!(store.is_fresh(&r, &s, Some(ttl)));

    clock.advance(Duration::milliseconds(1));
    assert!(!store.is_fresh(&r, &s, Some(ttl)));
  }

  #[test]
  fn test_default_ttl_is_fifteen_minutes() {
    let (store, clock) = store_with_clock();
    let (r, s) = keys();

    store.set(&r, &s, vec![json!({"id": 1})]);
    clock.advance(Duration::minutes(14));
    assert!(store.is_fresh(&r, &s, None));
    clock.advance(Duration::minutes(1));
    assert!(!store.is_fresh(&r, &s, None));
  }

  #[test]
  fn test_freshness_evaluated_at_read_time() {
    let (store, clock) = store_with_clock();
    let (r, s) = keys();

    store.set(&r, &s, vec![json!({"id": 1})]);
    clock.advance(Duration::minutes(5));

    assert!(store.is_fresh(&r, &s, Some(Duration::minutes(6))));
    assert!(!store.is_fresh(&r, &s, Some(Duration::minutes(5))));
  }

  #[test]
  fn test_metadata() {
    let (store, clock) = store_with_clock();
    let (r, s) = keys();

    store.set(&r, &s, vec![json!({"id": 1}), json!({"id": 2})]);
    clock.advance(Duration::minutes(3));

    let meta = store.metadata(&r, &s, None).unwrap();
    assert_eq!(meta.count, 2);
    assert_eq!(meta.age, Duration::minutes(3));
    assert!(meta.is_fresh);
  }

  #[test]
  fn test_fetched_at_never_moves_backward() {
    let (store, clock) = store_with_clock();
    let (r, s) = keys();

    store.set(&r, &s, vec![json!({"id": 1})]);
    let first = store.get(&r, &s).unwrap().fetched_at;

    clock.advance(Duration::minutes(-30));
    store.set(&r, &s, vec![json!({"id": 2})]);

    assert_eq!(store.get(&r, &s).unwrap().fetched_at, first);
  }

  #[test]
  fn test_invalidate_keeps_items() {
    let (store, _) = store_with_clock();
    let (r, s) = keys();

    store.set(&r, &s, vec![json!({"id": 1})]);
    store.invalidate(&r, &s);

    assert!(!store.is_fresh(&r, &s, None));
    assert_eq!(store.get(&r, &s).unwrap().items.len(), 1);

    store.set(&r, &s, vec![json!({"id": 1})]);
    assert!(store.is_fresh(&r, &s, None));
  }

  #[test]
  fn test_clear() {
    let (store, _) = store_with_clock();
    let (r, s) = keys();

    store.set(&r, &s, vec![json!({"id": 1})]);
    store.clear(&r, &s);
    store.clear(&r, &s);

    assert!(store.get(&r, &s).is_none());
  }

  #[test]
  fn test_entries_scoped_per_subject() {
    let (store, _) = store_with_clock();
    let r: ResourceKey = "tasks".into();

    store.set(&r, &"alice".into(), vec![json!({"id": 1})]);

    assert!(store.get(&r, &"bob".into()).is_none());
    assert!(store.get(&"other".into(), &"alice".into()).is_none());
  }

  #[test]
  fn test_older_fetch_is_rejected() {
    let (store, _) = store_with_clock();
    let (r, s) = keys();

    let slow = store.begin_fetch();
    let fast = store.begin_fetch();

    assert!(store.set_versioned(&r, &s, vec![json!({"id": "fast"})], fast));
    assert!(!store.set_versioned(&r, &s, vec![json!({"id": "slow"})], slow));

    let entry = store.get(&r, &s).unwrap();
    assert_eq!(*entry.items, vec![json!({"id": "fast"})]);
  }

  #[test]
  fn test_identical_set_notifies_once() {
    let (store, _) = store_with_clock();
    let (r, s) = keys();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    store.notifier().subscribe(s.clone(), move |change| {
      assert_eq!(change.new_records, vec![json!({"id": 2})]);
      counter.fetch_add(1, Ordering::SeqCst);
    });

    store.set(&r, &s, vec![json!({"id": 1})]);
    // First write has no previous snapshot to compare against
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    let updated = vec![json!({"id": 1}), json!({"id": 2})];
    store.set(&r, &s, updated.clone());
    store.set(&r, &s, updated);

    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_callback_can_read_store() {
    let (store, _) = store_with_clock();
    let store = Arc::new(store);
    let (r, s) = keys();
    let seen = Arc::new(AtomicUsize::new(0));

    let reader = Arc::downgrade(&store);
    let counter = seen.clone();
    let (cr, cs) = (r.clone(), s.clone());
    store.notifier().subscribe(s.clone(), move |_| {
      if let Some(store) = reader.upgrade() {
        let count = store.get(&cr, &cs).map(|e| e.items.len()).unwrap_or(0);
        counter.store(count, Ordering::SeqCst);
      }
    });

    store.set(&r, &s, vec![json!({"id": 1})]);
    store.set(&r, &s, vec![json!({"id": 1}), json!({"id": 2})]);

    assert_eq!(seen.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_poisoned_lock_keeps_serving() {
    let (store, _) = store_with_clock();
    let store = Arc::new(store);
    let (r, s) = keys();
    store.set(&r, &s, vec![json!({"id": 1})]);

    let poisoner = store.clone();
    let _ = std::thread::spawn(move || {
      let _guard = poisoner.entries.lock().unwrap();
      panic!("poison the entry map");
    })
    .join();
    assert!(store.entries.is_poisoned());

    assert_eq!(store.get(&r, &s).unwrap().items.len(), 1);
    store.set(&r, &s, vec![json!({"id": 1}), json!({"id": 2})]);
    assert_eq!(store.get(&r, &s).unwrap().items.len(), 2);
  }

  #[test]
  fn test_panicking_subscriber_leaves_store_usable() {
    let (store, _) = store_with_clock();
    let (r, s) = keys();
    store.notifier().subscribe(s.clone(), |_| panic!("subscriber failed"));

    store.set(&r, &s, vec![json!({"id": 1})]);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
      store.set(&r, &s, vec![json!({"id": 1}), json!({"id": 2})]);
    }));
    assert!(result.is_err());

    // The snapshot was stored before the callback ran
    assert!(!store.entries.is_poisoned());
    assert_eq!(store.get(&r, &s).unwrap().items.len(), 2);
    assert!(store.is_fresh(&r, &s, None));
  }
}
