//! Background refresh on a fixed interval, one task per (resource, subject).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use super::layer::{CacheLayer, LoadOptions};
use super::traits::{Fetcher, ResourceKey, SubjectId};

/// Default refresh interval.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Shortest interval a schedule runs at; shorter requests are raised to it.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(1);

/// One scheduled background task.
struct Registration {
  interval: Duration,
  /// Cleared on stop; checked before every tick's fetch
  live: Arc<AtomicBool>,
  handle: JoinHandle<()>,
}

impl Registration {
  fn cancel(self) {
    self.live.store(false, Ordering::SeqCst);
    self.handle.abort();
  }
}

/// Registry of cancellable periodic refresh tasks.
///
/// Each tick runs a forced, silent [`CacheLayer::load`]. Tick failures are
/// logged and never stop the schedule.
pub struct RefreshScheduler {
  layer: CacheLayer,
  timeout: Option<Duration>,
  registrations: Mutex<HashMap<(ResourceKey, SubjectId), Registration>>,
}

impl RefreshScheduler {
  pub fn new(layer: CacheLayer) -> Self {
    Self {
      layer,
      timeout: None,
      registrations: Mutex::new(HashMap::new()),
    }
  }

  /// Deadline applied to each scheduled fetch.
  pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  /// Start refreshing `resource` for `subject` every `interval`.
  ///
  /// A schedule already running for the same pair is cancelled first. The
  /// first tick fires one interval after this call; intervals below
  /// [`MIN_REFRESH_INTERVAL`] are raised to it. Must be called from within a
  /// tokio runtime.
  pub fn start(&self, resource: ResourceKey, subject: SubjectId, fetcher: Fetcher, interval: Duration) {
    if interval < MIN_REFRESH_INTERVAL {
      tracing::warn!(%resource, %subject, ?interval, "refresh interval too short, clamping");
    }
    let interval = interval.max(MIN_REFRESH_INTERVAL);
    let key = (resource.clone(), subject.clone());
    let mut registrations = self.lock();

    if let Some(previous) = registrations.remove(&key) {
      tracing::debug!(%resource, %subject, "replacing running refresh schedule");
      previous.cancel();
    }

    let live = Arc::new(AtomicBool::new(true));
    let handle = tokio::spawn(refresh_loop(
      self.layer.clone(),
      resource.clone(),
      subject.clone(),
      fetcher,
      interval,
      self.timeout,
      Arc::clone(&live),
    ));

    registrations.insert(
      key,
      Registration {
        interval,
        live,
        handle,
      },
    );
    tracing::info!(%resource, %subject, ?interval, "background refresh started");
  }

  /// Stop the schedule for this pair. Stopping an unknown pair is a no-op.
  ///
  /// No fetch is started after this returns; one already in flight may still
  /// complete and write to the cache.
  pub fn stop(&self, resource: &ResourceKey, subject: &SubjectId) {
    let removed = self.lock().remove(&(resource.clone(), subject.clone()));
    if let Some(registration) = removed {
      registration.cancel();
      tracing::info!(%resource, %subject, "background refresh stopped");
    }
  }

  pub fn stop_all(&self) {
    let drained: Vec<_> = self.lock().drain().collect();
    for ((resource, subject), registration) in drained {
      registration.cancel();
      tracing::debug!(%resource, %subject, "background refresh stopped");
    }
  }

  /// True while a registration exists and its task is still alive.
  pub fn is_running(&self, resource: &ResourceKey, subject: &SubjectId) -> bool {
    self
      .lock()
      .get(&(resource.clone(), subject.clone()))
      .is_some_and(|r| !r.handle.is_finished())
  }

  /// Interval of a running schedule.
  pub fn interval(&self, resource: &ResourceKey, subject: &SubjectId) -> Option<Duration> {
    self
      .lock()
      .get(&(resource.clone(), subject.clone()))
      .map(|r| r.interval)
  }

  pub fn active_count(&self) -> usize {
    self.lock().len()
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<(ResourceKey, SubjectId), Registration>> {
    self.registrations.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl Drop for RefreshScheduler {
  fn drop(&mut self) {
    self.stop_all();
  }
}

async fn refresh_loop(
  layer: CacheLayer,
  resource: ResourceKey,
  subject: SubjectId,
  fetcher: Fetcher,
  interval: Duration,
  timeout: Option<Duration>,
  live: Arc<AtomicBool>,
) {
  let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    ticker.tick().await;
    if !live.load(Ordering::SeqCst) {
      break;
    }

    let mut options = LoadOptions::background();
    options.timeout = timeout;

    match layer.load(&resource, &subject, &fetcher, options).await {
      Ok(result) => match result.error {
        Some(error) => {
          tracing::warn!(%resource, %subject, %error, "scheduled refresh failed, keeping cached data")
        }
        None => tracing::debug!(%resource, %subject, count = result.data.len(), "scheduled refresh"),
      },
      Err(e) => tracing::warn!(%resource, %subject, error = %e, "scheduled refresh failed"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::store::CacheStore;
  use crate::cache::traits::Record;
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;

  const TICK: Duration = Duration::from_secs(60);

  fn scheduler() -> (RefreshScheduler, Arc<CacheStore>) {
    let store = Arc::new(CacheStore::default());
    (RefreshScheduler::new(CacheLayer::new(store.clone())), store)
  }

  fn counting_fetcher() -> (Fetcher, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let fetcher = Fetcher::new(move || {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      async move { Ok::<_, color_eyre::Report>(vec![json!({"tick": n})]) }
    });
    (fetcher, calls)
  }

  fn keys() -> (ResourceKey, SubjectId) {
    ("fms".into(), "alice".into())
  }

  #[tokio::test(start_paused = true)]
  async fn test_ticks_refresh_the_cache() {
    let (scheduler, store) = scheduler();
    let (r, s) = keys();
    let (fetcher, calls) = counting_fetcher();

    scheduler.start(r.clone(), s.clone(), fetcher, TICK);
    time::sleep(TICK / 2).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    time::sleep(TICK * 2).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(*store.get(&r, &s).unwrap().items, vec![json!({"tick": 1})]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_start_twice_keeps_one_timer() {
    let (scheduler, _) = scheduler();
    let (r, s) = keys();
    let (fetcher, calls) = counting_fetcher();

    scheduler.start(r.clone(), s.clone(), fetcher.clone(), TICK);
    scheduler.start(r.clone(), s.clone(), fetcher, TICK);
    time::sleep(TICK * 2 + TICK / 2).await;

    assert_eq!(scheduler.active_count(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_stops() {
    let (scheduler, _) = scheduler();
    let (r, s) = keys();
    let (fetcher, calls) = counting_fetcher();

    scheduler.start(r.clone(), s.clone(), fetcher, TICK);
    time::sleep(TICK + TICK / 2).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    scheduler.stop(&r, &s);
    assert!(!scheduler.is_running(&r, &s));
    time::sleep(TICK * 10).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_zero_interval_is_clamped() {
    let (scheduler, _) = scheduler();
    let (r, s) = keys();
    let (fetcher, calls) = counting_fetcher();

    scheduler.start(r.clone(), s.clone(), fetcher, Duration::ZERO);
    time::sleep(Duration::from_millis(10)).await;

    assert!(scheduler.is_running(&r, &s));
    assert_eq!(scheduler.interval(&r, &s), Some(MIN_REFRESH_INTERVAL));
    assert!(calls.load(Ordering::SeqCst) >= 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_during_scheduled_fetch() {
    let (scheduler, _) = scheduler();
    let (r, s) = keys();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let fetcher = Fetcher::new(move || {
      counter.fetch_add(1, Ordering::SeqCst);
      async {
        time::sleep(Duration::from_secs(30)).await;
        Ok::<_, color_eyre::Report>(vec![json!({"id": 1})])
      }
    });

    scheduler.start(r.clone(), s.clone(), fetcher, TICK);
    // First tick fired, its fetch is still running
    time::sleep(TICK + Duration::from_secs(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    scheduler.stop(&r, &s);
    time::sleep(TICK * 10).await;

    assert!(!scheduler.is_running(&r, &s));
    assert_eq!(scheduler.active_count(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_in_flight_load_completes_after_stop() {
    let (scheduler, store) = scheduler();
    let (r, s) = keys();
    let (fetcher, calls) = counting_fetcher();
    let slow = Fetcher::new(|| async {
      time::sleep(Duration::from_secs(30)).await;
      Ok::<_, color_eyre::Report>(vec![json!({"id": "late"})])
    });

    scheduler.start(r.clone(), s.clone(), fetcher, TICK);
    let layer = scheduler.layer.clone();
    let (lr, ls) = (r.clone(), s.clone());
    let in_flight =
      tokio::spawn(async move { layer.load(&lr, &ls, &slow, LoadOptions::force()).await });
    time::sleep(Duration::from_secs(1)).await;

    scheduler.stop(&r, &s);
    in_flight.await.unwrap().unwrap();

    // The late write lands, but the schedule stays stopped
    assert_eq!(*store.get(&r, &s).unwrap().items, vec![json!({"id": "late"})]);
    time::sleep(TICK * 5).await;
    assert!(!scheduler.is_running(&r, &s));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_stop_unknown_is_noop() {
    let (scheduler, _) = scheduler();
    let (r, s) = keys();

    scheduler.stop(&r, &s);
    assert_eq!(scheduler.active_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_tick_does_not_stop_schedule() {
    let (scheduler, _) = scheduler();
    let (r, s) = keys();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let fetcher = Fetcher::new(move || {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      async move {
        if n == 0 {
          Err(eyre!("spreadsheet quota exceeded"))
        } else {
          Ok::<Vec<Record>, color_eyre::Report>(Vec::new())
        }
      }
    });

    scheduler.start(r.clone(), s.clone(), fetcher, TICK);
    time::sleep(TICK * 3 + TICK / 2).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_schedules_are_independent() {
    let (scheduler, _) = scheduler();
    let (fetcher, calls) = counting_fetcher();

    scheduler.start("fms".into(), "alice".into(), fetcher.clone(), TICK);
    scheduler.start("fms".into(), "bob".into(), fetcher, TICK);
    scheduler.stop(&"fms".into(), &"alice".into());
    time::sleep(TICK * 2 + TICK / 2).await;

    assert_eq!(scheduler.active_count(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }
}
