//! Cache layer that orchestrates caching logic with network fetching.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::store::CacheStore;
use super::traits::{CacheResult, Fetcher, Record, ResourceKey, SubjectId};
use crate::event::DashboardEvent;

/// Per-call knobs for [`CacheLayer::load`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
  /// Skip the freshness check and always fetch
  pub force_refresh: bool,
  /// Do not hand out interim cached data while fetching
  pub silent: bool,
  /// Freshness window; the store's default when `None`
  pub ttl: Option<Duration>,
  /// Give up on the fetcher after this long
  pub timeout: Option<std::time::Duration>,
}

impl LoadOptions {
  /// Options for a user-initiated refresh.
  pub fn force() -> Self {
    Self {
      force_refresh: true,
      ..Self::default()
    }
  }

  /// Options for a scheduled refresh: forced and silent.
  pub fn background() -> Self {
    Self {
      force_refresh: true,
      silent: true,
      ..Self::default()
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

/// Cache layer that manages caching logic and network fetching.
///
/// Sits between callers and their fetchers and implements
/// stale-while-revalidate on top of a [`CacheStore`].
#[derive(Clone)]
pub struct CacheLayer {
  store: Arc<CacheStore>,
  events: Option<mpsc::UnboundedSender<DashboardEvent>>,
}

impl CacheLayer {
  /// Create a new cache layer over the given store.
  pub fn new(store: Arc<CacheStore>) -> Self {
    Self {
      store,
      events: None,
    }
  }

  /// Send interim cached results to this channel while fetches run.
  pub fn with_events(mut self, tx: mpsc::UnboundedSender<DashboardEvent>) -> Self {
    self.events = Some(tx);
    self
  }

  pub fn store(&self) -> &Arc<CacheStore> {
    &self.store
  }

  /// Load a resource with a cache-first strategy.
  ///
  /// 1. Fresh cache and no forced refresh: return it, the fetcher is not called
  /// 2. Otherwise publish whatever is cached as an interim result (unless silent)
  /// 3. Fetch; on success store and return the new rows
  /// 4. On failure return the stale snapshot with an advisory error, or fail
  ///    outright when nothing is cached
  pub async fn load(
    &self,
    resource: &ResourceKey,
    subject: &SubjectId,
    fetcher: &Fetcher,
    options: LoadOptions,
  ) -> Result<CacheResult<Vec<Record>>> {
    let ttl = options.ttl.unwrap_or(self.store.default_ttl());
    let cached = self.store.get(resource, subject);

    if !options.force_refresh {
      if let Some(entry) = &cached {
        if entry.is_fresh(self.store.now(), ttl) {
          tracing::debug!(%resource, %subject, "cache hit");
          return Ok(CacheResult::from_cache(
            entry.items.to_vec(),
            entry.fetched_at,
          ));
        }
      }
    } else {
      // Nobody should be served the pre-refresh snapshot as fresh from here on
      self.store.invalidate(resource, subject);
    }

    if !options.silent {
      if let (Some(entry), Some(tx)) = (&cached, &self.events) {
        let _ = tx.send(DashboardEvent::Interim {
          resource: resource.clone(),
          subject: subject.clone(),
          items: Arc::clone(&entry.items),
          fetched_at: entry.fetched_at,
        });
      }
    }

    let seq = self.store.begin_fetch();
    match self.run_fetcher(fetcher, options.timeout).await {
      Ok(items) => {
        if self
          .store
          .set_versioned(resource, subject, items.clone(), seq)
        {
          return Ok(CacheResult::from_network(items));
        }

        // A fetch that started later already wrote; serve its snapshot instead
        tracing::debug!(%resource, %subject, "newer snapshot already stored");
        match self.store.get(resource, subject) {
          Some(entry) => Ok(CacheResult::from_cache(entry.items.to_vec(), entry.fetched_at)),
          None => Ok(CacheResult::from_network(items)),
        }
      }
      Err(e) => match cached {
        Some(entry) => {
          tracing::warn!(%resource, %subject, error = %e, "fetch failed, serving stale cache");
          Ok(CacheResult::offline(
            entry.items.to_vec(),
            entry.fetched_at,
            e.to_string(),
          ))
        }
        None => {
          tracing::warn!(%resource, %subject, error = %e, "fetch failed with nothing cached");
          Err(e.wrap_err(format!("Failed to load {} for {}", resource, subject)))
        }
      },
    }
  }

  async fn run_fetcher(
    &self,
    fetcher: &Fetcher,
    timeout: Option<std::time::Duration>,
  ) -> Result<Vec<Record>> {
    match timeout {
      Some(limit) => tokio::time::timeout(limit, fetcher.fetch())
        .await
        .map_err(|_| eyre!("Fetch timed out after {:?}", limit))?,
      None => fetcher.fetch().await,
    }
  }
}
