//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// One opaque domain item (a task, a ticket, a spreadsheet row).
///
/// Records are value snapshots: the cache never mutates one in place.
pub type Record = serde_json::Value;

/// Logical dataset name, e.g. "delegation" or "fms".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(String);

impl ResourceKey {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ResourceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for ResourceKey {
  fn from(s: &str) -> Self {
    Self::new(s)
  }
}

impl From<String> for ResourceKey {
  fn from(s: String) -> Self {
    Self(s)
  }
}

/// The user or tenant a cached dataset is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectId(String);

impl SubjectId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for SubjectId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for SubjectId {
  fn from(s: &str) -> Self {
    Self::new(s)
  }
}

impl From<String> for SubjectId {
  fn from(s: String) -> Self {
    Self(s)
  }
}

/// Caller-supplied operation that produces the current rows of a resource.
///
/// Cheap to clone; the same fetcher is invoked once per load and once per
/// scheduled tick, so it must be safe to call repeatedly.
#[derive(Clone)]
pub struct Fetcher {
  inner: Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<Record>>> + Send + Sync>,
}

impl Fetcher {
  pub fn new<F, Fut>(f: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Record>>> + Send + 'static,
  {
    Self {
      inner: Arc::new(move || -> BoxFuture<'static, Result<Vec<Record>>> { Box::pin(f()) }),
    }
  }

  /// Start one fetch.
  pub fn fetch(&self) -> BoxFuture<'static, Result<Vec<Record>>> {
    (self.inner)()
  }
}

impl fmt::Debug for Fetcher {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Fetcher").finish_non_exhaustive()
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// Advisory error when stale data was served because a fetch failed
  pub error: Option<String>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
      error: None,
    }
  }

  /// Create a new cache result from a fresh cache hit.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
      error: None,
    }
  }

  /// Create a new cache result for offline mode: the fetch failed and the
  /// last good snapshot is served instead.
  pub fn offline(data: T, cached_at: DateTime<Utc>, error: impl Into<String>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
      error: Some(error.into()),
    }
  }

  /// True when the data is a fallback after a failed fetch.
  pub fn is_degraded(&self) -> bool {
    self.error.is_some()
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}
