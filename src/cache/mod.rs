//! Client-side data cache and refresh engine.
//!
//! This module provides a resource-agnostic caching mechanism that:
//! - Keeps one snapshot of rows per (resource, subject), replaced wholesale on each write
//! - Evaluates freshness lazily against a TTL
//! - Serves stale data when a fetch fails (stale-while-revalidate)
//! - Refreshes resources in the background on a fixed interval
//! - Detects newly appeared records between snapshots and notifies the subject

mod clock;
mod detector;
mod layer;
mod notifier;
mod scheduler;
mod store;
mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use detector::{
  fingerprint, new_records, ChangeDetector, FieldPolicy, Identity, IdentityStrategy, IdentityTier,
};
pub use layer::{CacheLayer, LoadOptions};
pub use notifier::{ChangeCallback, ChangeNotifier, ChangeSet};
pub use scheduler::{RefreshScheduler, DEFAULT_REFRESH_INTERVAL, MIN_REFRESH_INTERVAL};
pub use store::{CacheEntry, CacheMetadata, CacheStore, DEFAULT_TTL_SECS};
pub use traits::{CacheResult, CacheSource, Fetcher, Record, ResourceKey, SubjectId};
