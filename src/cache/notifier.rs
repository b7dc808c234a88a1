//! Per-subject change notifications.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use super::traits::{Record, ResourceKey, SubjectId};

/// Records that appeared in a resource since its previous snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
  pub subject: SubjectId,
  pub resource: ResourceKey,
  pub new_records: Vec<Record>,
}

/// Callback invoked with each non-empty change set.
pub type ChangeCallback = Arc<dyn Fn(&ChangeSet) + Send + Sync>;

/// Holds at most one subscription per subject.
///
/// Subscribing again for the same subject replaces the previous callback.
#[derive(Default)]
pub struct ChangeNotifier {
  subscribers: Mutex<HashMap<SubjectId, ChangeCallback>>,
}

impl ChangeNotifier {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn subscribe<F>(&self, subject: impl Into<SubjectId>, callback: F)
  where
    F: Fn(&ChangeSet) + Send + Sync + 'static,
  {
    let subject = subject.into();
    let replaced = self
      .lock()
      .insert(subject.clone(), Arc::new(callback))
      .is_some();
    tracing::debug!(%subject, replaced, "change subscription registered");
  }

  /// Remove the subscription for `subject`. Unknown subjects are ignored.
  pub fn unsubscribe(&self, subject: &SubjectId) {
    if self.lock().remove(subject).is_some() {
      tracing::debug!(%subject, "change subscription removed");
    }
  }

  pub fn is_subscribed(&self, subject: &SubjectId) -> bool {
    self.lock().contains_key(subject)
  }

  /// Deliver new records to the subject's subscriber, if any.
  ///
  /// The callback runs after the internal lock is released, so it may
  /// subscribe, unsubscribe or read the cache.
  pub(crate) fn notify(&self, subject: &SubjectId, resource: &ResourceKey, new_records: Vec<Record>) {
    if new_records.is_empty() {
      return;
    }

    let callback = self.lock().get(subject).cloned();
    let Some(callback) = callback else {
      tracing::trace!(%subject, %resource, "no subscriber for change set");
      return;
    };

    let change = ChangeSet {
      subject: subject.clone(),
      resource: resource.clone(),
      new_records,
    };
    callback(&change);
  }

  // Callbacks are invoked after the guard drops, so poisoning can't leave
  // the map half-updated.
  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubjectId, ChangeCallback>> {
    self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl fmt::Debug for ChangeNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ChangeNotifier")
      .field("subjects", &self.lock().keys().cloned().collect::<Vec<_>>())
      .finish()
  }
}
