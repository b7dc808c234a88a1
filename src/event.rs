use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::cache::{ChangeSet, Record, ResourceKey, SubjectId};

/// Dashboard events
#[derive(Debug, Clone)]
pub enum DashboardEvent {
  /// Cached data handed out while a fetch is still running
  Interim {
    resource: ResourceKey,
    subject: SubjectId,
    items: Arc<Vec<Record>>,
    fetched_at: DateTime<Utc>,
  },
  /// New records appeared in a resource
  Changed(ChangeSet),
}

/// Event channel shared by the cache layer, the change notifier and the app loop
pub struct EventHandler {
  tx: mpsc::UnboundedSender<DashboardEvent>,
  rx: mpsc::UnboundedReceiver<DashboardEvent>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// Get a sender for producing events
  pub fn sender(&self) -> mpsc::UnboundedSender<DashboardEvent> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<DashboardEvent> {
    self.rx.recv().await
  }
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}
