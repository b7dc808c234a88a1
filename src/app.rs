use color_eyre::Result;
use serde::Serialize;
use std::sync::Arc;

use crate::cache::{
  CacheLayer, CacheResult, CacheStore, ChangeDetector, ChangeNotifier, ChangeSet, LoadOptions,
  Record, RefreshScheduler, ResourceKey, SubjectId,
};
use crate::config::Config;
use crate::event::{DashboardEvent, EventHandler};
use crate::read_status::ReadStatusStore;
use crate::sheets::SheetsClient;

/// One row as presented to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowView {
  pub identity: String,
  pub unread: bool,
  pub row: Record,
}

/// Main application state
pub struct App {
  /// Application configuration
  config: Config,

  /// Whose tasks are shown
  subject: SubjectId,

  /// Spreadsheet API client
  client: SheetsClient,

  /// Cache layer shared with the scheduler
  layer: CacheLayer,

  /// Background refresh tasks
  scheduler: RefreshScheduler,

  notifier: Arc<ChangeNotifier>,

  read_status: Box<dyn ReadStatusStore>,

  /// Events from the cache and notifier
  events: EventHandler,
}

impl App {
  pub fn new(config: Config, subject: SubjectId, read_status: Box<dyn ReadStatusStore>) -> Result<Self> {
    let client = SheetsClient::new(&config)?;

    let detector = config
      .resources
      .iter()
      .fold(ChangeDetector::new(), |detector, resource| {
        detector.with_strategy(resource.name.as_str(), resource.identity.clone())
      });

    let notifier = Arc::new(ChangeNotifier::new());
    let store = CacheStore::new(detector, Arc::clone(&notifier)).with_default_ttl(config.cache.ttl());

    let events = EventHandler::new();
    let layer = CacheLayer::new(Arc::new(store)).with_events(events.sender());

    let mut scheduler = RefreshScheduler::new(layer.clone());
    if let Some(timeout) = config.cache.fetch_timeout() {
      scheduler = scheduler.with_fetch_timeout(timeout);
    }

    let tx = events.sender();
    notifier.subscribe(subject.clone(), move |change: &ChangeSet| {
      let _ = tx.send(DashboardEvent::Changed(change.clone()));
    });

    Ok(Self {
      config,
      subject,
      client,
      layer,
      scheduler,
      notifier,
      read_status,
      events,
    })
  }

  pub fn subject(&self) -> &SubjectId {
    &self.subject
  }

  pub fn layer(&self) -> &CacheLayer {
    &self.layer
  }

  fn load_options(&self, force_refresh: bool) -> LoadOptions {
    let mut options = LoadOptions {
      force_refresh,
      ..LoadOptions::default()
    };
    options.timeout = self.config.cache.fetch_timeout();
    options
  }

  /// Load a configured resource through the cache.
  pub async fn load(&self, name: &str, force_refresh: bool) -> Result<CacheResult<Vec<Record>>> {
    let resource = ResourceKey::new(self.config.resource(name)?.name.clone());
    let fetcher = self.client.fetcher(&resource, &self.subject);
    self
      .layer
      .load(&resource, &self.subject, &fetcher, self.load_options(force_refresh))
      .await
  }

  /// Pair each record with its identity and read state.
  pub fn annotate(&self, resource: &ResourceKey, records: &[Record]) -> Result<Vec<RowView>> {
    let read = self
      .read_status
      .read_identities(self.subject.as_str(), resource.as_str())?;
    let detector = self.layer.store().detector();

    Ok(
      records
        .iter()
        .map(|record| {
          let identity = detector.identity(resource, record).to_string();
          RowView {
            unread: !read.contains(&identity),
            identity,
            row: record.clone(),
          }
        })
        .collect(),
    )
  }

  /// Print a resource's rows as JSON lines.
  pub async fn show(&self, name: &str, refresh: bool) -> Result<()> {
    let result = self.load(name, refresh).await?;
    let resource = ResourceKey::new(name);

    for view in self.annotate(&resource, &result.data)? {
      println!("{}", serde_json::to_string(&view)?);
    }

    if let Some(error) = &result.error {
      eprintln!("warning: showing cached data, refresh failed: {}", error);
    }
    if let Some(meta) = self.layer.store().metadata(&resource, &self.subject, None) {
      eprintln!(
        "{} rows, fetched {} ({:?})",
        meta.count,
        meta.fetched_at.format("%Y-%m-%d %H:%M:%S"),
        result.source
      );
    }
    Ok(())
  }

  /// Mark rows read; every current row when `identities` is empty.
  pub async fn mark_read(&self, name: &str, identities: Vec<String>) -> Result<usize> {
    self.config.resource(name)?;
    let identities = if identities.is_empty() {
      let result = self.load(name, false).await?;
      self
        .annotate(&ResourceKey::new(name), &result.data)?
        .into_iter()
        .filter(|view| view.unread)
        .map(|view| view.identity)
        .collect()
    } else {
      identities
    };

    self
      .read_status
      .mark_read(self.subject.as_str(), name, &identities)?;
    Ok(identities.len())
  }

  pub fn mark_unread(&self, name: &str, identity: &str) -> Result<()> {
    self.config.resource(name)?;
    self
      .read_status
      .mark_unread(self.subject.as_str(), name, identity)
  }

  /// Load every resource, keep them refreshed in the background and report
  /// new records until Ctrl-C.
  pub async fn watch(&mut self) -> Result<()> {
    let interval = self.config.cache.refresh_interval();
    let names: Vec<String> = self.config.resources.iter().map(|r| r.name.clone()).collect();

    for name in &names {
      match self.load(name, false).await {
        Ok(result) => {
          let unread = self.unread_count(name, &result.data)?;
          println!("{}: {} rows, {} unread", name, result.data.len(), unread);
        }
        Err(e) => tracing::warn!(resource = %name, error = %e, "initial load failed"),
      }

      let resource = ResourceKey::new(name.as_str());
      let fetcher = self.client.fetcher(&resource, &self.subject);
      self
        .scheduler
        .start(resource, self.subject.clone(), fetcher, interval);
    }

    loop {
      tokio::select! {
        event = self.events.next() => match event {
          Some(event) => self.handle_event(event)?,
          None => break,
        },
        _ = tokio::signal::ctrl_c() => break,
      }
    }

    self.scheduler.stop_all();
    self.notifier.unsubscribe(&self.subject);
    Ok(())
  }

  fn handle_event(&self, event: DashboardEvent) -> Result<()> {
    match event {
      DashboardEvent::Interim {
        resource, items, ..
      } => {
        tracing::debug!(%resource, count = items.len(), "serving cached rows while refreshing");
      }
      DashboardEvent::Changed(change) => {
        let current = self
          .layer
          .store()
          .get(&change.resource, &change.subject)
          .map(|entry| entry.items)
          .unwrap_or_default();
        let unread = self.unread_count(change.resource.as_str(), &current)?;
        println!(
          "{}: {} new, {} unread",
          change.resource,
          change.new_records.len(),
          unread
        );
      }
    }
    Ok(())
  }

  fn unread_count(&self, name: &str, records: &[Record]) -> Result<usize> {
    Ok(
      self
        .annotate(&ResourceKey::new(name), records)?
        .iter()
        .filter(|view| view.unread)
        .count(),
    )
  }
}
