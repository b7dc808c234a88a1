//! Record identity and snapshot diffing.
//!
//! Every record gets a stable [`Identity`] from an [`IdentityStrategy`]. The
//! default strategy, [`FieldPolicy`], tries three rules in order:
//!
//! 1. an explicit business key field, used verbatim;
//! 2. a positional marker (e.g. sheet row) joined with a few distinguishing fields;
//! 3. a SHA-256 fingerprint of the whole serialized record.
//!
//! Identities are also the keys of the read-status store.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use super::traits::{Record, ResourceKey};

/// Which rule produced an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityTier {
  BusinessKey,
  Composite,
  Fingerprint,
}

/// Stable key for one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
  key: String,
  tier: IdentityTier,
}

impl Identity {
  pub fn new(key: impl Into<String>, tier: IdentityTier) -> Self {
    Self {
      key: key.into(),
      tier,
    }
  }

  pub fn as_str(&self) -> &str {
    &self.key
  }

  pub fn tier(&self) -> IdentityTier {
    self.tier
  }
}

impl fmt::Display for Identity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.key)
  }
}

/// Derives an identity for a record. One strategy per resource type.
pub trait IdentityStrategy: Send + Sync {
  fn identity(&self, record: &Record) -> Identity;
}

/// Field-driven three-tier identity policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FieldPolicy {
  /// Field holding a unique business key (ticket id, slip number)
  #[serde(default)]
  pub business_key: Option<String>,
  /// Field holding a stable positional marker (source row number)
  #[serde(default)]
  pub position_field: Option<String>,
  /// Fields joined with the positional marker to build a composite key
  #[serde(default)]
  pub fields: Vec<String>,
}

impl FieldPolicy {
  /// Policy that only ever fingerprints.
  pub fn fingerprint_only() -> Self {
    Self::default()
  }

  pub fn with_business_key(mut self, field: impl Into<String>) -> Self {
    self.business_key = Some(field.into());
    self
  }

  pub fn with_composite(mut self, position_field: impl Into<String>, fields: &[&str]) -> Self {
    self.position_field = Some(position_field.into());
    self.fields = fields.iter().map(|f| f.to_string()).collect();
    self
  }

  fn business_key(&self, record: &Record) -> Option<String> {
    let field = self.business_key.as_deref()?;
    scalar_field(record, field)
  }

  fn composite_key(&self, record: &Record) -> Option<String> {
    let position = scalar_field(record, self.position_field.as_deref()?)?;
    let mut parts = vec![position];
    parts.extend(
      self
        .fields
        .iter()
        .map(|f| scalar_field(record, f).unwrap_or_default()),
    );
    Some(parts.join("|"))
  }
}

impl IdentityStrategy for FieldPolicy {
  fn identity(&self, record: &Record) -> Identity {
    if let Some(key) = self.business_key(record) {
      return Identity::new(key, IdentityTier::BusinessKey);
    }
    if let Some(key) = self.composite_key(record) {
      return Identity::new(key, IdentityTier::Composite);
    }
    Identity::new(fingerprint(record), IdentityTier::Fingerprint)
  }
}

/// Read a non-empty scalar field as a string.
fn scalar_field(record: &Record, field: &str) -> Option<String> {
  match record.get(field)? {
    serde_json::Value::String(s) => {
      let s = s.trim();
      (!s.is_empty()).then(|| s.to_string())
    }
    serde_json::Value::Number(n) => Some(n.to_string()),
    serde_json::Value::Bool(b) => Some(b.to_string()),
    _ => None,
  }
}

/// Deterministic content hash of a record.
///
/// `serde_json::Map` keeps keys sorted, so equal values serialize identically
/// regardless of the field order they arrived in.
pub fn fingerprint(record: &Record) -> String {
  let mut hasher = Sha256::new();
  hasher.update(record.to_string().as_bytes());
  hex::encode(hasher.finalize())
}

/// Return the records of `new` whose identity does not appear in `old`.
///
/// Keeps `new`'s order and reports each identity at most once. Neither input
/// is modified.
pub fn new_records(strategy: &dyn IdentityStrategy, old: &[Record], new: &[Record]) -> Vec<Record> {
  let known: HashSet<Identity> = old.iter().map(|r| strategy.identity(r)).collect();
  let mut reported = HashSet::new();

  new
    .iter()
    .filter(|r| {
      let id = strategy.identity(r);
      !known.contains(&id) && reported.insert(id)
    })
    .cloned()
    .collect()
}

/// Holds the identity strategy for each resource and diffs snapshots with it.
#[derive(Clone)]
pub struct ChangeDetector {
  strategies: HashMap<ResourceKey, Arc<dyn IdentityStrategy>>,
  fallback: Arc<dyn IdentityStrategy>,
}

impl ChangeDetector {
  /// Detector where every resource falls back to content fingerprints.
  pub fn new() -> Self {
    Self {
      strategies: HashMap::new(),
      fallback: Arc::new(FieldPolicy::fingerprint_only()),
    }
  }

  /// Register the identity strategy for one resource.
  pub fn with_strategy(
    mut self,
    resource: impl Into<ResourceKey>,
    strategy: impl IdentityStrategy + 'static,
  ) -> Self {
    self.strategies.insert(resource.into(), Arc::new(strategy));
    self
  }

  pub fn strategy(&self, resource: &ResourceKey) -> &dyn IdentityStrategy {
    match self.strategies.get(resource) {
      Some(strategy) => strategy.as_ref(),
      None => self.fallback.as_ref(),
    }
  }

  pub fn identity(&self, resource: &ResourceKey, record: &Record) -> Identity {
    self.strategy(resource).identity(record)
  }

  pub fn new_records(&self, resource: &ResourceKey, old: &[Record], new: &[Record]) -> Vec<Record> {
    new_records(self.strategy(resource), old, new)
  }
}

impl Default for ChangeDetector {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for ChangeDetector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ChangeDetector")
      .field("resources", &self.strategies.keys().collect::<Vec<_>>())
      .finish_non_exhaustive()
  }
}
