//! Record storage and consistency layer over a weak tabular store.
//!
//! The store underneath offers no transactions, no unique constraints and no
//! secondary indexes. This crate layers on top of it: an etag-validated cache
//! ([`CacheStore`]), a row-aligned secondary index ([`RecordIndex`]), the
//! versioned, deduplicated write path ([`SubmissionStore`]), paginated reads
//! ([`ListingReader`]) and repair of directly edited rows ([`Reconciler`]).
//!
//! Everything is synchronous; collaborators are injected as trait objects.

pub mod cache;
pub mod error;
pub mod etag;
pub mod index;
pub mod layout;
pub mod listing;
pub mod lock;
pub mod memory;
pub mod options;
pub mod reconcile;
pub mod submission;

use std::sync::Arc;

use formrow_core::{
  dedup::{DedupEvaluator, KeyedDedupEvaluator},
  store::{AdvisoryLock, KvCache, PropertyStore, TabularStore},
};

pub use self::{
  cache::CacheStore,
  error::{Error, Result},
  index::RecordIndex,
  listing::ListingReader,
  options::EngineOptions,
  reconcile::{ReconcileMode, ReconcileReport, Reconciler},
  submission::{SaveReceipt, SubmissionStore},
};

/// The external stores the engine runs against.
#[derive(Clone)]
pub struct Collaborators {
  pub tables:     Arc<dyn TabularStore>,
  pub cache:      Arc<dyn KvCache>,
  pub properties: Arc<dyn PropertyStore>,
  pub lock:       Arc<dyn AdvisoryLock>,
}

impl Collaborators {
  /// Fresh, isolated in-process stores.
  pub fn in_memory() -> Self {
    Self {
      tables:     Arc::new(memory::MemoryTables::default()),
      cache:      Arc::new(memory::MemoryCache::default()),
      properties: Arc::new(memory::MemoryProperties::default()),
      lock:       Arc::new(memory::MemoryLock::default()),
    }
  }

  /// Use one backend for all four roles.
  pub fn from_backend<B>(backend: Arc<B>) -> Self
  where
    B: TabularStore + KvCache + PropertyStore + AdvisoryLock + 'static,
  {
    Self {
      tables:     backend.clone(),
      cache:      backend.clone(),
      properties: backend.clone(),
      lock:       backend,
    }
  }
}

/// The write path, read path and reconciler wired to one set of
/// collaborators, sharing a cache and index.
#[derive(Clone)]
pub struct Engine {
  submissions: SubmissionStore,
  listing:     ListingReader,
  reconciler:  Reconciler,
  cache:       CacheStore,
}

impl Engine {
  pub fn new(
    collaborators: Collaborators,
    evaluator: Arc<dyn DedupEvaluator>,
    options: EngineOptions,
  ) -> Self {
    let Collaborators { tables, cache, properties, lock } = collaborators;
    let options = Arc::new(options);
    let cache = CacheStore::new(tables.clone(), cache, properties);
    let index = RecordIndex::new(tables.clone(), options.linear_scan_threshold);

    let reconciler = Reconciler::new(
      tables.clone(),
      lock.clone(),
      cache.clone(),
      index.clone(),
      evaluator.clone(),
      options.clone(),
    );
    let submissions = SubmissionStore::new(
      tables.clone(),
      lock,
      cache.clone(),
      index.clone(),
      evaluator,
      options.clone(),
    );
    let listing = ListingReader::new(tables, cache.clone(), index, reconciler.clone(), options);
    Self { submissions, listing, reconciler, cache }
  }

  /// An engine with the keyed dedup evaluator and default options.
  pub fn with_defaults(collaborators: Collaborators) -> Self {
    Self::new(collaborators, Arc::new(KeyedDedupEvaluator), EngineOptions::default())
  }

  pub fn submissions(&self) -> &SubmissionStore { &self.submissions }

  pub fn listing(&self) -> &ListingReader { &self.listing }

  pub fn reconciler(&self) -> &Reconciler { &self.reconciler }

  pub fn cache(&self) -> &CacheStore { &self.cache }
}

#[cfg(test)]
mod tests;
