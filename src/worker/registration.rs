//! The registration owns which worker version controls routing.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{ActivationReport, CacheWorker, InstallReport, WorkerRecord, WorkerSlot, WorkerSpec, WorkerState};
use crate::cache::{BucketStorage, BucketSummary, RouteResult};
use crate::net::Fetcher;
use crate::request::Request;

/// Snapshot of the registration and its buckets.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
  pub active: Option<WorkerRecord>,
  pub pending: Option<WorkerRecord>,
  pub buckets: Vec<BucketSummary>,
}

/// Holds the active worker (the one routing requests) and at most one
/// installed worker waiting to replace it.
///
/// Routing holds a shared lock for the whole retrieval; activation takes it
/// exclusively while purging stale buckets and swapping workers, so no
/// request is ever served from two bucket versions.
pub struct Registration<S: BucketStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  active: RwLock<Option<Arc<CacheWorker<S, F>>>>,
  pending: Mutex<Option<Arc<CacheWorker<S, F>>>>,
  /// Write-through cap for workers rebuilt from persisted records
  max_runtime_entries: Option<usize>,
}

impl<S: BucketStorage, F: Fetcher> Registration<S, F> {
  /// Registration with no worker at all.
  pub fn new(storage: Arc<S>, fetcher: Arc<F>) -> Self {
    Self {
      storage,
      fetcher,
      active: RwLock::new(None),
      pending: Mutex::new(None),
      max_runtime_entries: None,
    }
  }

  /// Resume from the worker records persisted by a previous run.
  ///
  /// `max_runtime_entries` caps write-through for restored workers, whose
  /// spec is not persisted.
  pub fn restore(storage: Arc<S>, fetcher: Arc<F>, max_runtime_entries: Option<usize>) -> Result<Self> {
    let mut active = None;
    if let Some(record) = storage.load_worker(WorkerSlot::Active)? {
      let worker = CacheWorker::from_record(
        &record,
        Arc::clone(&storage),
        Arc::clone(&fetcher),
        max_runtime_entries,
      )?;
      info!(bucket = %record.bucket, "restored active worker");
      active = Some(Arc::new(worker));
    }

    let mut pending = None;
    if let Some(record) = storage.load_worker(WorkerSlot::Pending)? {
      match record.state {
        WorkerState::Waiting => {
          let worker = CacheWorker::from_record(
            &record,
            Arc::clone(&storage),
            Arc::clone(&fetcher),
            max_runtime_entries,
          )?;
          info!(bucket = %record.bucket, "restored worker waiting to activate");
          pending = Some(Arc::new(worker));
        }
        WorkerState::Installing => {
          warn!(bucket = %record.bucket, "previous install was interrupted");
          storage.save_worker(
            WorkerSlot::Pending,
            &WorkerRecord {
              state: WorkerState::Redundant,
              ..record
            },
          )?;
        }
        WorkerState::Active | WorkerState::Redundant => {}
      }
    }

    let mut registration = Self::new(storage, fetcher);
    *registration.active.get_mut() = active;
    *registration.pending.get_mut() = pending;
    registration.max_runtime_entries = max_runtime_entries;
    Ok(registration)
  }

  /// Install a worker version. On success it waits to activate, or activates
  /// right away when `skip_waiting` is set. On failure the active version,
  /// if any, keeps routing untouched.
  ///
  /// If `spec` is already the active version with the same manifest nothing
  /// is fetched, unless `force` is set.
  pub async fn install(&self, spec: &WorkerSpec, force: bool) -> Result<InstallReport> {
    let worker = Arc::new(CacheWorker::new(
      spec,
      Arc::clone(&self.storage),
      Arc::clone(&self.fetcher),
    ));
    let bucket = worker.bucket().to_string();

    if let Some(active) = self.active.read().await.as_ref() {
      if active.bucket() == bucket {
        if active.manifest_digest() != worker.manifest_digest() {
          warn!(
            bucket = %bucket,
            "manifest changed but the bucket name did not; bump the cache version"
          );
        } else if !force {
          info!(bucket = %bucket, "already active and up to date");
          return Ok(InstallReport {
            bucket,
            state: WorkerState::Active,
            stored: 0,
            skipped: Vec::new(),
            up_to_date: true,
            activation: None,
          });
        }
      }
    }

    if let Some(previous) = self.pending.lock().await.take() {
      info!(bucket = %previous.bucket(), "waiting worker superseded by a new install");
    }

    self
      .storage
      .save_worker(WorkerSlot::Pending, &worker.record(WorkerState::Installing))?;
    info!(bucket = %bucket, "installing");

    let mut report = match worker.install().await {
      Ok(report) => report,
      Err(e) => {
        self
          .storage
          .save_worker(WorkerSlot::Pending, &worker.record(WorkerState::Redundant))?;
        warn!(bucket = %bucket, error = %e, "install failed");
        return Err(e);
      }
    };

    self
      .storage
      .save_worker(WorkerSlot::Pending, &worker.record(WorkerState::Waiting))?;
    *self.pending.lock().await = Some(worker);
    info!(bucket = %bucket, "waiting to activate");

    if spec.skip_waiting {
      report.activation = Some(self.activate().await?);
      report.state = WorkerState::Active;
    }

    Ok(report)
  }

  /// Activate the waiting worker: purge every other bucket, then make it the
  /// worker that routes all subsequent requests. With nothing waiting, the
  /// active worker's purge is re-run, so activation is idempotent.
  pub async fn activate(&self) -> Result<ActivationReport> {
    let next = self.pending.lock().await.take();
    let mut active = self.active.write().await;

    let worker = match next {
      Some(worker) => worker,
      None => {
        return match active.as_ref() {
          Some(current) => current.purge_stale_buckets(),
          None => Err(eyre!("No installed worker is waiting to activate")),
        };
      }
    };

    let report = worker.purge_stale_buckets()?;

    if let Some(previous) = active.as_ref() {
      if previous.bucket() != worker.bucket() {
        info!(bucket = %previous.bucket(), "previous worker is now redundant");
      }
    }

    self
      .storage
      .save_worker(WorkerSlot::Active, &worker.record(WorkerState::Active))?;
    self.storage.clear_worker(WorkerSlot::Pending)?;
    info!(
      bucket = %worker.bucket(),
      purged = report.purged.len(),
      "activated"
    );
    *active = Some(worker);

    Ok(report)
  }

  /// Route a request through the active worker. Without one, requests go
  /// straight to the network and network errors are returned as-is.
  pub async fn route(&self, request: &Request) -> Result<RouteResult> {
    self.follow_persisted_active().await;

    let active = self.active.read().await;
    match active.as_ref() {
      Some(worker) => Ok(worker.route(request).await),
      None => {
        debug!(url = %request.url, "no active worker, fetching directly");
        let response = self.fetcher.fetch(request).await?;
        Ok(RouteResult::from_network(response))
      }
    }
  }

  /// Another process sharing the storage may have activated a newer version
  /// and purged this one's bucket. Switch to the persisted active worker when
  /// it differs from ours. Storage errors leave the current worker in place.
  async fn follow_persisted_active(&self) {
    let record = match self.storage.load_worker(WorkerSlot::Active) {
      Ok(Some(record)) => record,
      Ok(None) => return,
      Err(e) => {
        warn!(error = %e, "failed to read active worker record");
        return;
      }
    };

    let is_current = |active: &Option<Arc<CacheWorker<S, F>>>| {
      active.as_ref().map(|w| w.bucket()) == Some(record.bucket.as_str())
    };
    if is_current(&*self.active.read().await) {
      return;
    }

    let mut active = self.active.write().await;
    if is_current(&*active) {
      return;
    }
    match CacheWorker::from_record(
      &record,
      Arc::clone(&self.storage),
      Arc::clone(&self.fetcher),
      self.max_runtime_entries,
    ) {
      Ok(worker) => {
        info!(
          from = active.as_ref().map(|w| w.bucket()).unwrap_or("none"),
          to = %record.bucket,
          "following version activated elsewhere"
        );
        *active = Some(Arc::new(worker));
      }
      Err(e) => warn!(bucket = %record.bucket, error = %e, "unreadable active worker record"),
    }
  }

  /// Bucket of the active worker.
  pub async fn active_bucket(&self) -> Option<String> {
    self
      .active
      .read()
      .await
      .as_ref()
      .map(|worker| worker.bucket().to_string())
  }

  pub fn status(&self) -> Result<StatusReport> {
    Ok(StatusReport {
      active: self.storage.load_worker(WorkerSlot::Active)?,
      pending: self.storage.load_worker(WorkerSlot::Pending)?,
      buckets: self.storage.bucket_summaries()?,
    })
  }
}
