use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use metricd_core::debug::DEBUG;
use metricd_core::error::debug_error;
use metricd_core::{Label, Result, Sample, TimeRange};

use crate::scheduler::{self, Scheduler};
use crate::{Backend, BackendConfig, DiskOptions};

/// Front door to the storage backend for the ingestion and query paths.
///
/// Inserts are stamped on arrival and handed to the scheduler, which applies
/// them to the backend in call order per metric key. Cloning is cheap; clones
/// share the same backend and scheduler.
#[derive(Clone)]
pub struct MetricService {
    backend: Arc<Backend>,
    scheduler: Arc<Scheduler>,
}

impl MetricService {
    pub fn new(backend: Backend, scheduler: Scheduler) -> Self {
        MetricService {
            backend: Arc::new(backend),
            scheduler: Arc::new(scheduler),
        }
    }

    pub fn open(config: BackendConfig, scheduler: Scheduler) -> Result<Self> {
        let backend = Backend::open(config)?;
        Ok(Self::new(backend, scheduler))
    }

    pub fn with_in_memory_backend() -> Result<Self> {
        let scheduler = Scheduler::new(scheduler::DEFAULT_WORKERS, scheduler::DEFAULT_QUEUE_DEPTH)?;
        Self::open(BackendConfig::InMemory, scheduler)
    }

    /// Opens (and recovers) a disk backend; `datadir` must be an existing directory
    pub fn with_disk_backend(datadir: impl Into<PathBuf>, scheduler: Scheduler) -> Result<Self> {
        Self::open(BackendConfig::Disk(DiskOptions::new(datadir)), scheduler)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Records a sample taken now.
    ///
    /// Failures are logged and counted, never returned; one bad insert must not
    /// disturb the ingestion path that submitted it.
    pub async fn insert_sample(&self, key: &str, value: f64, labels: Vec<Label>) {
        let sample = Sample::now(key.to_string(), value, labels);
        let backend = Arc::clone(&self.backend);
        let submitted = self
            .scheduler
            .submit(key, move || match backend.insert(sample) {
                Ok(()) => DEBUG.write_succeeded(),
                Err(err) => {
                    DEBUG.write_failed();
                    debug_error(anyhow::Error::from(err));
                }
            })
            .await;
        if let Err(err) = submitted {
            DEBUG.write_failed();
            debug_error(anyhow::Error::from(err));
        }
    }

    /// Returns the samples of `key` within `range`, in timestamp order
    pub async fn query(&self, key: &str, range: TimeRange) -> Result<Vec<Sample>> {
        let backend = Arc::clone(&self.backend);
        let key = key.to_string();
        let result = async_std::task::spawn_blocking(move || backend.query(&key, &range)).await;
        match &result {
            Ok(_) => DEBUG.query_succeeded(),
            Err(_) => DEBUG.query_failed(),
        }
        result
    }

    pub fn list_metrics(&self) -> BTreeSet<String> {
        self.backend.list_keys()
    }

    /// Waits until every insert submitted before this call has been applied
    pub async fn flush(&self) {
        self.scheduler.barrier().await;
    }

    /// Drains in-flight inserts, then closes the backend
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.shutdown().await;
        let backend = Arc::clone(&self.backend);
        async_std::task::spawn_blocking(move || backend.close()).await
    }
}
