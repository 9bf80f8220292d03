pub mod disk;
mod encoding;
pub mod memory;
pub mod scheduler;
mod segment;
pub mod service;

use std::collections::BTreeSet;

use metricd_core::{Error, Result, Sample, TimeRange, MAX_KEY_LEN};

pub use disk::{DiskBackend, DiskOptions};
pub use memory::InMemoryBackend;
pub use scheduler::Scheduler;
pub use service::MetricService;

/// Selects and configures a storage backend at startup
#[derive(Clone, Debug)]
pub enum BackendConfig {
    InMemory,
    Disk(DiskOptions),
}

/// The storage backend owning every series of the running service.
///
/// Resolved once at startup from a [`BackendConfig`]; both variants serialize
/// writes per metric key and let reads proceed alongside them.
pub enum Backend {
    InMemory(InMemoryBackend),
    Disk(DiskBackend),
}

impl Backend {
    pub fn open(config: BackendConfig) -> Result<Self> {
        match config {
            BackendConfig::InMemory => Ok(Backend::InMemory(InMemoryBackend::new())),
            BackendConfig::Disk(options) => Ok(Backend::Disk(DiskBackend::open(options)?)),
        }
    }

    /// Appends a sample to the series of its key, creating the series if needed
    pub fn insert(&self, sample: Sample) -> Result<()> {
        let key = sample.key();
        if key.is_empty() {
            return Err(Error::write(key, "metric key is empty"));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(Error::write(
                key,
                format!("metric key is longer than {} bytes", MAX_KEY_LEN),
            ));
        }
        match self {
            Backend::InMemory(backend) => backend.insert(sample),
            Backend::Disk(backend) => backend.insert(sample),
        }
    }

    /// Returns the samples of `key` within `range`, in timestamp order.
    ///
    /// An unknown key yields an empty list rather than an error.
    pub fn query(&self, key: &str, range: &TimeRange) -> Result<Vec<Sample>> {
        match self {
            Backend::InMemory(backend) => backend.query(key, range),
            Backend::Disk(backend) => backend.query(key, range),
        }
    }

    pub fn list_keys(&self) -> BTreeSet<String> {
        match self {
            Backend::InMemory(backend) => backend.list_keys(),
            Backend::Disk(backend) => backend.list_keys(),
        }
    }

    pub fn close(&self) -> Result<()> {
        match self {
            Backend::InMemory(_) => Ok(()),
            Backend::Disk(backend) => backend.close(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::InMemory(_) => "inmemory",
            Backend::Disk(_) => "disk",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_invalid_keys() {
        let backend = Backend::open(BackendConfig::InMemory).unwrap();
        let empty = Sample::now(String::new(), 1.0, vec![]);
        assert!(matches!(backend.insert(empty), Err(Error::Write { .. })));

        let long = Sample::now("k".repeat(MAX_KEY_LEN + 1), 1.0, vec![]);
        assert!(matches!(backend.insert(long), Err(Error::Write { .. })));

        let ok = Sample::now("k".repeat(MAX_KEY_LEN), 1.0, vec![]);
        assert!(backend.insert(ok).is_ok());
        assert_eq!(backend.list_keys().len(), 1);
    }

    #[test]
    fn opening_a_missing_datadir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig::Disk(DiskOptions::new(dir.path().join("nope")));
        assert!(matches!(Backend::open(config), Err(Error::Io { .. })));
    }
}
