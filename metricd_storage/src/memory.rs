//! # Storage Backend: In-Memory
//!
//! Keeps every series in process memory; nothing survives a restart.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;

use metricd_core::debug::DEBUG;
use metricd_core::{Result, Sample, TimeRange};

#[derive(Default)]
pub struct InMemoryBackend {
    /// A map of metric keys to their series; entries are created lazily and never removed
    series: DashMap<String, Arc<RwLock<Series>>>,
}

#[derive(Default)]
struct Series {
    samples: Vec<Sample>,

    /// Whether `samples` is sorted by timestamp, which allows binary searching
    ordered: bool,
}

impl Series {
    fn push(&mut self, sample: Sample) {
        self.ordered = match self.samples.last() {
            Some(last) => self.ordered && last.timestamp() <= sample.timestamp(),
            None => true,
        };
        self.samples.push(sample);
    }

    fn range(&self, range: &TimeRange) -> Vec<Sample> {
        if self.ordered {
            let lo = self
                .samples
                .partition_point(|sample| sample.timestamp() < range.start());
            let hi = self
                .samples
                .partition_point(|sample| sample.timestamp() <= range.end());
            self.samples[lo..hi.max(lo)].to_vec()
        } else {
            let mut samples = self
                .samples
                .iter()
                .filter(|sample| range.contains(&sample.timestamp()))
                .cloned()
                .collect::<Vec<_>>();
            samples.sort_by_key(Sample::timestamp_micros);
            samples
        }
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, sample: Sample) -> Result<()> {
        let series = match self.series.get(sample.key()) {
            Some(series) => Arc::clone(&series),
            None => {
                let entry = self.series.entry(sample.key().to_string()).or_insert_with(|| {
                    DEBUG.series_added();
                    Arc::new(RwLock::new(Series::default()))
                });
                Arc::clone(entry.value())
            }
        };
        series.write().push(sample);
        Ok(())
    }

    pub fn query(&self, key: &str, range: &TimeRange) -> Result<Vec<Sample>> {
        let series = match self.series.get(key) {
            Some(series) => Arc::clone(&series),
            None => return Ok(Vec::new()),
        };
        let samples = series.read().range(range);
        Ok(samples)
    }

    pub fn list_keys(&self) -> BTreeSet<String> {
        self.series.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::prelude::*;

    fn sample_at(key: &str, secs: i64, value: f64) -> Sample {
        let time = Utc.timestamp_opt(secs, 0).unwrap();
        Sample::new(key.to_string(), value, vec![], time)
    }

    fn range(start: i64, end: i64) -> TimeRange {
        TimeRange::new(
            Utc.timestamp_opt(start, 0).unwrap(),
            Utc.timestamp_opt(end, 0).unwrap(),
        )
        .unwrap()
    }

    fn values(samples: &[Sample]) -> Vec<f64> {
        samples.iter().map(Sample::value).collect()
    }

    #[test]
    fn queries_ordered_series() {
        let backend = InMemoryBackend::new();
        for n in 0..10 {
            backend.insert(sample_at("cpu", 100 + n, n as f64)).unwrap();
        }
        assert_eq!(values(&backend.query("cpu", &range(102, 104)).unwrap()), vec![2.0, 3.0, 4.0]);
        assert_eq!(backend.query("cpu", &range(0, 99)).unwrap().len(), 0);
        assert_eq!(backend.query("cpu", &TimeRange::all()).unwrap().len(), 10);
    }

    #[test]
    fn queries_unordered_series() {
        let backend = InMemoryBackend::new();
        for secs in &[5, 1, 4, 2, 3] {
            backend.insert(sample_at("cpu", *secs, *secs as f64)).unwrap();
        }
        assert_eq!(values(&backend.query("cpu", &range(2, 4)).unwrap()), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn unknown_keys_are_empty() {
        let backend = InMemoryBackend::new();
        backend.insert(sample_at("cpu", 1, 1.0)).unwrap();
        assert!(backend.query("mem", &TimeRange::all()).unwrap().is_empty());
        assert_eq!(backend.list_keys().into_iter().collect::<Vec<_>>(), vec!["cpu".to_string()]);
    }
}
