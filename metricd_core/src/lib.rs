pub mod debug;
pub mod error;
pub mod parser;

use chrono::prelude::*;
use std::collections::HashSet;
use std::fmt;

pub use error::{Error, Result};

/// The longest metric key (in bytes) that storage backends will accept.
pub const MAX_KEY_LEN: usize = 200;

pub type Label = (String, String);

/// A single measurement for a metric at a particular timestamp.
///
/// Samples are immutable once constructed; the timestamp is truncated to
/// microsecond precision so it survives a round trip through disk storage.
#[derive(Clone, Debug)]
pub struct Sample {
    key: String,
    value: f64,
    labels: Vec<Label>,
    timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(key: String, value: f64, labels: Vec<Label>, timestamp: DateTime<Utc>) -> Self {
        let timestamp = from_micros(to_micros(&timestamp)).unwrap_or(timestamp);
        Sample {
            key,
            value,
            labels,
            timestamp,
        }
    }

    /// Builds a sample stamped with the current wall-clock time
    pub fn now(key: String, value: f64, labels: Vec<Label>) -> Self {
        Self::new(key, value, labels, Utc::now())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Labels in the order they were received
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn timestamp_micros(&self) -> i64 {
        to_micros(&self.timestamp)
    }
}

impl PartialEq for Sample {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.value.to_bits() == other.value.to_bits()
            && self.timestamp == other.timestamp
            && labels_eq(&self.labels, &other.labels)
    }
}

/// Two label sets are equal iff their pair-sets are equal; order is ignored.
pub fn labels_eq(a: &[Label], b: &[Label]) -> bool {
    let a = a.iter().collect::<HashSet<_>>();
    let b = b.iter().collect::<HashSet<_>>();
    a == b
}

/// An inclusive range of time used to select samples.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(Error::Query(format!(
                "invalid time range: {} is after {}",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
        Ok(TimeRange { start, end })
    }

    /// A range covering every representable instant
    pub fn all() -> Self {
        TimeRange {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn start_micros(&self) -> i64 {
        to_micros(&self.start)
    }

    pub fn end_micros(&self) -> i64 {
        to_micros(&self.end)
    }

    pub fn contains(&self, timestamp: &DateTime<Utc>) -> bool {
        self.start <= *timestamp && *timestamp <= self.end
    }
}

/// Microseconds since the unix epoch, saturating at the edges of `i64`.
pub fn to_micros(time: &DateTime<Utc>) -> i64 {
    time.timestamp()
        .saturating_mul(1_000_000)
        .saturating_add(i64::from(time.timestamp_subsec_micros()))
}

pub fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

/// The StatsD type tag of an ingested record.
///
/// The type does not change how a value is stored; unknown tags are kept as `Other`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MetricType {
    Counter,
    Gauge,
    Timer,
    Histogram,
    Set,
    Other(String),
}

impl MetricType {
    pub fn as_str(&self) -> &str {
        match self {
            MetricType::Counter => "c",
            MetricType::Gauge => "g",
            MetricType::Timer => "ms",
            MetricType::Histogram => "h",
            MetricType::Set => "s",
            MetricType::Other(tag) => tag,
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "c" => MetricType::Counter,
            "g" => MetricType::Gauge,
            "ms" => MetricType::Timer,
            "h" => MetricType::Histogram,
            "s" => MetricType::Set,
            _ => MetricType::Other(tag.to_string()),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sample_equality_ignores_label_order() {
        let time = Utc::now();
        let a = Sample::new(
            "cpu".into(),
            1.5,
            vec![("host".into(), "a".into()), ("dc".into(), "eu".into())],
            time,
        );
        let b = Sample::new(
            "cpu".into(),
            1.5,
            vec![("dc".into(), "eu".into()), ("host".into(), "a".into())],
            time,
        );
        assert_eq!(a, b);

        // Display order is preserved
        assert_eq!(a.labels()[0].0, "host");
        assert_eq!(b.labels()[0].0, "dc");

        let c = Sample::new("cpu".into(), 1.5, vec![("host".into(), "b".into())], time);
        assert_ne!(a, c);
    }

    #[test]
    fn timestamps_are_truncated_to_micros() {
        let time = Utc.timestamp_opt(1_600_000_000, 123_456_789).unwrap();
        let sample = Sample::new("x".into(), 0.0, vec![], time);
        assert_eq!(sample.timestamp().timestamp_subsec_nanos(), 123_456_000);
        assert_eq!(sample.timestamp_micros(), 1_600_000_000_123_456);
        assert_eq!(from_micros(sample.timestamp_micros()), Some(sample.timestamp()));
    }

    #[test]
    fn micros_round_trip_before_epoch() {
        let micros = -1_500_001;
        let time = from_micros(micros).unwrap();
        assert_eq!(to_micros(&time), micros);
    }

    #[test]
    fn time_range_rejects_inverted_bounds() {
        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(10);
        assert!(TimeRange::new(earlier, now).is_ok());
        assert!(matches!(TimeRange::new(now, earlier), Err(Error::Query(_))));

        let range = TimeRange::new(earlier, now).unwrap();
        assert!(range.contains(&now));
        assert!(range.contains(&earlier));
        assert!(!range.contains(&(now + chrono::Duration::seconds(1))));
        assert!(TimeRange::all().contains(&now));
    }

    #[test]
    fn metric_type_tags() {
        assert_eq!(MetricType::from_tag("c"), MetricType::Counter);
        assert_eq!(MetricType::from_tag("ms").as_str(), "ms");
        assert_eq!(
            MetricType::from_tag("kv"),
            MetricType::Other("kv".to_string())
        );
    }
}
