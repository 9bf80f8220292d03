use std::borrow::Cow;
use thiserror::Error;

use crate::{Label, MetricType};

/// A single StatsD record, borrowed from the datagram it was parsed from
#[derive(Clone, Debug, PartialEq)]
pub struct Record<'a> {
    pub key: &'a str,
    pub value: f64,
    pub type_: MetricType,
    pub sample_rate: Option<f64>,
    pub labels: Vec<(&'a str, Cow<'a, str>)>,
}

impl<'a> Record<'a> {
    pub fn owned_labels(&self) -> Vec<Label> {
        self.labels
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("record has an empty metric key")]
    EmptyKey,
    #[error("record is missing ':' between key and value")]
    MissingValue,
    #[error("invalid value '{0}'")]
    InvalidValue(String),
    #[error("record is missing a '|type' suffix")]
    MissingType,
    #[error("invalid sample rate '{0}'")]
    InvalidSampleRate(String),
    #[error("invalid label '{0}'")]
    InvalidLabel(String),
}

/// The result of parsing one datagram
#[derive(Debug, Default)]
pub struct Parsed<'a> {
    pub records: Vec<Record<'a>>,
    pub errors: Vec<ParseError>,
}

/// A parser for StatsD-style datagrams: `key:value|type[|@rate][,name=value...]`.
///
/// Records are separated by newlines or semicolons. A malformed record is
/// collected as an error and never stops the remaining records from parsing.
pub fn parse(input: &str) -> Parsed {
    let mut parsed = Parsed::default();
    for line in input.split(|ch| ch == '\n' || ch == ';') {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_record(line) {
            Ok(record) => parsed.records.push(record),
            Err(err) => parsed.errors.push(err),
        }
    }
    parsed
}

pub fn parse_record(line: &str) -> Result<Record, ParseError> {
    // Split `key:value|type...` into parts
    let mut parts = line.splitn(2, ':');
    let key = parts.next().unwrap_or("").trim();
    let tail = parts.next().ok_or(ParseError::MissingValue)?;
    if key.is_empty() {
        return Err(ParseError::EmptyKey);
    }

    // Split `value|type|@rate,name=value,...` into the sample and its labels
    let mut sections = tail.split(',');
    let sample_str = sections.next().unwrap_or("");
    let mut fields = sample_str.split('|');

    let value_str = fields.next().unwrap_or("").trim();
    let value = value_str
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| ParseError::InvalidValue(value_str.to_string()))?;

    let type_str = fields.next().map(str::trim).unwrap_or("");
    if type_str.is_empty() {
        return Err(ParseError::MissingType);
    }
    let type_ = MetricType::from_tag(type_str);

    let sample_rate = match fields.next() {
        Some(rate_str) => Some(parse_sample_rate(rate_str.trim())?),
        None => None,
    };

    let mut labels = Vec::new();
    for label in sections {
        let label = label.trim();
        let mut pair = label.splitn(2, '=');
        match (pair.next(), pair.next()) {
            (Some(name), Some(value)) if !name.trim().is_empty() && !value.trim().is_empty() => {
                labels.push((name.trim(), Cow::Borrowed(value.trim())));
            }
            _ => return Err(ParseError::InvalidLabel(label.to_string())),
        }
    }

    Ok(Record {
        key,
        value,
        type_,
        sample_rate,
        labels,
    })
}

fn parse_sample_rate(rate_str: &str) -> Result<f64, ParseError> {
    let invalid = || ParseError::InvalidSampleRate(rate_str.to_string());
    let rate = rate_str
        .strip_prefix('@')
        .ok_or_else(invalid)?
        .parse::<f64>()
        .map_err(|_| invalid())?;
    if rate > 0.0 && rate <= 1.0 {
        Ok(rate)
    } else {
        Err(invalid())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_statsd_format() {
        let parsed = parse(
            "api.requests:1|c\n\
             api.latency:320.5|ms|@0.1\n\
             disk.free:1024|g,host=db-1,mount=/var\n\
             queue.size:7|g|@1,region=eu-west;users.unique:42|s\n\
             custom.thing:3.25|kv",
        );

        assert!(parsed.errors.is_empty(), "{:?}", parsed.errors);
        assert_eq!(parsed.records.len(), 6);

        // It parses keys, values and types
        assert_eq!(parsed.records[0].key, "api.requests");
        assert_eq!(parsed.records[0].value, 1.0);
        assert_eq!(parsed.records[0].type_, MetricType::Counter);
        assert_eq!(parsed.records[0].sample_rate, None);

        // It parses sample rates
        assert_eq!(parsed.records[1].type_, MetricType::Timer);
        assert_eq!(parsed.records[1].sample_rate, Some(0.1));

        // It parses labels in order
        assert_eq!(parsed.records[2].labels.len(), 2);
        assert_eq!(parsed.records[2].labels[0].0, "host");
        assert_eq!(parsed.records[2].labels[0].1, "db-1");
        assert_eq!(parsed.records[2].labels[1].0, "mount");
        assert_eq!(parsed.records[2].labels[1].1, "/var");

        // It parses labels after a sample rate, and ';' as a separator
        assert_eq!(parsed.records[3].sample_rate, Some(1.0));
        assert_eq!(parsed.records[3].labels[0].1, "eu-west");
        assert_eq!(parsed.records[4].key, "users.unique");
        assert_eq!(parsed.records[4].type_, MetricType::Set);

        // It keeps unknown types
        assert_eq!(
            parsed.records[5].type_,
            MetricType::Other("kv".to_string())
        );
        assert_eq!(parsed.records[5].value, 3.25);
    }

    #[test]
    fn malformed_records_do_not_stop_the_datagram() {
        let parsed = parse("a:1|c\ngarbage\nb:2|c");
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.records[0].key, "a");
        assert_eq!(parsed.records[0].value, 1.0);
        assert_eq!(parsed.records[1].key, "b");
        assert_eq!(parsed.records[1].value, 2.0);
        assert_eq!(parsed.errors, vec![ParseError::MissingValue]);
    }

    #[test]
    fn rejects_invalid_records() {
        assert_eq!(
            parse_record("cpu:not-a-number|g"),
            Err(ParseError::InvalidValue("not-a-number".into()))
        );
        assert_eq!(
            parse_record("cpu:NaN|g"),
            Err(ParseError::InvalidValue("NaN".into()))
        );
        assert_eq!(parse_record("cpu:1"), Err(ParseError::MissingType));
        assert_eq!(parse_record("cpu:1|"), Err(ParseError::MissingType));
        assert_eq!(parse_record(":1|c"), Err(ParseError::EmptyKey));
        assert_eq!(
            parse_record("cpu:1|c|0.5"),
            Err(ParseError::InvalidSampleRate("0.5".into()))
        );
        assert_eq!(
            parse_record("cpu:1|c|@2"),
            Err(ParseError::InvalidSampleRate("@2".into()))
        );
        assert_eq!(
            parse_record("cpu:1|c,host"),
            Err(ParseError::InvalidLabel("host".into()))
        );
        assert_eq!(
            parse_record("cpu:1|c,=x"),
            Err(ParseError::InvalidLabel("=x".into()))
        );
    }

    #[test]
    fn skips_blank_records() {
        let parsed = parse("\r\n a:1|c \r\n;;\n");
        assert_eq!(parsed.records.len(), 1);
        assert!(parsed.errors.is_empty());
    }
}
