//! # Storage Backend: Disk
//!
//! Each metric key owns a directory under the data directory holding a sequence
//! of append-only segment files. Appends for one key are serialized by that
//! series' writer lock; reads snapshot the series' block index and read the
//! referenced bytes through their own file handles.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use metricd_core::debug::DEBUG;
use metricd_core::{Error, Result, Sample, TimeRange};

use crate::encoding::{self, Frame, RecordEncoder};
use crate::segment::{self, ActiveSegment, Block, SegmentHandles};

/// Segments roll over once they would grow past this many bytes
pub const DEFAULT_SEGMENT_SIZE: u64 = 8 * 1024 * 1024;

/// How many consecutive records are summarized by one index block
pub const DEFAULT_BLOCK_RECORDS: u32 = 128;

/// How many segment files are kept open for appending at once
pub const DEFAULT_MAX_OPEN_SEGMENTS: usize = 256;

const MAX_DIR_NAME_LEN: usize = 255;

#[derive(Clone, Debug)]
pub struct DiskOptions {
    /// A pre-existing, writable directory
    pub datadir: PathBuf,
    pub segment_size: u64,
    pub block_records: u32,
    pub max_open_segments: usize,
}

impl DiskOptions {
    pub fn new(datadir: impl Into<PathBuf>) -> Self {
        DiskOptions {
            datadir: datadir.into(),
            segment_size: DEFAULT_SEGMENT_SIZE,
            block_records: DEFAULT_BLOCK_RECORDS,
            max_open_segments: DEFAULT_MAX_OPEN_SEGMENTS,
        }
    }
}

pub struct DiskBackend {
    options: DiskOptions,

    /// A map of metric keys to their on-disk series
    series: DashMap<String, Arc<SeriesLog>>,

    /// Append handles of active segments, shared across series
    handles: SegmentHandles,

    closed: AtomicBool,
}

impl DiskBackend {
    /// Opens the data directory and recovers every series found in it
    pub fn open(options: DiskOptions) -> Result<Self> {
        let datadir = &options.datadir;
        let metadata = fs::metadata(datadir).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::io("data directory does not exist", datadir, err)
            } else {
                Error::io("reading data directory", datadir, err)
            }
        })?;
        if !metadata.is_dir() {
            return Err(Error::io(
                "data directory is not a directory",
                datadir,
                std::io::Error::new(std::io::ErrorKind::Other, "not a directory"),
            ));
        }
        if metadata.permissions().readonly() {
            return Err(Error::io(
                "data directory is not writable",
                datadir,
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            ));
        }

        let series = DashMap::new();
        let entries =
            fs::read_dir(datadir).map_err(|err| Error::io("listing data directory", datadir, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| Error::io("listing data directory", datadir, err))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let key = match path.file_name().and_then(|name| name.to_str()).and_then(|name| {
                unescape_key(name).filter(|key| escape_key(key) == name)
            }) {
                Some(key) => key,
                None => {
                    tracing::warn!(path = %path.display(), "skipping unrecognized directory");
                    continue;
                }
            };
            let ids = segment::list_segments(&path)?;
            if ids.is_empty() {
                tracing::warn!(path = %path.display(), "skipping directory without segments");
                continue;
            }
            let log = SeriesLog::recover(key.clone(), path, &ids, &options)?;
            DEBUG.series_added();
            series.insert(key, Arc::new(log));
        }
        tracing::info!(
            datadir = %datadir.display(),
            "Recovered {} series from disk",
            series.len()
        );

        let handles = SegmentHandles::new(options.max_open_segments);
        Ok(DiskBackend {
            options,
            series,
            handles,
            closed: AtomicBool::new(false),
        })
    }

    pub fn insert(&self, sample: Sample) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::write(sample.key(), "backend is closed"));
        }
        let key = sample.key();
        let log = self.series_for(key).map_err(|err| as_write_error(key, err))?;
        log.append(&sample, &self.options, &self.handles)
            .map_err(|err| as_write_error(key, err))
    }

    pub fn query(&self, key: &str, range: &TimeRange) -> Result<Vec<Sample>> {
        let log = match self.series.get(key) {
            Some(log) => Arc::clone(&log),
            None => return Ok(Vec::new()),
        };
        log.query(range)
    }

    pub fn list_keys(&self) -> BTreeSet<String> {
        self.series.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Stops accepting inserts and makes every acknowledged insert durable
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        for entry in self.series.iter() {
            entry.value().sync(&self.handles)?;
        }
        let datadir = &self.options.datadir;
        segment::sync_dir(datadir)?;
        tracing::info!(datadir = %datadir.display(), "Closed disk backend");
        Ok(())
    }

    fn series_for(&self, key: &str) -> Result<Arc<SeriesLog>> {
        if let Some(log) = self.series.get(key) {
            return Ok(Arc::clone(&log));
        }
        let entry = self
            .series
            .entry(key.to_string())
            .or_try_insert_with(|| {
                let name = escape_key(key);
                if name.len() > MAX_DIR_NAME_LEN {
                    return Err(Error::write(key, "escaped key is too long for a directory name"));
                }
                let dir = self.options.datadir.join(name);
                SeriesLog::create(key.to_string(), dir, &self.options, &self.handles)
                    .map(Arc::new)
            })?;
        Ok(Arc::clone(entry.value()))
    }
}

/// The on-disk series of a single metric key
struct SeriesLog {
    key: String,
    dir: PathBuf,

    /// The segment receiving appends; holding this lock sequences writes to the key
    active: Mutex<ActiveSegment>,

    /// Blocks of complete records, in append order
    blocks: RwLock<Vec<Block>>,
}

impl SeriesLog {
    /// Creates the series of a key not yet in the table.
    ///
    /// A directory left behind by an earlier failed attempt is picked up as-is.
    fn create(
        key: String,
        dir: PathBuf,
        options: &DiskOptions,
        handles: &SegmentHandles,
    ) -> Result<Self> {
        match fs::create_dir(&dir) {
            Ok(()) => segment::sync_dir(&options.datadir)?,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && dir.is_dir() => {}
            Err(err) => return Err(Error::io("creating series directory", &dir, err)),
        }
        let ids = segment::list_segments(&dir)?;
        let log = if ids.is_empty() {
            let active = ActiveSegment::create(&dir, 0, handles)?;
            SeriesLog {
                key,
                dir,
                active: Mutex::new(active),
                blocks: RwLock::new(Vec::new()),
            }
        } else {
            Self::recover(key, dir, &ids, options)?
        };
        DEBUG.series_added();
        tracing::debug!(key = %log.key, "Created series");
        Ok(log)
    }

    /// Rebuilds the block index from the given segments, truncating a torn tail
    fn recover(key: String, dir: PathBuf, ids: &[u32], options: &DiskOptions) -> Result<Self> {
        let mut blocks = Vec::new();
        let mut active = None;
        for (n, id) in ids.iter().enumerate() {
            let recovered = segment::recover_segment(&dir, *id, options.block_records)?;
            blocks.extend(recovered.blocks);
            if n + 1 == ids.len() {
                active = Some(ActiveSegment::open(&dir, *id, recovered.len));
            }
        }
        let active = active.ok_or_else(|| {
            Error::io(
                "recovering series",
                &dir,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no segments"),
            )
        })?;
        Ok(SeriesLog {
            key,
            dir,
            active: Mutex::new(active),
            blocks: RwLock::new(blocks),
        })
    }

    fn append(&self, sample: &Sample, options: &DiskOptions, handles: &SegmentHandles) -> Result<()> {
        let frame = RecordEncoder::sized_for(sample).encode(sample);
        let mut active = self.active.lock();
        if !active.is_empty() && active.len() + frame.len() as u64 > options.segment_size {
            active.sync(handles)?;
            let next = ActiveSegment::create(&self.dir, active.id() + 1, handles)?;
            tracing::debug!(key = %self.key, segment = next.id(), "Rolled over segment");
            std::mem::replace(&mut *active, next).seal(handles)?;
        }
        let offset = active.append(&frame, handles)?;

        // Publish the record only after it has been completely written
        segment::index_record(
            &mut self.blocks.write(),
            active.id(),
            offset,
            frame.len() as u64,
            sample.timestamp_micros(),
            options.block_records,
        );
        Ok(())
    }

    fn query(&self, range: &TimeRange) -> Result<Vec<Sample>> {
        let (start, end) = (range.start_micros(), range.end_micros());
        let blocks = self
            .blocks
            .read()
            .iter()
            .filter(|block| block.overlaps(start, end))
            .copied()
            .collect::<Vec<_>>();

        let mut samples = Vec::new();
        for block in coalesce(blocks) {
            let bytes = segment::read_range(&self.dir, block.segment, block.offset, block.len)?;
            let mut offset = 0;
            while offset < bytes.len() {
                match encoding::decode_frame(&bytes[offset..]) {
                    Frame::Record(record, len) => {
                        offset += len;
                        if record.timestamp < start || record.timestamp > end {
                            continue;
                        }
                        let sample = record.into_sample(&self.key).ok_or_else(|| {
                            Error::Query(format!("invalid timestamp in series '{}'", self.key))
                        })?;
                        samples.push(sample);
                    }
                    Frame::Incomplete | Frame::Corrupt(_) => {
                        return Err(Error::Query(format!(
                            "corrupt record in series '{}' (segment {}, offset {})",
                            self.key,
                            block.segment,
                            block.offset + offset as u64
                        )));
                    }
                }
            }
        }

        // Concurrent producers may have appended slightly out of wall-clock order
        samples.sort_by_key(Sample::timestamp_micros);
        Ok(samples)
    }

    fn sync(&self, handles: &SegmentHandles) -> Result<()> {
        self.active.lock().sync(handles)
    }
}

fn as_write_error(key: &str, err: Error) -> Error {
    match err {
        Error::Write { .. } => err,
        err => Error::write(key, err),
    }
}

/// Merges adjacent blocks of the same segment so they are read with a single call
fn coalesce(blocks: Vec<Block>) -> Vec<Block> {
    let mut merged: Vec<Block> = Vec::with_capacity(blocks.len());
    for block in blocks {
        if let Some(last) = merged.last_mut() {
            if last.segment == block.segment && last.offset + last.len == block.offset {
                last.len += block.len;
                last.count += block.count;
                last.min_ts = last.min_ts.min(block.min_ts);
                last.max_ts = last.max_ts.max(block.max_ts);
                continue;
            }
        }
        merged.push(block);
    }
    merged
}

/// Maps a metric key to a directory name that decodes back to the same key.
///
/// `[A-Za-z0-9_.-]` are kept as-is; every other byte (and a leading '.') is written as `%XX`.
pub fn escape_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for (n, byte) in key.bytes().enumerate() {
        let plain = byte.is_ascii_alphanumeric()
            || byte == b'_'
            || byte == b'-'
            || (byte == b'.' && n > 0);
        if plain {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("%{:02X}", byte));
        }
    }
    escaped
}

pub fn unescape_key(name: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(name.len());
    let mut input = name.bytes();
    while let Some(byte) = input.next() {
        if byte == b'%' {
            let hex = [input.next()?, input.next()?];
            let hex = std::str::from_utf8(&hex).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
        } else {
            bytes.push(byte);
        }
    }
    String::from_utf8(bytes).ok().filter(|key| !key.is_empty())
}
