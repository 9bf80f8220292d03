use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use metricd_core::debug::DEBUG;
use metricd_core::{Error, Result};

use crate::encoding::{self, Frame};

const SEGMENT_EXTENSION: &str = "log";

pub fn segment_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{:08}.{}", id, SEGMENT_EXTENSION))
}

/// Lists the ids of the segment files in a series directory, in ascending order
pub fn list_segments(dir: &Path) -> Result<Vec<u32>> {
    let entries = fs::read_dir(dir).map_err(|err| Error::io("listing segments", dir, err))?;
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| Error::io("listing segments", dir, err))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(SEGMENT_EXTENSION) {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<u32>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// A run of consecutive records within one segment.
///
/// Blocks only ever describe bytes that were completely written, so any reader
/// holding a copy of a block can read it without observing a partial record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub segment: u32,
    pub offset: u64,
    pub len: u64,
    pub count: u32,
    pub min_ts: i64,
    pub max_ts: i64,
}

impl Block {
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.min_ts <= end && self.max_ts >= start
    }
}

/// Records the position of a newly written record in a series' block index
pub fn index_record(
    blocks: &mut Vec<Block>,
    segment: u32,
    offset: u64,
    len: u64,
    timestamp: i64,
    block_records: u32,
) {
    if let Some(last) = blocks.last_mut() {
        if last.segment == segment
            && last.offset + last.len == offset
            && last.count < block_records
        {
            last.len += len;
            last.count += 1;
            last.min_ts = last.min_ts.min(timestamp);
            last.max_ts = last.max_ts.max(timestamp);
            return;
        }
    }
    blocks.push(Block {
        segment,
        offset,
        len,
        count: 1,
        min_ts: timestamp,
        max_ts: timestamp,
    });
}

/// The outcome of scanning a segment on startup
pub struct Recovered {
    /// Length of the valid prefix of the segment (its new file length)
    pub len: u64,
    pub blocks: Vec<Block>,
}

/// Scans a segment and truncates it after its last complete record.
///
/// A crash mid-append leaves at most one torn record at the tail of a segment;
/// it is discarded here so that new appends start on a record boundary.
pub fn recover_segment(dir: &Path, id: u32, block_records: u32) -> Result<Recovered> {
    let path = segment_path(dir, id);
    let bytes = fs::read(&path).map_err(|err| Error::io("reading segment", &path, err))?;

    let mut blocks = Vec::new();
    let mut offset = 0;
    let mut damage = None;
    while offset < bytes.len() {
        match encoding::decode_frame(&bytes[offset..]) {
            Frame::Record(record, len) => {
                index_record(
                    &mut blocks,
                    id,
                    offset as u64,
                    len as u64,
                    record.timestamp,
                    block_records,
                );
                offset += len;
            }
            Frame::Incomplete => {
                damage = Some("incomplete trailing record");
                break;
            }
            Frame::Corrupt(reason) => {
                damage = Some(reason);
                break;
            }
        }
    }

    if let Some(reason) = damage {
        tracing::warn!(
            segment = %path.display(),
            valid_bytes = offset,
            discarded_bytes = bytes.len() - offset,
            "truncating segment: {}",
            reason
        );
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|err| Error::io("opening segment for recovery", &path, err))?;
        file.set_len(offset as u64)
            .and_then(|_| file.sync_all())
            .map_err(|err| Error::io("truncating segment", &path, err))?;
        DEBUG.segment_truncated();
    }

    Ok(Recovered {
        len: offset as u64,
        blocks,
    })
}

/// Append handles to active segments, shared by every series of a backend.
///
/// At most `capacity` handles are cached; a segment whose handle was evicted is
/// reopened on its next append or sync. Handles in use by a writer stay open
/// until that writer is done with them.
pub struct SegmentHandles {
    open: Mutex<LruCache<PathBuf, Arc<File>>>,
}

impl SegmentHandles {
    pub fn new(capacity: usize) -> Self {
        SegmentHandles {
            open: Mutex::new(LruCache::new(capacity.max(1))),
        }
    }

    /// The number of cached handles
    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    fn get(&self, path: &Path) -> Result<Arc<File>> {
        let key = path.to_path_buf();
        if let Some(file) = self.open.lock().get(&key) {
            return Ok(Arc::clone(file));
        }
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|err| Error::io("opening segment", path, err))?;
        let file = Arc::new(file);
        self.open.lock().put(key, Arc::clone(&file));
        Ok(file)
    }

    fn insert(&self, path: &Path, file: File) {
        self.open.lock().put(path.to_path_buf(), Arc::new(file));
    }

    fn forget(&self, path: &Path) {
        self.open.lock().pop(&path.to_path_buf());
    }
}

/// Flushes a directory so that entries created in it survive a crash
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|dir| dir.sync_all())
        .map_err(|err| Error::io("syncing directory", dir, err))
}

/// The segment of a series that currently receives appends
pub struct ActiveSegment {
    id: u32,
    path: PathBuf,
    len: u64,

    /// Whether bytes were appended since the last sync
    dirty: bool,
}

impl ActiveSegment {
    /// Creates an empty segment file and makes its directory entry durable
    pub fn create(dir: &Path, id: u32, handles: &SegmentHandles) -> Result<Self> {
        let path = segment_path(dir, id);
        let file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| Error::io("creating segment", &path, err))?;
        handles.insert(&path, file);
        sync_dir(dir)?;
        Ok(ActiveSegment {
            id,
            path,
            len: 0,
            dirty: false,
        })
    }

    /// Refers to a recovered segment; `len` must be the length of its valid prefix.
    ///
    /// The file is not opened until the segment is appended to.
    pub fn open(dir: &Path, id: u32, len: u64) -> Self {
        ActiveSegment {
            id,
            path: segment_path(dir, id),
            len,
            dirty: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a complete frame and returns the offset it was written at
    pub fn append(&mut self, frame: &[u8], handles: &SegmentHandles) -> Result<u64> {
        let offset = self.len;
        let file = handles.get(&self.path)?;
        if let Err(err) = (&*file).write_all(frame) {
            // Drop whatever part of the frame made it to the file, so the next
            // append still starts on a record boundary.
            if let Err(rollback) = file.set_len(offset) {
                tracing::error!(
                    segment = %self.path.display(),
                    "failed to roll back partial append: {}",
                    rollback
                );
            }
            return Err(Error::io("appending to segment", &self.path, err));
        }
        self.len += frame.len() as u64;
        self.dirty = true;
        Ok(offset)
    }

    pub fn sync(&mut self, handles: &SegmentHandles) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        handles
            .get(&self.path)?
            .sync_data()
            .map_err(|err| Error::io("syncing segment", &self.path, err))?;
        self.dirty = false;
        Ok(())
    }

    /// Syncs a segment that will receive no more appends and releases its handle
    pub fn seal(mut self, handles: &SegmentHandles) -> Result<()> {
        self.sync(handles)?;
        handles.forget(&self.path);
        Ok(())
    }
}

/// Reads `len` bytes at `offset` from a segment through a fresh file handle
pub fn read_range(dir: &Path, id: u32, offset: u64, len: u64) -> Result<Vec<u8>> {
    let path = segment_path(dir, id);
    let mut file = File::open(&path).map_err(|err| Error::io("opening segment", &path, err))?;
    let mut bytes = vec![0; len as usize];
    file.seek(SeekFrom::Start(offset))
        .and_then(|_| file.read_exact(&mut bytes))
        .map_err(|err| Error::io("reading segment", &path, err))?;
    Ok(bytes)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encoding::RecordEncoder;
    use chrono::prelude::*;
    use metricd_core::Sample;

    fn frame(micros: i64, value: f64) -> Vec<u8> {
        let time = metricd_core::from_micros(micros).unwrap();
        let sample = Sample::new("k".into(), value, vec![], time);
        RecordEncoder::sized_for(&sample).encode(&sample)
    }

    #[test]
    fn index_groups_contiguous_records() {
        let mut blocks = Vec::new();
        index_record(&mut blocks, 0, 0, 10, 5, 2);
        index_record(&mut blocks, 0, 10, 10, 3, 2);
        // block is full
        index_record(&mut blocks, 0, 20, 10, 9, 2);
        // new segment
        index_record(&mut blocks, 1, 0, 10, 12, 2);

        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].count, 2);
        assert_eq!(blocks[0].len, 20);
        assert_eq!((blocks[0].min_ts, blocks[0].max_ts), (3, 5));
        assert_eq!(blocks[1].offset, 20);
        assert_eq!(blocks[2].segment, 1);

        assert!(blocks[0].overlaps(4, 4));
        assert!(!blocks[0].overlaps(6, 8));
    }

    #[test]
    fn lists_segments_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let handles = SegmentHandles::new(4);
        for id in &[2, 0, 10] {
            ActiveSegment::create(dir.path(), *id, &handles).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        assert_eq!(list_segments(dir.path()).unwrap(), vec![0, 2, 10]);
    }

    #[test]
    fn recovery_truncates_a_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let handles = SegmentHandles::new(4);
        let mut active = ActiveSegment::create(dir.path(), 0, &handles).unwrap();
        let first = frame(1_000, 1.0);
        let second = frame(2_000, 2.0);
        active.append(&first, &handles).unwrap();
        active.append(&second, &handles).unwrap();
        // Simulate a crash half-way through a third append
        let third = frame(3_000, 3.0);
        active.append(&third[..third.len() / 2], &handles).unwrap();
        drop(active);
        drop(handles);

        let recovered = recover_segment(dir.path(), 0, 128).unwrap();
        let valid_len = (first.len() + second.len()) as u64;
        assert_eq!(recovered.len, valid_len);
        assert_eq!(recovered.blocks.len(), 1);
        assert_eq!(recovered.blocks[0].count, 2);
        assert_eq!(
            fs::metadata(segment_path(dir.path(), 0)).unwrap().len(),
            valid_len
        );

        // Appends continue on a record boundary
        let handles = SegmentHandles::new(4);
        let mut active = ActiveSegment::open(dir.path(), 0, recovered.len);
        assert_eq!(handles.len(), 0);
        assert_eq!(active.append(&third, &handles).unwrap(), valid_len);
        let recovered = recover_segment(dir.path(), 0, 128).unwrap();
        assert_eq!(recovered.blocks[0].count, 3);
        assert_eq!(recovered.blocks[0].max_ts, 3_000);
    }

    #[test]
    fn reads_byte_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let handles = SegmentHandles::new(4);
        let mut active = ActiveSegment::create(dir.path(), 3, &handles).unwrap();
        let first = frame(metricd_core::to_micros(&Utc::now()), 1.0);
        let second = frame(metricd_core::to_micros(&Utc::now()), 2.0);
        active.append(&first, &handles).unwrap();
        let offset = active.append(&second, &handles).unwrap();
        let bytes = read_range(dir.path(), 3, offset, second.len() as u64).unwrap();
        assert_eq!(bytes, second);
    }

    #[test]
    fn reopens_evicted_handles() {
        let dir = tempfile::tempdir().unwrap();
        let handles = SegmentHandles::new(2);
        let mut segments = (0..5)
            .map(|id| ActiveSegment::create(dir.path(), id, &handles).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(handles.len(), 2);

        let record = frame(1_000, 1.0);
        for _ in 0..3 {
            for segment in &mut segments {
                segment.append(&record, &handles).unwrap();
                assert!(handles.len() <= 2);
            }
        }
        for segment in &mut segments {
            segment.sync(&handles).unwrap();
        }
        for id in 0..5 {
            let recovered = recover_segment(dir.path(), id, 128).unwrap();
            assert_eq!(recovered.len, 3 * record.len() as u64);
        }

        let sealed = segments.pop().unwrap();
        sealed.seal(&handles).unwrap();
        assert!(handles.len() <= 1);
    }
}
