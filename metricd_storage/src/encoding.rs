//! On-disk record framing.
//!
//! Every record is written as `len: u32 LE | crc32: u32 LE | payload`, where the
//! payload holds a zig-zag varint timestamp (µs), the value as 8 LE bytes, a varint
//! label count and varint length-prefixed label names and values.

use metricd_core::{Label, Sample};

/// Bytes taken by the length and checksum prefix of each record
pub const HEADER_LEN: usize = 8;

/// Any larger length prefix can only come from a torn or garbled header
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

pub struct RecordEncoder {
    output: Vec<u8>,
}

impl RecordEncoder {
    pub fn sized_for(sample: &Sample) -> Self {
        // Ballpark the memory we'll need; to avoid excess re-allocations
        let labels_len: usize = sample
            .labels()
            .iter()
            .map(|(name, value)| name.len() + value.len() + 4)
            .sum();
        Self {
            output: Vec::with_capacity(HEADER_LEN + 10 + 8 + 5 + labels_len),
        }
    }

    /// Encodes a sample into a complete frame, ready to be appended to a segment
    pub fn encode(mut self, sample: &Sample) -> Vec<u8> {
        self.output.extend_from_slice(&[0; HEADER_LEN]);
        self.encode_u64(zigzag(sample.timestamp_micros()));
        self.output
            .extend_from_slice(&sample.value().to_bits().to_le_bytes());
        self.encode_u64(sample.labels().len() as u64);
        for (name, value) in sample.labels() {
            self.encode_bytes(name.as_bytes());
            self.encode_bytes(value.as_bytes());
        }

        let payload_len = (self.output.len() - HEADER_LEN) as u32;
        let checksum = crc32fast::hash(&self.output[HEADER_LEN..]);
        self.output[0..4].copy_from_slice(&payload_len.to_le_bytes());
        self.output[4..8].copy_from_slice(&checksum.to_le_bytes());
        self.output
    }

    fn encode_u64(&mut self, value: u64) {
        let mut buffer = unsigned_varint::encode::u64_buffer();
        let encoded = unsigned_varint::encode::u64(value, &mut buffer);
        self.output.extend_from_slice(encoded);
    }

    fn encode_bytes(&mut self, bytes: &[u8]) {
        self.encode_u64(bytes.len() as u64);
        self.output.extend_from_slice(bytes);
    }
}

/// A record decoded from a frame, without its key (which is implied by the series)
#[derive(Debug, PartialEq)]
pub struct DecodedRecord {
    pub timestamp: i64,
    pub value: f64,
    pub labels: Vec<Label>,
}

impl DecodedRecord {
    pub fn into_sample(self, key: &str) -> Option<Sample> {
        let timestamp = metricd_core::from_micros(self.timestamp)?;
        Some(Sample::new(key.to_string(), self.value, self.labels, timestamp))
    }
}

#[derive(Debug, PartialEq)]
pub enum Frame {
    /// A complete, checksummed record and the number of bytes it occupies
    Record(DecodedRecord, usize),
    /// The input ends part-way through a record
    Incomplete,
    /// The bytes at this position can't be a valid record
    Corrupt(&'static str),
}

/// Decodes the frame at the start of `input`
pub fn decode_frame(input: &[u8]) -> Frame {
    if input.len() < HEADER_LEN {
        return Frame::Incomplete;
    }
    let mut len_bytes = [0; 4];
    let mut crc_bytes = [0; 4];
    len_bytes.copy_from_slice(&input[0..4]);
    crc_bytes.copy_from_slice(&input[4..8]);
    let payload_len = u32::from_le_bytes(len_bytes) as usize;
    let checksum = u32::from_le_bytes(crc_bytes);
    if payload_len > MAX_PAYLOAD_LEN {
        return Frame::Corrupt("record length out of bounds");
    }
    let frame_len = HEADER_LEN + payload_len;
    if input.len() < frame_len {
        return Frame::Incomplete;
    }
    let payload = &input[HEADER_LEN..frame_len];
    if crc32fast::hash(payload) != checksum {
        return Frame::Corrupt("checksum mismatch");
    }
    match RecordDecoder::new(payload).decode() {
        Some(record) => Frame::Record(record, frame_len),
        None => Frame::Corrupt("malformed record payload"),
    }
}

struct RecordDecoder<'a> {
    input: &'a [u8],
}

impl<'a> RecordDecoder<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    fn decode(mut self) -> Option<DecodedRecord> {
        let timestamp = unzigzag(self.decode_u64()?);
        let value = f64::from_bits(u64::from_le_bytes(self.take_array()?));
        let num_labels = self.decode_u64()? as usize;
        let mut labels = Vec::with_capacity(num_labels.min(64));
        for _ in 0..num_labels {
            let name = self.decode_string()?;
            let value = self.decode_string()?;
            labels.push((name, value));
        }
        if !self.input.is_empty() {
            return None;
        }
        Some(DecodedRecord {
            timestamp,
            value,
            labels,
        })
    }

    #[inline]
    fn decode_u64(&mut self) -> Option<u64> {
        let (head, tail) = unsigned_varint::decode::u64(self.input).ok()?;
        self.input = tail;
        Some(head)
    }

    fn take_array(&mut self) -> Option<[u8; 8]> {
        if self.input.len() < 8 {
            return None;
        }
        let mut bytes = [0; 8];
        bytes.copy_from_slice(&self.input[..8]);
        self.input = &self.input[8..];
        Some(bytes)
    }

    fn decode_string(&mut self) -> Option<String> {
        let len = self.decode_u64()? as usize;
        if self.input.len() < len {
            return None;
        }
        let (head, tail) = self.input.split_at(len);
        self.input = tail;
        String::from_utf8(head.to_vec()).ok()
    }
}

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}
