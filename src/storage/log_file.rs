//! Disordered log file format: one append-only file per (species, rank)
//!
//! ```text
//! [file header: 64 bytes]
//! [frame header: 32 bytes][block][block]...     <- one time-group
//! [frame header: 32 bytes][block]...
//! ```
//!
//! A block is `[len: u32][crc32: u32][zstd(bincode(RecordBatch))]` holding
//! at most `block_records` consecutive records of the time-group, so a
//! reader can decode a sub-range without inflating the whole group.

use crate::core::property::Property;
use crate::core::record::RecordBatch;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher as Crc32Hasher;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

/// Log file format version
pub const LOG_VERSION: u8 = 1;

/// File header size (64 bytes)
pub const HEADER_SIZE: usize = 64;

/// Frame header size (32 bytes)
pub const FRAME_HEADER_SIZE: usize = 32;

/// Magic number: "TRKL0"
pub const MAGIC: &[u8; 5] = b"TRKL0";

/// Default number of records per compressed block
pub const DEFAULT_BLOCK_RECORDS: u32 = 65_536;

/// Compression level for ZSTD (1-22, higher = better compression but slower)
pub const ZSTD_COMPRESSION_LEVEL: i32 = 3;

/// Flag bits in a frame header
pub const FLAG_LATEST_COUNT: u8 = 0x01; // Frame carries the rank's latest count

/// Log file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogHeader {
    pub rank: u32,
    pub n_ranks: u32,
    pub property_mask: u32,
    pub block_records: u32,
}

impl LogHeader {
    pub fn properties(&self) -> Vec<Property> {
        Property::from_mask(self.property_mask)
    }

    /// Serialize header to bytes
    pub fn serialize(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(HEADER_SIZE);
        body.put_slice(MAGIC);
        body.put_u8(LOG_VERSION);
        body.put_u16(0);
        body.put_u32(self.rank);
        body.put_u32(self.n_ranks);
        body.put_u32(self.property_mask);
        body.put_u32(self.block_records);

        let checksum = crc32fast::hash(&body);
        body.put_u32(checksum);

        // Padding to 64 bytes: 5+1+2+4+4+4+4+4 = 28, need 36 more
        body.put_bytes(0, 36);

        debug_assert_eq!(body.len(), HEADER_SIZE);
        body.freeze()
    }

    /// Deserialize header from bytes
    pub fn deserialize(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Storage("Invalid log header size".to_string()));
        }
        let expected = crc32fast::hash(&buf[..24]);

        let magic = &buf[0..5];
        if magic != MAGIC {
            return Err(Error::Storage(format!("Invalid magic number: {:?}", magic)));
        }
        buf.advance(5);

        let version = buf.get_u8();
        if version != LOG_VERSION {
            return Err(Error::Storage(format!("Unsupported version: {}", version)));
        }
        buf.advance(2);

        let header = Self {
            rank: buf.get_u32(),
            n_ranks: buf.get_u32(),
            property_mask: buf.get_u32(),
            block_records: buf.get_u32(),
        };
        let checksum = buf.get_u32();
        if checksum != expected {
            return Err(Error::Storage(format!(
                "Log header checksum mismatch: expected {}, got {}",
                checksum, expected
            )));
        }
        if header.block_records == 0 {
            return Err(Error::Storage("Log header has zero block size".to_string()));
        }
        Ok(header)
    }
}

/// Header of one time-group
#[derive(Debug, Clone, PartialEq, Eq)]
struct FrameHeader {
    time: u64,
    record_count: u32,
    flags: u8,
    latest_count: u32,
    block_count: u32,
}

impl FrameHeader {
    fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE);
        buf.put_u64(self.time);
        buf.put_u32(self.record_count);
        buf.put_u8(self.flags);
        buf.put_u32(self.latest_count);
        buf.put_u32(self.block_count);
        let checksum = crc32fast::hash(&buf);
        buf.put_u32(checksum);
        // 8+4+1+4+4+4 = 25, pad to 32
        buf.put_bytes(0, 7);
        buf.freeze()
    }

    fn deserialize(mut buf: &[u8]) -> Result<Self> {
        let expected = crc32fast::hash(&buf[..21]);
        let header = Self {
            time: buf.get_u64(),
            record_count: buf.get_u32(),
            flags: buf.get_u8(),
            latest_count: buf.get_u32(),
            block_count: buf.get_u32(),
        };
        if buf.get_u32() != expected {
            return Err(Error::Storage(format!(
                "Frame header checksum mismatch at time {}",
                header.time
            )));
        }
        Ok(header)
    }
}

/// Location of one compressed block
#[derive(Debug, Clone)]
pub struct BlockInfo {
    /// File offset of the compressed bytes
    offset: u64,
    len: u32,
    checksum: u32,
    /// Index of the block's first record within its frame
    first_record: usize,
    record_count: usize,
}

/// Index entry for one time-group
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub time: u64,
    pub record_count: usize,
    pub latest_count: Option<u32>,
    blocks: Vec<BlockInfo>,
}

/// Log file writer
pub struct LogWriter {
    file: File,
    header: LogHeader,
    last_time: Option<u64>,
    frames: u32,
}

impl LogWriter {
    /// Create a new log file, truncating any previous one
    pub fn create<P: AsRef<Path>>(
        path: P,
        rank: u32,
        n_ranks: u32,
        properties: &[Property],
    ) -> Result<Self> {
        Self::create_with_blocks(path, rank, n_ranks, properties, DEFAULT_BLOCK_RECORDS)
    }

    /// Create a new log file with a custom block size
    pub fn create_with_blocks<P: AsRef<Path>>(
        path: P,
        rank: u32,
        n_ranks: u32,
        properties: &[Property],
        block_records: u32,
    ) -> Result<Self> {
        if rank >= n_ranks {
            return Err(Error::Storage(format!(
                "Rank {} outside of {} ranks",
                rank, n_ranks
            )));
        }
        if block_records == 0 {
            return Err(Error::Storage("Block size must be positive".to_string()));
        }
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut props = properties.to_vec();
        props.push(Property::Id);
        let header = LogHeader {
            rank,
            n_ranks,
            property_mask: Property::mask(&props),
            block_records,
        };
        file.write_all(&header.serialize())?;

        Ok(Self {
            file,
            header,
            last_time: None,
            frames: 0,
        })
    }

    /// Append the time-group for `time`.
    ///
    /// `latest_count` is written only in the rank's final time-group.
    pub fn append(
        &mut self,
        time: u64,
        batch: &RecordBatch,
        latest_count: Option<u32>,
    ) -> Result<()> {
        if let Some(last) = self.last_time {
            if time <= last {
                return Err(Error::Storage(format!(
                    "Time {} is not after previous time-group {}",
                    time, last
                )));
            }
        }
        if batch.properties() != self.header.properties() {
            return Err(Error::Storage(format!(
                "Batch properties {:?} differ from log properties {:?}",
                batch.properties(),
                self.header.properties()
            )));
        }

        let block_records = self.header.block_records as usize;
        let mut blocks = Vec::new();
        let mut start = 0;
        while start < batch.len() {
            let end = (start + block_records).min(batch.len());
            let encoded = bincode::serialize(&batch.slice(start, end))?;
            let compressed = zstd::encode_all(&encoded[..], ZSTD_COMPRESSION_LEVEL)
                .map_err(|e| Error::Storage(format!("ZSTD compression failed: {}", e)))?;
            blocks.push(compressed);
            start = end;
        }

        let frame = FrameHeader {
            time,
            record_count: batch.len() as u32,
            flags: if latest_count.is_some() { FLAG_LATEST_COUNT } else { 0 },
            latest_count: latest_count.unwrap_or(0),
            block_count: blocks.len() as u32,
        };
        self.file.write_all(&frame.serialize())?;
        for block in blocks {
            let mut hasher = Crc32Hasher::new();
            hasher.update(&block);
            self.file.write_all(&(block.len() as u32).to_le_bytes())?;
            self.file.write_all(&hasher.finalize().to_le_bytes())?;
            self.file.write_all(&block)?;
        }

        self.last_time = Some(time);
        self.frames += 1;
        Ok(())
    }

    /// Flush everything to disk
    pub fn finish(self) -> Result<u32> {
        self.file.sync_all()?;
        Ok(self.frames)
    }

    pub fn header(&self) -> &LogHeader {
        &self.header
    }
}

/// Log file reader
///
/// Opening indexes the frame and block headers only; payloads are decoded
/// on demand.
pub struct LogReader {
    file: File,
    header: LogHeader,
    frames: Vec<FrameInfo>,
    path: PathBuf,
}

impl LogReader {
    /// Open an existing log file and index its time-groups
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();

        let mut header_buf = vec![0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = LogHeader::deserialize(&header_buf)?;
        let block_records = header.block_records as usize;

        let mut frames = Vec::new();
        let mut offset = HEADER_SIZE as u64;
        while offset < file_len {
            if offset + FRAME_HEADER_SIZE as u64 > file_len {
                return Err(Error::Storage(format!(
                    "Truncated frame header at offset {} in {}",
                    offset,
                    path.display()
                )));
            }
            let mut frame_buf = [0u8; FRAME_HEADER_SIZE];
            file.read_exact(&mut frame_buf)?;
            let frame = FrameHeader::deserialize(&frame_buf)?;
            offset += FRAME_HEADER_SIZE as u64;

            let mut blocks = Vec::with_capacity(frame.block_count as usize);
            for b in 0..frame.block_count as usize {
                let mut block_head = [0u8; 8];
                file.read_exact(&mut block_head).map_err(|_| {
                    Error::Storage(format!("Truncated block at time {}", frame.time))
                })?;
                let len = u32::from_le_bytes([block_head[0], block_head[1], block_head[2], block_head[3]]);
                let checksum =
                    u32::from_le_bytes([block_head[4], block_head[5], block_head[6], block_head[7]]);
                offset += 8;
                if offset + len as u64 > file_len {
                    return Err(Error::Storage(format!(
                        "Truncated block data at time {}",
                        frame.time
                    )));
                }
                let first_record = b * block_records;
                blocks.push(BlockInfo {
                    offset,
                    len,
                    checksum,
                    first_record,
                    record_count: (frame.record_count as usize - first_record).min(block_records),
                });
                offset += len as u64;
                file.seek(SeekFrom::Start(offset))?;
            }

            frames.push(FrameInfo {
                time: frame.time,
                record_count: frame.record_count as usize,
                latest_count: (frame.flags & FLAG_LATEST_COUNT != 0).then_some(frame.latest_count),
                blocks,
            });
        }

        Ok(Self {
            file,
            header,
            frames,
            path: path.to_path_buf(),
        })
    }

    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    pub fn frames(&self) -> &[FrameInfo] {
        &self.frames
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Index entry for a time value
    pub fn frame(&self, time: u64) -> Option<&FrameInfo> {
        self.frames
            .binary_search_by_key(&time, |f| f.time)
            .ok()
            .map(|i| &self.frames[i])
    }

    /// Decode records `range` of the time-group at `time`
    pub fn read_range(&mut self, time: u64, range: Range<usize>) -> Result<RecordBatch> {
        let frame = self
            .frame(time)
            .cloned()
            .ok_or_else(|| Error::Storage(format!("No time-group {} in {}", time, self.path.display())))?;
        if range.start > range.end || range.end > frame.record_count {
            return Err(Error::Storage(format!(
                "Record range {:?} outside time-group of {} records",
                range, frame.record_count
            )));
        }

        let mut columns: Option<RecordBatch> = None;
        let mut parts = Vec::new();
        for block in &frame.blocks {
            let block_end = block.first_record + block.record_count;
            if block_end <= range.start || block.first_record >= range.end {
                continue;
            }
            let decoded = self.read_block(block)?;
            let lo = range.start.max(block.first_record) - block.first_record;
            let hi = range.end.min(block_end) - block.first_record;
            parts.push(decoded.slice(lo, hi));
        }
        for part in parts {
            columns = Some(match columns {
                None => part,
                Some(acc) => concat(acc, part)?,
            });
        }
        Ok(columns.unwrap_or_else(|| RecordBatch::empty(&self.header.properties())))
    }

    fn read_block(&mut self, block: &BlockInfo) -> Result<RecordBatch> {
        self.file.seek(SeekFrom::Start(block.offset))?;
        let mut compressed = vec![0u8; block.len as usize];
        self.file.read_exact(&mut compressed)?;

        let mut hasher = Crc32Hasher::new();
        hasher.update(&compressed);
        let calculated = hasher.finalize();
        if calculated != block.checksum {
            return Err(Error::Storage(format!(
                "Checksum mismatch: expected {}, got {}",
                block.checksum, calculated
            )));
        }

        let decompressed = zstd::decode_all(&compressed[..])
            .map_err(|e| Error::Storage(format!("ZSTD decompression failed: {}", e)))?;
        let batch: RecordBatch = bincode::deserialize(&decompressed)?;
        if batch.len() != block.record_count {
            return Err(Error::Storage(format!(
                "Block holds {} records, index says {}",
                batch.len(),
                block.record_count
            )));
        }
        Ok(batch)
    }
}

fn concat(a: RecordBatch, b: RecordBatch) -> Result<RecordBatch> {
    let mut columns = std::collections::BTreeMap::new();
    for (prop, col) in a.columns() {
        let mut merged = col.clone();
        let tail = b
            .column(*prop)
            .ok_or_else(|| Error::Storage(format!("Block is missing column {}", prop)))?;
        merged.extend(tail)?;
        columns.insert(*prop, merged);
    }
    RecordBatch::from_columns(columns)
}
