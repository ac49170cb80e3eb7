//! Array file format: one typed 2-D array (time-index x slot) per file

use crate::core::property::{Column, Dtype};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Array file format version
pub const ARRAY_VERSION: u8 = 1;

/// Header size (64 bytes)
pub const HEADER_SIZE: usize = 64;

/// Magic number: "TRKA0"
pub const MAGIC: &[u8; 5] = b"TRKA0";

/// Elements written per call while filling a new array
const FILL_ELEMENTS: usize = 1 << 16;

/// Array header structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayHeader {
    pub dtype: Dtype,
    pub n_rows: u64,
    pub n_cols: u64,
}

impl ArrayHeader {
    /// Serialize header to bytes
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_slice(MAGIC);
        buf.put_u8(ARRAY_VERSION);
        buf.put_u8(self.dtype.code());
        buf.put_u8(0);
        buf.put_u64(self.n_rows);
        buf.put_u64(self.n_cols);
        let checksum = crc32fast::hash(&buf);
        buf.put_u32(checksum);

        // Padding to 64 bytes: 5+1+1+1+8+8+4 = 28, need 36 more
        buf.put_bytes(0, 36);

        debug_assert_eq!(buf.len(), HEADER_SIZE);
        buf.freeze()
    }

    /// Deserialize header from bytes
    pub fn deserialize(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Storage("Invalid array header size".to_string()));
        }
        let expected = crc32fast::hash(&buf[..24]);

        let magic = &buf[0..5];
        if magic != MAGIC {
            return Err(Error::Storage(format!("Invalid magic number: {:?}", magic)));
        }
        buf.advance(5);

        let version = buf.get_u8();
        if version != ARRAY_VERSION {
            return Err(Error::Storage(format!("Unsupported version: {}", version)));
        }
        let dtype = Dtype::from_code(buf.get_u8())?;
        buf.advance(1);
        let n_rows = buf.get_u64();
        let n_cols = buf.get_u64();

        let checksum = buf.get_u32();
        if checksum != expected {
            return Err(Error::Storage(format!(
                "Array header checksum mismatch: expected {}, got {}",
                checksum, expected
            )));
        }
        Ok(Self {
            dtype,
            n_rows,
            n_cols,
        })
    }
}

/// Random-access typed array stored row-major in little-endian
pub struct ArrayFile {
    file: File,
    header: ArrayHeader,
    path: PathBuf,
}

impl ArrayFile {
    /// Create an array filled with the dtype's fill value
    pub fn create<P: AsRef<Path>>(path: P, dtype: Dtype, n_rows: u64, n_cols: u64) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let header = ArrayHeader {
            dtype,
            n_rows,
            n_cols,
        };
        file.write_all(&header.serialize())?;

        let total = n_rows * n_cols;
        let fill = encode(&Column::filled(dtype, FILL_ELEMENTS.min(total as usize)));
        let mut written = 0u64;
        while written < total {
            let n = (total - written).min(FILL_ELEMENTS as u64) as usize;
            file.write_all(&fill[..n * dtype.size()])?;
            written += n as u64;
        }
        file.sync_all()?;

        Ok(Self {
            file,
            header,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing array
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new().read(true).write(writable).open(path)?;

        let mut header_buf = vec![0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = ArrayHeader::deserialize(&header_buf)?;

        let expected_len =
            HEADER_SIZE as u64 + header.n_rows * header.n_cols * header.dtype.size() as u64;
        let actual_len = file.metadata()?.len();
        if actual_len != expected_len {
            return Err(Error::Storage(format!(
                "Array {} has {} bytes, expected {}",
                path.display(),
                actual_len,
                expected_len
            )));
        }

        Ok(Self {
            file,
            header,
            path: path.to_path_buf(),
        })
    }

    pub fn header(&self) -> &ArrayHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_bounds(&self, row: u64, start: u64, len: u64) -> Result<()> {
        if row >= self.header.n_rows || start + len > self.header.n_cols {
            return Err(Error::Storage(format!(
                "Range [{}, {}+{}) outside array of shape [{}, {}] in {}",
                row,
                start,
                len,
                self.header.n_rows,
                self.header.n_cols,
                self.path.display()
            )));
        }
        Ok(())
    }

    fn offset(&self, row: u64, col: u64) -> u64 {
        HEADER_SIZE as u64 + (row * self.header.n_cols + col) * self.header.dtype.size() as u64
    }

    /// Write `values` into `row` starting at column `start`
    pub fn write_range(&mut self, row: u64, start: u64, values: &Column) -> Result<()> {
        if values.dtype() != self.header.dtype {
            return Err(Error::Storage(format!(
                "Cannot write {:?} values into {:?} array {}",
                values.dtype(),
                self.header.dtype,
                self.path.display()
            )));
        }
        self.check_bounds(row, start, values.len() as u64)?;
        if values.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.offset(row, start)))?;
        self.file.write_all(&encode(values))?;
        Ok(())
    }

    /// Read `len` values of `row` starting at column `start`
    pub fn read_range(&mut self, row: u64, start: u64, len: u64) -> Result<Column> {
        self.check_bounds(row, start, len)?;
        let mut buf = vec![0u8; len as usize * self.header.dtype.size()];
        if len > 0 {
            self.file.seek(SeekFrom::Start(self.offset(row, start)))?;
            self.file.read_exact(&mut buf)?;
        }
        Ok(decode(self.header.dtype, &buf))
    }

    /// Overwrite a whole row
    pub fn write_row(&mut self, row: u64, values: &Column) -> Result<()> {
        if values.len() as u64 != self.header.n_cols {
            return Err(Error::Storage(format!(
                "Row of {} values for array of {} columns",
                values.len(),
                self.header.n_cols
            )));
        }
        self.write_range(row, 0, values)
    }

    /// Flush written data to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

fn encode(values: &Column) -> Bytes {
    let mut buf = BytesMut::with_capacity(values.len() * values.dtype().size());
    match values {
        Column::U64(v) => v.iter().for_each(|x| buf.put_u64_le(*x)),
        Column::I16(v) => v.iter().for_each(|x| buf.put_i16_le(*x)),
        Column::F64(v) => v.iter().for_each(|x| buf.put_f64_le(*x)),
    }
    buf.freeze()
}

fn decode(dtype: Dtype, mut buf: &[u8]) -> Column {
    let n = buf.len() / dtype.size();
    match dtype {
        Dtype::U64 => Column::U64((0..n).map(|_| buf.get_u64_le()).collect()),
        Dtype::I16 => Column::I16((0..n).map(|_| buf.get_i16_le()).collect()),
        Dtype::F64 => Column::F64((0..n).map(|_| buf.get_f64_le()).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_array_header_serialization() {
        let header = ArrayHeader {
            dtype: Dtype::I16,
            n_rows: 3,
            n_cols: 1_000,
        };
        let bytes = header.serialize();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(ArrayHeader::deserialize(&bytes).unwrap(), header);
    }

    #[test]
    fn test_create_fills() {
        let temp_dir = TempDir::new().unwrap();
        let mut ids = ArrayFile::create(temp_dir.path().join("Id.arr"), Dtype::U64, 2, 5).unwrap();
        assert_eq!(ids.read_range(1, 0, 5).unwrap(), Column::U64(vec![0; 5]));

        let mut xs = ArrayFile::create(temp_dir.path().join("x.arr"), Dtype::F64, 2, 5).unwrap();
        assert!(xs.read_range(0, 0, 5).unwrap().to_f64().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_write_read_ranges() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("q.arr");
        let mut q = ArrayFile::create(&path, Dtype::I16, 3, 4).unwrap();
        q.write_range(1, 2, &Column::I16(vec![-1, 7])).unwrap();
        q.write_row(2, &Column::I16(vec![1, 2, 3, 4])).unwrap();
        q.sync().unwrap();

        let mut reopened = ArrayFile::open(&path, false).unwrap();
        assert_eq!(reopened.read_range(1, 0, 4).unwrap(), Column::I16(vec![0, 0, -1, 7]));
        assert_eq!(reopened.read_range(2, 1, 2).unwrap(), Column::I16(vec![2, 3]));
        assert_eq!(reopened.read_range(0, 4, 0).unwrap(), Column::I16(vec![]));
    }

    #[test]
    fn test_bounds_and_types_checked() {
        let temp_dir = TempDir::new().unwrap();
        let mut a = ArrayFile::create(temp_dir.path().join("w.arr"), Dtype::F64, 2, 4).unwrap();
        assert!(a.write_range(0, 3, &Column::F64(vec![1.0, 2.0])).is_err());
        assert!(a.write_range(2, 0, &Column::F64(vec![1.0])).is_err());
        assert!(a.write_range(0, 0, &Column::U64(vec![1])).is_err());
        assert!(a.write_row(0, &Column::F64(vec![1.0])).is_err());
        assert!(a.read_range(0, 2, 3).is_err());
    }

    #[test]
    fn test_truncated_array_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Id.arr");
        ArrayFile::create(&path, Dtype::U64, 2, 4).unwrap();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(HEADER_SIZE as u64 + 8).unwrap();
        assert!(ArrayFile::open(&path, false).is_err());
    }
}
