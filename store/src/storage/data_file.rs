//! An append-only file of variable-length byte entries.
//!
//! Entries are stored back to back after an 8-byte header, each as a 4-byte
//! big-endian length followed by the bytes themselves. An entry's file
//! offset is its stable handle: entries are never moved or rewritten, only
//! appended, so an offset handed out once stays valid until [`DataFile::clear`].

#![allow(clippy::cast_possible_truncation)]

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

const MAGIC: &[u8; 4] = b"stdf";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: u64 = 8;

/// Errors produced by data-file operations.
#[derive(Debug)]
pub enum DataFileError {
    Io(std::io::Error),
    /// The file has been closed.
    Closed,
    /// The file header is missing or malformed.
    CorruptHeader(String),
    /// The offset does not point at a stored entry.
    InvalidOffset(u64),
    /// The entry at the offset extends past the end of the file.
    CorruptEntry(u64),
    /// The entry exceeds the 4-byte length field.
    EntryTooLarge(usize),
}

impl std::fmt::Display for DataFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "data file i/o error: {err}"),
            Self::Closed => write!(f, "data file is closed"),
            Self::CorruptHeader(msg) => write!(f, "corrupt data file header: {msg}"),
            Self::InvalidOffset(offset) => write!(f, "offset {offset} is out of range"),
            Self::CorruptEntry(offset) => {
                write!(f, "entry at offset {offset} extends past end of file")
            }
            Self::EntryTooLarge(len) => write!(f, "entry of {len} bytes exceeds the format limit"),
        }
    }
}

impl std::error::Error for DataFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DataFileError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

struct Inner {
    /// `None` once the file is closed.
    file: Option<File>,
    /// Current length of the file, which is also the next append offset.
    len: u64,
}

/// The append-only entry heap.
pub struct DataFile {
    inner: Mutex<Inner>,
    force_sync: bool,
    path: PathBuf,
}

impl DataFile {
    /// Open the data file at `path`, creating it if it does not exist.
    pub fn open(path: impl AsRef<Path>, force_sync: bool) -> Result<Self, DataFileError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        let len = if len == 0 {
            let mut header = [0u8; HEADER_LEN as usize];
            header[0..4].copy_from_slice(MAGIC);
            header[4..8].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
            file.write_all(&header)?;
            HEADER_LEN
        } else {
            if len < HEADER_LEN {
                return Err(DataFileError::CorruptHeader(
                    "file too short for a header".to_owned(),
                ));
            }
            let mut header = [0u8; HEADER_LEN as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            if &header[0..4] != MAGIC {
                return Err(DataFileError::CorruptHeader("bad magic".to_owned()));
            }
            let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
            if version != FORMAT_VERSION {
                return Err(DataFileError::CorruptHeader(format!(
                    "unsupported format version {version}"
                )));
            }
            len
        };

        Ok(Self {
            inner: Mutex::new(Inner {
                file: Some(file),
                len,
            }),
            force_sync,
            path,
        })
    }

    /// Append an entry, returning the offset it can be read back from.
    pub fn store(&self, data: &[u8]) -> Result<u64, DataFileError> {
        let len = u32::try_from(data.len()).map_err(|_| DataFileError::EntryTooLarge(data.len()))?;

        let mut inner = self.inner.lock();
        let offset = inner.len;
        let file = inner.file.as_mut().ok_or(DataFileError::Closed)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&len.to_be_bytes())?;
        file.write_all(data)?;
        if self.force_sync {
            file.sync_data()?;
        }
        inner.len = offset + 4 + u64::from(len);
        Ok(offset)
    }

    /// Read back the entry stored at `offset`.
    pub fn get(&self, offset: u64) -> Result<Vec<u8>, DataFileError> {
        let mut inner = self.inner.lock();
        if offset < HEADER_LEN || offset + 4 > inner.len {
            return Err(DataFileError::InvalidOffset(offset));
        }
        let total_len = inner.len;
        let file = inner.file.as_mut().ok_or(DataFileError::Closed)?;

        file.seek(SeekFrom::Start(offset))?;
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from(u32::from_be_bytes(len_bytes));
        if offset + 4 + len > total_len {
            return Err(DataFileError::CorruptEntry(offset));
        }

        let mut data = vec![0u8; len as usize];
        file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Flush pending writes to stable storage.
    pub fn sync(&self) -> Result<(), DataFileError> {
        let mut inner = self.inner.lock();
        let file = inner.file.as_mut().ok_or(DataFileError::Closed)?;
        if self.force_sync {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Discard every entry, truncating the file back to its header.
    pub fn clear(&self) -> Result<(), DataFileError> {
        let mut inner = self.inner.lock();
        let file = inner.file.as_mut().ok_or(DataFileError::Closed)?;
        file.set_len(HEADER_LEN)?;
        inner.len = HEADER_LEN;
        Ok(())
    }

    /// Sync and close the file. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), DataFileError> {
        let mut inner = self.inner.lock();
        if let Some(file) = inner.file.take() {
            file.sync_data()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DataFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFile")
            .field("path", &self.path)
            .field("len", &self.inner.lock().len)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_get() {
        let dir = tempfile::tempdir().expect("temp dir");
        let file = DataFile::open(dir.path().join("test.dat"), false).expect("open data file");

        let first = file.store(b"hello").expect("store");
        let second = file.store(b"").expect("store empty");
        let third = file.store(&[0xffu8; 300]).expect("store large");

        assert_eq!(file.get(first).expect("get"), b"hello");
        assert_eq!(file.get(second).expect("get"), b"");
        assert_eq!(file.get(third).expect("get"), vec![0xffu8; 300]);
    }

    #[test]
    fn test_offsets_are_stable_across_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("test.dat");

        let offset = {
            let file = DataFile::open(&path, false).expect("open data file");
            let offset = file.store(b"persistent").expect("store");
            file.close().expect("close");
            offset
        };

        let file = DataFile::open(&path, false).expect("reopen data file");
        assert_eq!(file.get(offset).expect("get"), b"persistent");

        // Appends after a reopen go after the existing entries.
        let next = file.store(b"more").expect("store");
        assert!(next > offset);
        assert_eq!(file.get(offset).expect("get"), b"persistent");
    }

    #[test]
    fn test_rejects_bad_offsets() {
        let dir = tempfile::tempdir().expect("temp dir");
        let file = DataFile::open(dir.path().join("test.dat"), false).expect("open data file");
        file.store(b"x").expect("store");

        // Inside the header.
        assert!(matches!(file.get(0), Err(DataFileError::InvalidOffset(0))));
        // Past the end.
        assert!(matches!(
            file.get(1 << 20),
            Err(DataFileError::InvalidOffset(_))
        ));
    }

    #[test]
    fn test_clear_discards_entries() {
        let dir = tempfile::tempdir().expect("temp dir");
        let file = DataFile::open(dir.path().join("test.dat"), false).expect("open data file");

        let offset = file.store(b"gone").expect("store");
        file.clear().expect("clear");
        assert!(matches!(
            file.get(offset),
            Err(DataFileError::InvalidOffset(_))
        ));

        let offset = file.store(b"fresh").expect("store");
        assert_eq!(file.get(offset).expect("get"), b"fresh");
    }

    #[test]
    fn test_operations_fail_after_close() {
        let dir = tempfile::tempdir().expect("temp dir");
        let file = DataFile::open(dir.path().join("test.dat"), false).expect("open data file");
        let offset = file.store(b"x").expect("store");
        file.close().expect("close");
        file.close().expect("second close is a no-op");

        assert!(matches!(file.store(b"y"), Err(DataFileError::Closed)));
        assert!(matches!(file.get(offset), Err(DataFileError::Closed)));
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("test.dat");
        std::fs::write(&path, b"not a data file").expect("write file");

        assert!(matches!(
            DataFile::open(&path, false),
            Err(DataFileError::CorruptHeader(_))
        ));
    }
}
