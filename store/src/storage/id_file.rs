//! The dense id-to-offset map over a [`DataFile`](crate::storage::DataFile).
//!
//! Ids are handed out contiguously starting at 1. The entry for id `n` is
//! an 8-byte big-endian file offset stored at position `n * 8`; position 0
//! holds the file header, so the file's length alone determines the highest
//! id in use.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

const MAGIC: &[u8; 4] = b"stif";
const FORMAT_VERSION: u32 = 1;
const ITEM_SIZE: u64 = 8;

/// Errors produced by id-file operations.
#[derive(Debug)]
pub enum IdFileError {
    Io(std::io::Error),
    /// The file has been closed.
    Closed,
    /// The file header is missing or malformed, or the file is torn.
    CorruptHeader(String),
    /// The id has never been handed out.
    InvalidId(u32),
    /// All 2^32 - 1 ids are in use.
    IdsExhausted,
}

impl std::fmt::Display for IdFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "id file i/o error: {err}"),
            Self::Closed => write!(f, "id file is closed"),
            Self::CorruptHeader(msg) => write!(f, "corrupt id file: {msg}"),
            Self::InvalidId(id) => write!(f, "id {id} is out of range"),
            Self::IdsExhausted => write!(f, "id space is exhausted"),
        }
    }
}

impl std::error::Error for IdFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for IdFileError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

struct Inner {
    /// `None` once the file is closed.
    file: Option<File>,
    /// Highest id handed out so far; 0 when empty.
    max_id: u32,
}

/// Maps dense ids to data-file offsets.
pub struct IdFile {
    inner: Mutex<Inner>,
    force_sync: bool,
    path: PathBuf,
}

impl IdFile {
    /// Open the id file at `path`, creating it if it does not exist.
    pub fn open(path: impl AsRef<Path>, force_sync: bool) -> Result<Self, IdFileError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        let max_id = if len == 0 {
            let mut header = [0u8; ITEM_SIZE as usize];
            header[0..4].copy_from_slice(MAGIC);
            header[4..8].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
            file.write_all(&header)?;
            0
        } else {
            if len < ITEM_SIZE || len % ITEM_SIZE != 0 {
                return Err(IdFileError::CorruptHeader(format!(
                    "file length {len} is not a multiple of the entry size"
                )));
            }
            let mut header = [0u8; ITEM_SIZE as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            if &header[0..4] != MAGIC {
                return Err(IdFileError::CorruptHeader("bad magic".to_owned()));
            }
            let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
            if version != FORMAT_VERSION {
                return Err(IdFileError::CorruptHeader(format!(
                    "unsupported format version {version}"
                )));
            }
            u32::try_from(len / ITEM_SIZE - 1).map_err(|_| {
                IdFileError::CorruptHeader("file holds more entries than the id space".to_owned())
            })?
        };

        Ok(Self {
            inner: Mutex::new(Inner {
                file: Some(file),
                max_id,
            }),
            force_sync,
            path,
        })
    }

    /// Record `offset` under the next free id and return that id.
    pub fn store_offset(&self, offset: u64) -> Result<u32, IdFileError> {
        let mut inner = self.inner.lock();
        let id = inner.max_id.checked_add(1).ok_or(IdFileError::IdsExhausted)?;
        let file = inner.file.as_mut().ok_or(IdFileError::Closed)?;
        file.seek(SeekFrom::Start(u64::from(id) * ITEM_SIZE))?;
        file.write_all(&offset.to_be_bytes())?;
        if self.force_sync {
            file.sync_data()?;
        }
        inner.max_id = id;
        Ok(id)
    }

    /// Look up the offset recorded under `id`.
    pub fn get_offset(&self, id: u32) -> Result<u64, IdFileError> {
        let mut inner = self.inner.lock();
        if id == 0 || id > inner.max_id {
            return Err(IdFileError::InvalidId(id));
        }
        let file = inner.file.as_mut().ok_or(IdFileError::Closed)?;
        file.seek(SeekFrom::Start(u64::from(id) * ITEM_SIZE))?;
        let mut entry = [0u8; ITEM_SIZE as usize];
        file.read_exact(&mut entry)?;
        Ok(u64::from_be_bytes(entry))
    }

    /// The highest id handed out so far; 0 when no ids exist.
    pub fn max_id(&self) -> Result<u32, IdFileError> {
        let inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(IdFileError::Closed);
        }
        Ok(inner.max_id)
    }

    /// Flush pending writes to stable storage.
    pub fn sync(&self) -> Result<(), IdFileError> {
        let mut inner = self.inner.lock();
        let file = inner.file.as_mut().ok_or(IdFileError::Closed)?;
        if self.force_sync {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Discard every id, truncating the file back to its header.
    pub fn clear(&self) -> Result<(), IdFileError> {
        let mut inner = self.inner.lock();
        let file = inner.file.as_mut().ok_or(IdFileError::Closed)?;
        file.set_len(ITEM_SIZE)?;
        inner.max_id = 0;
        Ok(())
    }

    /// Sync and close the file. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), IdFileError> {
        let mut inner = self.inner.lock();
        if let Some(file) = inner.file.take() {
            file.sync_data()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for IdFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdFile")
            .field("path", &self.path)
            .field("max_id", &self.inner.lock().max_id)
            .finish_non_exhaustive()
    }
}
