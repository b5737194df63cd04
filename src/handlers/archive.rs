//! Archive payload handler.
//!
//! One self-contained file per item: a metadata block followed by the raw
//! array bytes and a checksum. Chosen for small payloads because a single
//! file is simple to write and easy to transport.

use super::{check_kind, StorageHandler};
use crate::error::{Result, StoreError};
use crate::types::{ArrayData, DType, HandlerKind, HandlerRef, ItemId};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Magic bytes for archive files.
const ARCHIVE_MAGIC: &[u8; 4] = b"ARC\0";

/// Current archive format version.
const ARCHIVE_VERSION: u8 = 1;

/// File extension for archive payloads.
const ARCHIVE_EXT: &str = "arc";

/// Metadata block stored ahead of the array bytes.
#[derive(Serialize, Deserialize)]
struct ArchiveMeta {
    dtype: u8,
    shape: Vec<u64>,
}

/// Archive-file payload storage.
pub struct ArchiveHandler {
    /// Base directory for payload files.
    path: PathBuf,

    /// LRU cache of recently read payloads, keyed by locator.
    cache: Mutex<LruCache<String, ArrayData>>,
}

impl ArchiveHandler {
    /// Create an archive handler rooted at the given data directory.
    pub fn new(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap();

        Ok(Self {
            path,
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// Locator for an item's payload file.
    pub fn locator_for(id: ItemId) -> String {
        format!("{}.{}", id, ARCHIVE_EXT)
    }

    fn file_path(&self, locator: &str) -> PathBuf {
        self.path.join(locator)
    }
}

impl StorageHandler for ArchiveHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Archive
    }

    fn write(&self, id: ItemId, array: &ArrayData) -> Result<HandlerRef> {
        let locator = Self::locator_for(id);
        let file_path = self.file_path(&locator);

        let meta = ArchiveMeta {
            dtype: array.dtype.tag(),
            shape: array.shape.clone(),
        };
        let meta_bytes = rmp_serde::to_vec(&meta)?;

        let mut file = File::create(&file_path)?;

        file.write_all(ARCHIVE_MAGIC)?;
        file.write_all(&[ARCHIVE_VERSION])?;

        file.write_all(&(meta_bytes.len() as u32).to_le_bytes())?;
        file.write_all(&meta_bytes)?;

        file.write_all(&(array.bytes.len() as u64).to_le_bytes())?;
        file.write_all(&array.bytes)?;

        let checksum = crc32fast::hash(&array.bytes);
        file.write_all(&checksum.to_le_bytes())?;

        file.sync_all()?;

        self.cache.lock().put(locator.clone(), array.clone());

        Ok(HandlerRef {
            kind: HandlerKind::Archive,
            locator,
        })
    }

    fn read(&self, handler_ref: &HandlerRef) -> Result<ArrayData> {
        check_kind(handler_ref, HandlerKind::Archive)?;

        if let Some(cached) = self.cache.lock().get(&handler_ref.locator) {
            return Ok(cached.clone());
        }

        let file_path = self.file_path(&handler_ref.locator);
        let mut file = match File::open(&file_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::PayloadMissing(handler_ref.locator.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let read = |file: &mut File| -> Result<ArrayData> {
            let mut magic = [0u8; 4];
            file.read_exact(&mut magic)?;
            if &magic != ARCHIVE_MAGIC {
                return Err(StoreError::InvalidFormat("Invalid archive magic".into()));
            }

            let mut version = [0u8; 1];
            file.read_exact(&mut version)?;
            if version[0] != ARCHIVE_VERSION {
                return Err(StoreError::InvalidFormat(format!(
                    "Unsupported archive version: {}",
                    version[0]
                )));
            }

            let mut meta_len_bytes = [0u8; 4];
            file.read_exact(&mut meta_len_bytes)?;
            let meta_len = u32::from_le_bytes(meta_len_bytes) as usize;

            let mut meta_bytes = vec![0u8; meta_len];
            file.read_exact(&mut meta_bytes)?;
            let meta: ArchiveMeta = rmp_serde::from_slice(&meta_bytes)?;

            let dtype = DType::from_tag(meta.dtype).ok_or_else(|| {
                StoreError::InvalidFormat(format!("Unknown dtype tag: {}", meta.dtype))
            })?;

            let mut data_len_bytes = [0u8; 8];
            file.read_exact(&mut data_len_bytes)?;
            let data_len = u64::from_le_bytes(data_len_bytes) as usize;

            let mut bytes = vec![0u8; data_len];
            file.read_exact(&mut bytes)?;

            let mut checksum_bytes = [0u8; 4];
            file.read_exact(&mut checksum_bytes)?;
            let stored_checksum = u32::from_le_bytes(checksum_bytes);
            let computed_checksum = crc32fast::hash(&bytes);

            if stored_checksum != computed_checksum {
                return Err(StoreError::ChecksumMismatch {
                    expected: stored_checksum,
                    got: computed_checksum,
                });
            }

            ArrayData::new(dtype, meta.shape, bytes)
        };

        // Truncation shows up as an unexpected EOF mid-read; surface it as a
        // corrupt payload so the caller can flag the item and move on.
        let array = read(&mut file).map_err(|e| match e {
            StoreError::Io(io) if io.kind() == ErrorKind::UnexpectedEof => {
                StoreError::PayloadCorrupt(format!("truncated archive: {}", handler_ref.locator))
            }
            other => other,
        })?;

        self.cache
            .lock()
            .put(handler_ref.locator.clone(), array.clone());

        Ok(array)
    }

    fn delete(&self, handler_ref: &HandlerRef) -> Result<()> {
        check_kind(handler_ref, HandlerKind::Archive)?;

        self.cache.lock().pop(&handler_ref.locator);

        let file_path = self.file_path(&handler_ref.locator);
        match fs::remove_file(&file_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn payload_size(&self, handler_ref: &HandlerRef) -> Result<u64> {
        check_kind(handler_ref, HandlerKind::Archive)?;
        match fs::metadata(self.file_path(&handler_ref.locator)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}
