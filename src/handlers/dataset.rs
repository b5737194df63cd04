//! Dataset payload handler.
//!
//! Per-item dataset file with a fixed-offset data region, chosen for large
//! arrays because a sub-region can be rewritten in place without touching
//! the rest of the file. During live acquisition only the latest frame
//! changes, so partial writes avoid rewriting the whole array.
//!
//! File handles are opened lazily and kept open across many small writes;
//! `close_idle` and `close_all` release them. Partial writes never touch
//! the header, so a torn write leaves the file structurally valid.

use super::{check_kind, StorageHandler};
use crate::error::{Result, StoreError};
use crate::types::{ArrayData, DType, HandlerKind, HandlerRef, ItemId, Region};
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Magic bytes for dataset files.
const DATASET_MAGIC: &[u8; 4] = b"DST\0";

/// Current dataset format version.
const DATASET_VERSION: u8 = 1;

/// File extension for dataset payloads.
const DATASET_EXT: &str = "dset";

/// Parsed dataset header.
#[derive(Clone, Debug)]
struct DatasetInfo {
    dtype: DType,
    shape: Vec<u64>,
    data_offset: u64,
    data_len: u64,
}

impl DatasetInfo {
    fn header_len(rank: usize) -> u64 {
        // magic + version + dtype + rank + reserved + shape + data_len + crc
        (4 + 1 + 1 + 1 + 1 + rank * 8 + 8 + 4) as u64
    }
}

/// An open dataset file. The inner mutex gives one logical writer per
/// handler reference at a time.
struct DatasetHandle {
    file: Mutex<File>,
    info: DatasetInfo,
    last_used: Mutex<Instant>,
}

/// Dataset-file payload storage.
pub struct DatasetHandler {
    /// Base directory for payload files.
    path: PathBuf,

    /// Lazily opened handles, keyed by locator.
    handles: Mutex<HashMap<String, Arc<DatasetHandle>>>,
}

impl DatasetHandler {
    /// Create a dataset handler rooted at the given data directory.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        Ok(Self {
            path,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Locator for an item's payload file.
    pub fn locator_for(id: ItemId) -> String {
        format!("{}.{}", id, DATASET_EXT)
    }

    fn file_path(&self, locator: &str) -> PathBuf {
        self.path.join(locator)
    }

    /// Close handles unused for at least `max_idle`. Returns how many were
    /// closed.
    pub fn close_idle(&self, max_idle: Duration) -> usize {
        let mut handles = self.handles.lock();
        let before = handles.len();
        let now = Instant::now();
        handles.retain(|_, handle| now.duration_since(*handle.last_used.lock()) < max_idle);
        before - handles.len()
    }

    /// Close all open handles (project close).
    pub fn close_all(&self) {
        self.handles.lock().clear();
    }

    /// Number of currently open handles.
    pub fn open_handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Get or open the handle for a locator.
    fn handle(&self, locator: &str) -> Result<Arc<DatasetHandle>> {
        if let Some(handle) = self.handles.lock().get(locator) {
            *handle.last_used.lock() = Instant::now();
            return Ok(Arc::clone(handle));
        }

        let file_path = self.file_path(locator);
        let mut file = match OpenOptions::new().read(true).write(true).open(&file_path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::PayloadMissing(locator.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let info = Self::read_header(&mut file).map_err(|e| match e {
            StoreError::Io(io) if io.kind() == ErrorKind::UnexpectedEof => {
                StoreError::PayloadCorrupt(format!("truncated dataset header: {}", locator))
            }
            other => other,
        })?;

        let handle = Arc::new(DatasetHandle {
            file: Mutex::new(file),
            info,
            last_used: Mutex::new(Instant::now()),
        });

        self.handles
            .lock()
            .insert(locator.to_string(), Arc::clone(&handle));

        Ok(handle)
    }

    fn write_header(file: &mut File, info: &DatasetInfo) -> Result<()> {
        let mut header = Vec::with_capacity(DatasetInfo::header_len(info.shape.len()) as usize);
        header.extend_from_slice(DATASET_MAGIC);
        header.push(DATASET_VERSION);
        header.push(info.dtype.tag());
        header.push(info.shape.len() as u8);
        header.push(0u8);
        for extent in &info.shape {
            header.extend_from_slice(&extent.to_le_bytes());
        }
        header.extend_from_slice(&info.data_len.to_le_bytes());

        let checksum = crc32fast::hash(&header);
        header.extend_from_slice(&checksum.to_le_bytes());

        file.write_all(&header)?;
        Ok(())
    }

    fn read_header(file: &mut File) -> Result<DatasetInfo> {
        file.seek(SeekFrom::Start(0))?;

        let mut fixed = [0u8; 8];
        file.read_exact(&mut fixed)?;

        if &fixed[0..4] != DATASET_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid dataset magic".into()));
        }
        if fixed[4] != DATASET_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported dataset version: {}",
                fixed[4]
            )));
        }

        let dtype = DType::from_tag(fixed[5]).ok_or_else(|| {
            StoreError::InvalidFormat(format!("Unknown dtype tag: {}", fixed[5]))
        })?;
        let rank = fixed[6] as usize;

        let mut rest = vec![0u8; rank * 8 + 8];
        file.read_exact(&mut rest)?;

        let mut shape = Vec::with_capacity(rank);
        for axis in 0..rank {
            let mut extent = [0u8; 8];
            extent.copy_from_slice(&rest[axis * 8..axis * 8 + 8]);
            shape.push(u64::from_le_bytes(extent));
        }

        let mut data_len_bytes = [0u8; 8];
        data_len_bytes.copy_from_slice(&rest[rank * 8..]);
        let data_len = u64::from_le_bytes(data_len_bytes);

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        let mut header = Vec::with_capacity(8 + rest.len());
        header.extend_from_slice(&fixed);
        header.extend_from_slice(&rest);
        let computed_checksum = crc32fast::hash(&header);

        if stored_checksum != computed_checksum {
            return Err(StoreError::PayloadCorrupt(
                "dataset header checksum mismatch".into(),
            ));
        }

        Ok(DatasetInfo {
            dtype,
            shape,
            data_offset: DatasetInfo::header_len(rank),
            data_len,
        })
    }
}

impl StorageHandler for DatasetHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Dataset
    }

    fn write(&self, id: ItemId, array: &ArrayData) -> Result<HandlerRef> {
        if array.shape.len() > u8::MAX as usize {
            return Err(StoreError::ShapeMismatch(format!(
                "rank {} exceeds maximum",
                array.shape.len()
            )));
        }

        let locator = Self::locator_for(id);

        // A full write may change the header size, so any cached handle is
        // stale from here on.
        self.handles.lock().remove(&locator);

        let info = DatasetInfo {
            dtype: array.dtype,
            shape: array.shape.clone(),
            data_offset: DatasetInfo::header_len(array.shape.len()),
            data_len: array.bytes.len() as u64,
        };

        let file_path = self.file_path(&locator);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&file_path)?;

        Self::write_header(&mut file, &info)?;
        file.write_all(&array.bytes)?;
        file.sync_all()?;

        let handle = Arc::new(DatasetHandle {
            file: Mutex::new(file),
            info,
            last_used: Mutex::new(Instant::now()),
        });
        self.handles.lock().insert(locator.clone(), handle);

        Ok(HandlerRef {
            kind: HandlerKind::Dataset,
            locator,
        })
    }

    fn read(&self, handler_ref: &HandlerRef) -> Result<ArrayData> {
        check_kind(handler_ref, HandlerKind::Dataset)?;

        let handle = self.handle(&handler_ref.locator)?;
        let mut file = handle.file.lock();

        file.seek(SeekFrom::Start(handle.info.data_offset))?;
        let mut bytes = vec![0u8; handle.info.data_len as usize];
        file.read_exact(&mut bytes).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                StoreError::PayloadCorrupt(format!(
                    "truncated dataset: {}",
                    handler_ref.locator
                ))
            } else {
                e.into()
            }
        })?;

        ArrayData::new(handle.info.dtype, handle.info.shape.clone(), bytes)
    }

    fn delete(&self, handler_ref: &HandlerRef) -> Result<()> {
        check_kind(handler_ref, HandlerKind::Dataset)?;

        self.handles.lock().remove(&handler_ref.locator);

        match fs::remove_file(self.file_path(&handler_ref.locator)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn payload_size(&self, handler_ref: &HandlerRef) -> Result<u64> {
        check_kind(handler_ref, HandlerKind::Dataset)?;
        match fs::metadata(self.file_path(&handler_ref.locator)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn supports_partial_write(&self) -> bool {
        true
    }

    fn write_partial(&self, handler_ref: &HandlerRef, region: &Region, bytes: &[u8]) -> Result<()> {
        check_kind(handler_ref, HandlerKind::Dataset)?;

        let handle = self.handle(&handler_ref.locator)?;
        let info = &handle.info;

        region.check_within(&info.shape)?;

        let elem = info.dtype.size();
        let expected = region.element_count() as usize * elem;
        if bytes.len() != expected {
            return Err(StoreError::ShapeMismatch(format!(
                "region {:?} needs {} bytes, got {}",
                region.shape,
                expected,
                bytes.len()
            )));
        }

        let file = handle.file.lock();
        *handle.last_used.lock() = Instant::now();

        let mut mmap = unsafe { MmapMut::map_mut(&*file)? };
        let data = &mut mmap[info.data_offset as usize..(info.data_offset + info.data_len) as usize];

        copy_region(data, &info.shape, region, bytes, elem);

        mmap.flush()?;
        Ok(())
    }
}

/// Copy a row-major region buffer into the full array buffer, one contiguous
/// span per row along the last axis.
fn copy_region(data: &mut [u8], shape: &[u64], region: &Region, src: &[u8], elem: usize) {
    let rank = shape.len();

    if region.element_count() == 0 {
        return;
    }

    if rank == 0 {
        data[..src.len()].copy_from_slice(src);
        return;
    }

    // Element strides of the full array.
    let mut strides = vec![1u64; rank];
    for axis in (0..rank - 1).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }

    let row_len = region.shape[rank - 1] as usize;
    let span = row_len * elem;
    let lead_rank = rank - 1;

    // Odometer over the leading axes of the region.
    let mut idx = vec![0u64; lead_rank];
    let mut row = 0usize;
    loop {
        let mut base = region.offset[rank - 1];
        for axis in 0..lead_rank {
            base += (region.offset[axis] + idx[axis]) * strides[axis];
        }

        let dst_start = base as usize * elem;
        let src_start = row * span;
        data[dst_start..dst_start + span].copy_from_slice(&src[src_start..src_start + span]);
        row += 1;

        // Advance the odometer; done when it wraps.
        let mut axis = lead_rank;
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            idx[axis] += 1;
            if idx[axis] < region.shape[axis] {
                break;
            }
            idx[axis] = 0;
        }
    }
}
