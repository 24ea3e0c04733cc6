//! Cache buffer handles.
//!
//! A [`CacheBuffer`] wraps block-structured storage with a dtype tag,
//! a shape, and a residency. Handles are cheap to clone and share the
//! same storage, the way device pointers are passed around a serving
//! stack. Host buffers expose typed element access; device contents
//! are reachable only through engine operations, so a CPU-only build
//! keeps the same access discipline a real device would enforce.
//!
//! Allocation and lifetime policy belong to the scheduler that created
//! the buffer; the engines only read mappings and mutate contents in
//! place.

use std::sync::{Arc, Mutex, PoisonError};

use bytemuck::Pod;

use crate::block::dtype::DType;
use crate::error::EngineError;
use crate::exec::device::Device;

/// Where a buffer's bytes live.
#[derive(Debug, Clone)]
pub enum Location {
    /// Host RAM; contents are directly accessible to the caller.
    Host,
    /// Device memory; contents move only through engine operations.
    Device(Device),
}

impl Location {
    pub fn is_host(&self) -> bool {
        matches!(self, Location::Host)
    }

    pub fn device(&self) -> Option<&Device> {
        match self {
            Location::Host => None,
            Location::Device(d) => Some(d),
        }
    }
}

/// Raw bytes behind a buffer. Backed by u64 cells so typed views of
/// every supported dtype are aligned. The lock exists for memory
/// safety of the host-backed execution model and provides no ordering
/// guarantees between submissions.
#[derive(Debug)]
pub(crate) struct Storage {
    bytes: Mutex<AlignedBytes>,
}

#[derive(Debug)]
struct AlignedBytes {
    cells: Box<[u64]>,
    len: usize,
}

impl AlignedBytes {
    fn new(len: usize) -> Self {
        Self {
            cells: vec![0u64; len.div_ceil(8)].into_boxed_slice(),
            len,
        }
    }

    fn as_slice(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.cells[..])[..self.len]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.cells[..])[..self.len]
    }
}

impl Storage {
    fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(AlignedBytes::new(len)),
        }
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        f(guard.as_slice())
    }

    pub(crate) fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        f(guard.as_mut_slice())
    }
}

/// Block-structured cache storage with a dtype tag and residency.
///
/// The first shape dimension is always the block count; the trailing
/// dimensions describe one block's layout.
#[derive(Debug, Clone)]
pub struct CacheBuffer {
    storage: Arc<Storage>,
    dtype: DType,
    shape: Vec<usize>,
    location: Location,
}

impl CacheBuffer {
    fn new(dtype: DType, shape: &[usize], location: Location) -> Self {
        let len = shape.iter().product::<usize>() * dtype.size();
        Self {
            storage: Arc::new(Storage::new(len)),
            dtype,
            shape: shape.to_vec(),
            location,
        }
    }

    /// Zero-filled host buffer.
    pub fn host(dtype: DType, shape: &[usize]) -> Self {
        Self::new(dtype, shape, Location::Host)
    }

    /// Zero-filled buffer resident on `device`.
    pub fn device(dtype: DType, shape: &[usize], device: &Device) -> Self {
        Self::new(dtype, shape, Location::Device(device.clone()))
    }

    /// Host buffer initialized from typed elements.
    pub fn from_elems<T: Pod>(
        dtype: DType,
        shape: &[usize],
        elems: &[T],
    ) -> Result<Self, EngineError> {
        let buf = Self::host(dtype, shape);
        buf.write_elems(elems)?;
        Ok(buf)
    }

    /// Device buffer initialized from host elements, the way a
    /// scheduler stages initial contents (allocate plus upload).
    pub fn device_from_elems<T: Pod>(
        dtype: DType,
        shape: &[usize],
        elems: &[T],
        device: &Device,
    ) -> Result<Self, EngineError> {
        let buf = Self::device(dtype, shape, device);
        buf.check_elem_width::<T>()?;
        if elems.len() != buf.num_elems() {
            return Err(EngineError::ElemCountMismatch {
                expected: buf.num_elems(),
                actual: elems.len(),
            });
        }
        // The handle has not escaped yet, so no stream work can
        // reference this storage.
        buf.storage
            .with_mut(|bytes| bytes.copy_from_slice(bytemuck::cast_slice(elems)));
        Ok(buf)
    }

    /// Copies a host buffer's contents out as typed elements.
    pub fn to_elems<T: Pod>(&self) -> Result<Vec<T>, EngineError> {
        if !self.location.is_host() {
            return Err(EngineError::HostOnly {
                op: "reading buffer contents",
            });
        }
        self.check_elem_width::<T>()?;
        Ok(self
            .storage
            .with(|bytes| bytemuck::cast_slice::<u8, T>(bytes).to_vec()))
    }

    /// Overwrites a host buffer's contents from typed elements.
    pub fn write_elems<T: Pod>(&self, elems: &[T]) -> Result<(), EngineError> {
        if !self.location.is_host() {
            return Err(EngineError::HostOnly {
                op: "writing buffer contents",
            });
        }
        self.check_elem_width::<T>()?;
        if elems.len() != self.num_elems() {
            return Err(EngineError::ElemCountMismatch {
                expected: self.num_elems(),
                actual: elems.len(),
            });
        }
        self.storage
            .with_mut(|bytes| bytes.copy_from_slice(bytemuck::cast_slice(elems)));
        Ok(())
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Number of blocks (first shape dimension).
    pub fn num_blocks(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Elements per block (product of the trailing dimensions).
    pub fn elems_per_block(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Total element count.
    pub fn num_elems(&self) -> usize {
        self.shape.iter().product()
    }

    /// Bytes per block: element size times elements per block.
    pub fn block_bytes(&self) -> usize {
        self.elems_per_block() * self.dtype.size()
    }

    /// Total byte length.
    pub fn len_bytes(&self) -> usize {
        self.num_elems() * self.dtype.size()
    }

    /// Whether two handles share the same underlying storage.
    pub fn aliases(&self, other: &CacheBuffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    pub(crate) fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    fn check_elem_width<T: Pod>(&self) -> Result<(), EngineError> {
        if std::mem::size_of::<T>() != self.dtype.size() {
            return Err(EngineError::ElemWidthMismatch {
                dtype: self.dtype,
                width: std::mem::size_of::<T>(),
            });
        }
        Ok(())
    }
}
