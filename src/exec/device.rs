//! Execution devices.
//!
//! A [`Device`] is an execution context with one in-order work stream,
//! the analogue of a CUDA device plus stream pair. Without the `cuda`
//! feature, device memory lives in host RAM and the stream is serviced
//! by a dedicated worker thread, which keeps the asynchronous contract
//! (enqueue, return, synchronize) observable in CPU-only builds.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[cfg(not(feature = "cuda"))]
use tracing::info;

use crate::error::EngineError;
use crate::exec::stream::ExecStream;

/// Handle to an execution device. Clones share the device's stream;
/// create one handle per ordinal and clone it where needed.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    id: usize,
    stream: ExecStream,
    stats: DeviceStats,
}

/// Side-channel transfer counters. Observational only; nothing in the
/// engines branches on these.
#[derive(Debug, Default)]
pub struct DeviceStats {
    pub ops_enqueued: AtomicU64,
    pub bytes_moved: AtomicU64,
}

impl Device {
    /// Creates the execution context for `ordinal` and spawns its
    /// stream worker.
    pub fn new(ordinal: usize) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                id: ordinal,
                stream: ExecStream::spawn(ordinal),
                stats: DeviceStats::default(),
            }),
        }
    }

    /// Device ordinal.
    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Blocks until every kernel enqueued so far has run, surfacing
    /// the first asynchronous fault if one was latched. Faults are
    /// fatal to the in-flight step; the stream stays poisoned.
    pub fn synchronize(&self) -> Result<(), EngineError> {
        self.inner.stream.synchronize()
    }

    /// Side-channel counters for this device.
    pub fn stats(&self) -> &DeviceStats {
        &self.inner.stats
    }

    pub(crate) fn stream(&self) -> &ExecStream {
        &self.inner.stream
    }

    pub(crate) fn record_op(&self, bytes: usize) {
        self.inner.stats.ops_enqueued.fetch_add(1, Ordering::Relaxed);
        self.inner
            .stats
            .bytes_moved
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

impl PartialEq for Device {
    // Identity is the ordinal; pairwise operations require the same
    // device, not the same handle.
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device").field("id", &self.inner.id).finish()
    }
}

/// Number of CUDA devices visible to this process.
///
/// With the `cuda` feature enabled, asks the driver. Without it,
/// reports zero; host-backed devices can still be created with any
/// ordinal for CPU-only runs.
pub fn detect_device_count() -> usize {
    #[cfg(feature = "cuda")]
    {
        detect_device_count_cuda()
    }

    #[cfg(not(feature = "cuda"))]
    {
        info!("CUDA not enabled, running host-backed devices");
        0
    }
}

#[cfg(feature = "cuda")]
fn detect_device_count_cuda() -> usize {
    // Real implementation would ask cudarc for the device count and
    // bind each Device to a cudarc context and stream.
    todo!("Enumerate CUDA devices with cudarc")
}
