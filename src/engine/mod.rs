//! The four data-movement engines.
//!
//! Each engine is a pure data-movement or transform primitive over
//! externally supplied address mappings. None depends on another; all
//! enqueue their work on the owning device's stream and return before
//! completion.
//!
//! - [`transfer`]: bulk block copies between host and device buffers
//! - [`replicate`]: copy-on-write block replication across layer sets
//! - [`scatter`]: token-major to block-major cache writes
//! - [`convert`]: FP8 precision conversion between cache buffers

pub mod convert;
pub mod replicate;
pub mod scatter;
pub mod transfer;

use crate::block::buffer::{CacheBuffer, Location};
use crate::error::EngineError;
use crate::exec::device::Device;

/// Resolves the single device shared by a set of buffers that must all
/// be device-resident.
pub(crate) fn common_device(
    buffers: &[&CacheBuffer],
    op: &'static str,
) -> Result<Device, EngineError> {
    let mut device: Option<Device> = None;
    for buf in buffers {
        match buf.location() {
            Location::Host => return Err(EngineError::DeviceOnly { op }),
            Location::Device(d) => match &device {
                None => device = Some(d.clone()),
                Some(first) if first == d => {}
                Some(first) => {
                    return Err(EngineError::DeviceMismatch {
                        src: first.id(),
                        dst: d.id(),
                    })
                }
            },
        }
    }
    device.ok_or(EngineError::NoDeviceSide)
}
