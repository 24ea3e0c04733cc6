//! kv-block-ops: block-level data movement for paged KV caches.
//!
//! The physical memory layer under a paged-attention serving stack.
//! Four independent engines operate on externally supplied address
//! mappings and externally owned buffers:
//!
//! - [`engine::transfer`]: bulk block copies between host and device
//! - [`engine::replicate`]: copy-on-write block replication across
//!   layer sets
//! - [`engine::scatter`]: token-major to block-major cache writes,
//!   with optional FP8 quantization on the split layout
//! - [`engine::convert`]: FP8 precision conversion between buffers
//!
//! Block allocation, eviction ordering, reference counting, and scale
//! calibration live in the scheduler above this crate. Every engine
//! enqueues its work on the owning device's stream and returns before
//! completion; callers synchronize the device before reading
//! destination buffers, and asynchronous faults surface there rather
//! than at the call site.

pub mod block;
pub mod engine;
pub mod error;
pub mod exec;

pub use block::buffer::{CacheBuffer, Location};
pub use block::dtype::{CacheFormat, DType, Encoding};
pub use block::{BlockIndex, SlotIndex};
pub use engine::convert::convert_precision;
pub use engine::replicate::replicate_blocks;
pub use engine::scatter::{scatter_flat, scatter_split};
pub use engine::transfer::transfer_blocks;
pub use error::{EngineError, ErrorKind};
pub use exec::device::Device;
