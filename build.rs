//! Build script for kv-block-ops.
//!
//! In a production build with the `cuda` feature, this would:
//! 1. Locate the CUDA toolkit (nvcc)
//! 2. Compile the device-side block kernels (transfer, replication,
//!    scatter, FP8 conversion) to PTX
//! 3. Embed the PTX for cudarc to load at runtime
//!
//! For now it's a placeholder; CPU-only builds run the engines on
//! host-backed devices and need no codegen.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Future: compile the .cu kernel sources when `cuda` is enabled.
    //
    // Example (when implemented):
    //
    // ```
    // let cuda_path = std::env::var("CUDA_PATH")
    //     .unwrap_or_else(|_| "/usr/local/cuda".to_string());
    // // nvcc --ptx kernels/block_ops.cu -o $OUT_DIR/block_ops.ptx
    // ```
}
