//! CPU tensor kernels for the ggjt runtime.
//!
//! Dense and dequantizing matrix multiplication plus the row-wise kernels
//! the graph executor needs. Parallelism comes from the ambient rayon pool.

pub mod gemm;
pub mod kernels;

pub use gemm::{matmul, matmul_f32, vec_dot};

/// Compile-time CPU capability flags, reported through the backend contract
/// and the system-info string.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuFeatures {
    pub avx: bool,
    pub avx2: bool,
    pub neon: bool,
    pub fma: bool,
    pub sse3: bool,
    pub blas: bool,
}

impl CpuFeatures {
    pub fn detect() -> Self {
        Self {
            avx: cfg!(target_feature = "avx"),
            avx2: cfg!(target_feature = "avx2"),
            neon: cfg!(target_feature = "neon"),
            fma: cfg!(target_feature = "fma"),
            sse3: cfg!(target_feature = "sse3"),
            // no BLAS bindings in this build; the scheduler's single-thread
            // rule keys off this flag
            blas: false,
        }
    }
}
