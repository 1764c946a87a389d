//! Compute backend contract and the CPU implementation.
//!
//! A backend owns typed buffers, moves bytes in and out of them, and executes
//! one sub-graph of named tensor ops at a time. Backends are identified by
//! name in logs; the split machinery only sees [`BackendId`] indices.

use crate::exec::ExecEnv;
use crate::graph::Split;
use ggjt_core::error::{Error, Result};
use ggjt_cpu::CpuFeatures;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// Index of a backend within a model's backend table.
pub type BackendId = usize;

/// A flat byte buffer owned by a backend. For the CPU backend this is host
/// memory; a device backend would keep a handle to device memory here.
pub struct BackendBuffer {
    data: Vec<u8>,
}

impl BackendBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Contract every compute backend fulfills.
pub trait Backend: Send + Sync {
    /// Short name used in logs ("cpu", "aux", ...).
    fn name(&self) -> &str;

    /// Whether buffers of this backend live in the host address space. Drives
    /// the loader's zero-copy and upload paths.
    fn is_ram_shared(&self) -> bool;

    fn has_blas(&self) -> bool {
        false
    }

    fn cpu_features(&self) -> CpuFeatures {
        CpuFeatures::default()
    }

    /// Allocate a buffer able to hold `size` bytes of tensor data for up to
    /// `n_tensors` tensors.
    fn alloc_buffer(&self, size: usize, n_tensors: usize) -> Result<BackendBuffer>;

    /// Upload bytes into a buffer at `offset`.
    fn tensor_set(&self, buf: &mut BackendBuffer, offset: usize, data: &[u8]) -> Result<()>;

    /// Download bytes from a buffer at `offset`.
    fn tensor_get(&self, buf: &BackendBuffer, offset: usize, out: &mut [u8]) -> Result<()>;

    /// Thread count for subsequent [`Backend::execute`] calls. Ignored by
    /// backends that schedule on device queues.
    fn set_n_threads(&self, n_threads: usize);

    /// Execute one sub-graph against the shared evaluation state.
    fn execute(&self, split: &Split, env: &mut ExecEnv) -> Result<()>;

    /// Block until all queued work and transfers are visible to the host.
    fn synchronize(&self) {}
}

/// CPU backend executing sub-graphs with the ggjt-cpu kernels on a rayon
/// pool of `n_threads` workers.
pub struct CpuBackend {
    name: &'static str,
    ram_shared: bool,
    features: CpuFeatures,
    n_threads: AtomicUsize,
    pool: RwLock<Option<rayon::ThreadPool>>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::with_name("cpu", true)
    }

    /// Secondary instance standing in for a device backend: same kernels,
    /// separate buffers, not RAM-shared, so the loader and scheduler take the
    /// upload/transfer paths.
    pub fn aux() -> Self {
        Self::with_name("aux", false)
    }

    fn with_name(name: &'static str, ram_shared: bool) -> Self {
        Self {
            name,
            ram_shared,
            features: CpuFeatures::detect(),
            n_threads: AtomicUsize::new(1),
            pool: RwLock::new(None),
        }
    }

    fn rebuild_pool(&self, n_threads: usize) -> Result<()> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build()
            .map_err(|e| Error::AllocationFailure(format!("thread pool: {}", e)))?;
        *self.pool.write().unwrap() = Some(pool);
        Ok(())
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        self.name
    }

    fn is_ram_shared(&self) -> bool {
        self.ram_shared
    }

    fn has_blas(&self) -> bool {
        self.features.blas
    }

    fn cpu_features(&self) -> CpuFeatures {
        self.features
    }

    fn alloc_buffer(&self, size: usize, _n_tensors: usize) -> Result<BackendBuffer> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| Error::AllocationFailure(format!("{} buffer of {} bytes", self.name, size)))?;
        data.resize(size, 0);
        Ok(BackendBuffer { data })
    }

    fn tensor_set(&self, buf: &mut BackendBuffer, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset + data.len();
        if end > buf.len() {
            return Err(Error::InvalidParameter(format!(
                "tensor_set out of bounds: {} > {}",
                end,
                buf.len()
            )));
        }
        buf.data[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn tensor_get(&self, buf: &BackendBuffer, offset: usize, out: &mut [u8]) -> Result<()> {
        let end = offset + out.len();
        if end > buf.len() {
            return Err(Error::InvalidParameter(format!(
                "tensor_get out of bounds: {} > {}",
                end,
                buf.len()
            )));
        }
        out.copy_from_slice(&buf.data[offset..end]);
        Ok(())
    }

    fn set_n_threads(&self, n_threads: usize) {
        let n = n_threads.max(1);
        if self.n_threads.swap(n, Ordering::SeqCst) != n {
            // pool is rebuilt lazily on the next execute
            *self.pool.write().unwrap() = None;
        }
    }

    fn execute(&self, split: &Split, env: &mut ExecEnv) -> Result<()> {
        let n = self.n_threads.load(Ordering::SeqCst);
        if self.pool.read().unwrap().is_none() {
            self.rebuild_pool(n)?;
        }
        let guard = self.pool.read().unwrap();
        let pool = guard.as_ref().expect("pool built above");
        pool.install(|| crate::exec::execute_split(split, env))
    }
}
