//! Self-attention key/value cache.
//!
//! Two contiguous arenas, each `n_embd * n_layer * n_ctx` elements of f16 or
//! f32. Layer `l` owns element slots `[l*n_ctx, (l+1)*n_ctx)` along the
//! sequence axis of both tensors; entries past the logical fill `n` are
//! undefined.

use crate::backend::{Backend, BackendBuffer, BackendId};
use crate::model::MB;
use ggjt_core::error::{Error, Result};
use ggjt_core::formats::ggjt::HParams;
use ggjt_core::tensor::TensorType;

pub struct KvCache {
    pub dtype: TensorType,
    pub backend: BackendId,
    pub n_ctx: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    /// Number of tokens currently in the cache.
    pub n: usize,
    buf: BackendBuffer,
    k_offset: usize,
    v_offset: usize,
    bytes_per_tensor: usize,
}

impl KvCache {
    pub fn init(
        backend: &dyn Backend,
        backend_id: BackendId,
        hparams: &HParams,
        dtype: TensorType,
        n_ctx: usize,
    ) -> Result<Self> {
        if !matches!(dtype, TensorType::F16 | TensorType::F32) {
            return Err(Error::InvalidParameter("kv cache must be f16 or f32".into()));
        }
        let n_embd = hparams.n_embd as usize;
        let n_layer = hparams.n_layer as usize;
        let n_mem = n_layer * n_ctx;
        let n_elements = n_embd * n_mem;
        let elem_size = dtype.type_size();

        let bytes_per_tensor = n_elements * elem_size;
        let size = 2 * bytes_per_tensor + 2 * MB;
        let buf = backend.alloc_buffer(size, 2)?;

        Ok(Self {
            dtype,
            backend: backend_id,
            n_ctx,
            n_embd,
            n_layer,
            n: 0,
            buf,
            k_offset: 0,
            v_offset: bytes_per_tensor,
            bytes_per_tensor,
        })
    }

    pub fn elem_size(&self) -> usize {
        self.dtype.type_size()
    }

    /// Total bytes held by the two cache tensors.
    pub fn tensor_bytes(&self) -> usize {
        2 * self.bytes_per_tensor
    }

    pub fn k(&self) -> &[u8] {
        &self.buf.as_slice()[self.k_offset..self.k_offset + self.bytes_per_tensor]
    }

    pub fn v(&self) -> &[u8] {
        &self.buf.as_slice()[self.v_offset..self.v_offset + self.bytes_per_tensor]
    }

    pub fn k_mut(&mut self) -> &mut [u8] {
        let (off, len) = (self.k_offset, self.bytes_per_tensor);
        &mut self.buf.as_mut_slice()[off..off + len]
    }

    pub fn v_mut(&mut self) -> &mut [u8] {
        let (off, len) = (self.v_offset, self.bytes_per_tensor);
        &mut self.buf.as_mut_slice()[off..off + len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;

    fn tiny_hparams() -> HParams {
        HParams { n_embd: 8, n_layer: 2, ..HParams::default() }
    }

    #[test]
    fn arena_layout() {
        let backend = CpuBackend::new();
        let cache = KvCache::init(&backend, 0, &tiny_hparams(), TensorType::F16, 16).unwrap();
        assert_eq!(cache.n, 0);
        // 8 embd * 2 layers * 16 ctx * 2 bytes per tensor
        assert_eq!(cache.tensor_bytes(), 2 * 8 * 2 * 16 * 2);
        assert_eq!(cache.k().len(), cache.v().len());
    }

    #[test]
    fn f32_cache_doubles_storage() {
        let backend = CpuBackend::new();
        let half = KvCache::init(&backend, 0, &tiny_hparams(), TensorType::F16, 16).unwrap();
        let full = KvCache::init(&backend, 0, &tiny_hparams(), TensorType::F32, 16).unwrap();
        assert_eq!(full.tensor_bytes(), 2 * half.tensor_bytes());
    }

    #[test]
    fn rejects_quantized_cache_type() {
        let backend = CpuBackend::new();
        assert!(KvCache::init(&backend, 0, &tiny_hparams(), TensorType::Q4_0, 16).is_err());
    }
}
