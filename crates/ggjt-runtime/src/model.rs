//! Model weights, hyper-parameters and the per-tensor backend assignment.

use crate::backend::{Backend, BackendBuffer, BackendId};
use ggjt_core::error::{Error, Result};
use ggjt_core::formats::ggjt::HParams;
use ggjt_core::mmap::ModelMapping;
use ggjt_core::tensor::TensorType;
use ggjt_core::tokenizer;
use ggjt_core::vocab::{TokenId, Vocabulary};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * 1024;

/// Seed value requesting a wall-clock seed.
pub const DEFAULT_SEED: u32 = 0xFFFF_FFFF;

/// Size class inferred from the layer count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSize {
    Model3B,
    Model7B,
    Model13B,
    Model30B,
    Model65B,
    Unknown,
}

impl ModelSize {
    pub fn from_n_layer(n_layer: u32) -> Self {
        match n_layer {
            26 => ModelSize::Model3B,
            32 => ModelSize::Model7B,
            40 => ModelSize::Model13B,
            60 => ModelSize::Model30B,
            80 => ModelSize::Model65B,
            n if n < 32 => ModelSize::Model7B,
            _ => ModelSize::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelSize::Model3B => "3B",
            ModelSize::Model7B => "7B",
            ModelSize::Model13B => "13B",
            ModelSize::Model30B => "30B",
            ModelSize::Model65B => "65B",
            ModelSize::Unknown => "unknown",
        }
    }

    /// Nominal compute-buffer size for one eval, measured at n_ctx = 2048.
    pub fn mem_req_eval(&self) -> usize {
        match self {
            ModelSize::Model3B => 512 * MB,
            ModelSize::Model7B | ModelSize::Unknown => 2048 * MB,
            ModelSize::Model13B => 1024 * MB,
            ModelSize::Model30B => 1280 * MB,
            ModelSize::Model65B => 1536 * MB,
        }
    }

    /// Nominal KV-cache footprint per state, sized at n_ctx = 2048.
    pub fn mem_req_kv_self(&self) -> usize {
        match self {
            ModelSize::Model3B => 682 * MB,
            ModelSize::Model7B | ModelSize::Unknown => 1026 * MB,
            ModelSize::Model13B => 1608 * MB,
            ModelSize::Model30B => 3124 * MB,
            ModelSize::Model65B => 5120 * MB,
        }
    }
}

/// Parameters for model loading and context creation.
pub struct ContextParams {
    pub seed: u32,
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_gpu_layers: u32,
    pub main_gpu: u32,
    pub tensor_split: Vec<f32>,
    pub rope_freq_base: f32,
    pub rope_freq_scale: f32,
    pub progress_callback: Option<Box<dyn Fn(f32) + Send + Sync>>,
    pub low_vram: bool,
    pub f16_kv: bool,
    pub logits_all: bool,
    pub vocab_only: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub embedding: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            n_ctx: 512,
            n_batch: 512,
            n_gpu_layers: 0,
            main_gpu: 0,
            tensor_split: Vec::new(),
            rope_freq_base: 10000.0,
            rope_freq_scale: 1.0,
            progress_callback: None,
            low_vram: false,
            f16_kv: true,
            logits_all: false,
            vocab_only: false,
            use_mmap: true,
            use_mlock: false,
            embedding: false,
        }
    }
}

/// Index of a weight tensor in the model's file-order table.
pub type WeightId = usize;

#[derive(Debug, Clone, Copy)]
pub enum WeightLoc {
    /// Offset into the owning backend's buffer.
    Buffer { offset: usize },
    /// Offset into the memory-mapped file.
    Mapped { offset: usize },
}

#[derive(Debug)]
pub struct WeightTensor {
    pub name: String,
    pub dtype: TensorType,
    pub ne: Vec<u32>,
    pub size: usize,
    pub backend: BackendId,
    pub loc: WeightLoc,
}

/// Weight handles for one decoder layer.
#[derive(Debug, Clone, Copy)]
pub struct LayerWeights {
    pub attention_norm: WeightId,
    pub wq: WeightId,
    pub wk: WeightId,
    pub wv: WeightId,
    pub wo: WeightId,
    pub ffn_norm: WeightId,
    pub w1: WeightId,
    pub w2: WeightId,
    pub w3: WeightId,
}

/// An immutable loaded model. Sharable between contexts.
pub struct Model {
    pub hparams: HParams,
    pub vocab: Vocabulary,
    pub size: ModelSize,
    pub n_gpu_layers: u32,

    pub(crate) backends: Vec<Arc<dyn Backend>>,
    pub backend_inp: BackendId,
    pub backend_out: BackendId,
    pub backend_layers: Vec<BackendId>,

    pub(crate) buffers: Vec<BackendBuffer>,
    pub(crate) mapping: Option<ModelMapping>,
    pub(crate) tensors: Vec<WeightTensor>,

    pub tok_embeddings: WeightId,
    pub norm: WeightId,
    pub output: WeightId,
    pub layers: Vec<LayerWeights>,

    pub(crate) t_start: Instant,
    pub(crate) t_load_us: i64,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("hparams", &self.hparams)
            .field("size", &self.size)
            .field("n_gpu_layers", &self.n_gpu_layers)
            .finish_non_exhaustive()
    }
}

impl Model {
    /// Load a model file, map or read its weights into per-backend buffers.
    pub fn load(path: impl AsRef<Path>, params: &ContextParams) -> Result<Model> {
        crate::loader::load_model(path.as_ref(), params)
    }

    pub fn n_vocab(&self) -> usize {
        self.vocab.n_vocab()
    }

    pub fn n_ctx(&self) -> usize {
        self.hparams.n_ctx as usize
    }

    pub fn n_embd(&self) -> usize {
        self.hparams.n_embd as usize
    }

    /// True when the model was loaded with `vocab_only` and carries no
    /// weights or backends.
    pub fn is_vocab_only(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn tokenize(&self, text: &str, add_bos: bool) -> Vec<TokenId> {
        tokenizer::tokenize(&self.vocab, text, add_bos)
    }

    pub fn token_to_bytes(&self, id: TokenId) -> Option<&[u8]> {
        self.vocab.token_bytes(id)
    }

    /// Vocabulary entries as `(bytes, score)` pairs, id order.
    pub fn get_vocab(&self) -> impl Iterator<Item = (&[u8], f32)> {
        self.vocab.iter().map(|t| (t.text.as_slice(), t.score))
    }

    pub(crate) fn backend(&self, id: BackendId) -> &dyn Backend {
        self.backends[id].as_ref()
    }

    pub(crate) fn weight(&self, id: WeightId) -> &WeightTensor {
        &self.tensors[id]
    }

    /// Raw encoded bytes of a weight tensor, wherever they live.
    pub(crate) fn weight_bytes(&self, id: WeightId) -> &[u8] {
        let t = &self.tensors[id];
        match t.loc {
            WeightLoc::Buffer { offset } => {
                &self.buffers[t.backend].as_slice()[offset..offset + t.size]
            }
            WeightLoc::Mapped { offset } => {
                let map = self.mapping.as_ref().expect("mapped tensor without a mapping");
                &map.as_slice()[offset..offset + t.size]
            }
        }
    }

    /// Dequantize a whole weight tensor to f32 (norm vectors and similar
    /// small tensors only; matmuls read rows lazily).
    pub(crate) fn weight_f32(&self, id: WeightId) -> Result<Vec<f32>> {
        let t = &self.tensors[id];
        let n: usize = t.ne.iter().map(|&d| d as usize).product();
        let mut out = vec![0.0f32; n];
        ggjt_core::quant::dequantize_row(t.dtype, self.weight_bytes(id), &mut out)?;
        Ok(out)
    }

    /// For internal test use: tensors as `(name, encoded bytes)` in file order.
    pub fn tensors_by_name(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.tensors.iter().enumerate().map(|(i, t)| (t.name.as_str(), self.weight_bytes(i)))
    }

    pub(crate) fn validate_eval_ready(&self) -> Result<()> {
        if self.is_vocab_only() {
            return Err(Error::InvalidParameter(
                "model was loaded with vocab_only and cannot evaluate".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes() {
        assert_eq!(ModelSize::from_n_layer(26), ModelSize::Model3B);
        assert_eq!(ModelSize::from_n_layer(32), ModelSize::Model7B);
        assert_eq!(ModelSize::from_n_layer(40), ModelSize::Model13B);
        assert_eq!(ModelSize::from_n_layer(60), ModelSize::Model30B);
        assert_eq!(ModelSize::from_n_layer(80), ModelSize::Model65B);
        // small models fall back to the 7B class
        assert_eq!(ModelSize::from_n_layer(2), ModelSize::Model7B);
        assert_eq!(ModelSize::from_n_layer(48), ModelSize::Unknown);
    }

    #[test]
    fn default_params_match_reference() {
        let p = ContextParams::default();
        assert_eq!(p.seed, DEFAULT_SEED);
        assert_eq!(p.n_ctx, 512);
        assert_eq!(p.n_batch, 512);
        assert!(p.f16_kv);
        assert!(p.use_mmap);
        assert!(!p.use_mlock);
        assert!(!p.logits_all);
    }
}
