//! Inference context: KV cache, RNG, staging buffers and eval entry points.
//!
//! A context borrows an immutable model (shared between contexts) and owns
//! everything mutated by evaluation. Contexts are not thread-safe; the
//! returned logits and embeddings slices alias internal buffers valid until
//! the next eval.

use crate::backend::BackendId;
use crate::exec::ExecEnv;
use crate::graph::{build_graph, GraphParams};
use crate::kv_cache::KvCache;
use crate::model::{ContextParams, Model, DEFAULT_SEED, MB};
use crate::scheduler;
use ggjt_core::error::{Error, Result};
use ggjt_core::tensor::TensorType;
use ggjt_core::vocab::TokenId;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Compute type used for graph construction unless a caller overrides it.
pub const DEFAULT_COMPUTE_TYPE: TensorType = TensorType::F32;

pub struct Context {
    pub(crate) model: Arc<Model>,
    pub(crate) rng: StdRng,

    pub(crate) kv_self: KvCache,
    pub(crate) backend_kv: BackendId,

    logits: Vec<f32>,
    pub(crate) logits_all: bool,
    embedding: Vec<f32>,
    embedding_enabled: bool,

    tokens_in: Vec<i32>,
    embd_in: Vec<f32>,
    compute_type: TensorType,

    pub(crate) has_evaluated_once: bool,
    pub(crate) t_start: Instant,
    pub(crate) t_load_us: i64,
    pub(crate) t_sample_us: i64,
    pub(crate) t_eval_us: i64,
    pub(crate) t_p_eval_us: i64,
    pub(crate) n_sample: i32,
    pub(crate) n_eval: i32,
    pub(crate) n_p_eval: i32,
}

impl Context {
    /// Create a context over a loaded model.
    pub fn new(model: Arc<Model>, params: &ContextParams) -> Result<Self> {
        model.validate_eval_ready()?;
        if params.n_ctx < 1 {
            return Err(Error::InvalidParameter(format!("invalid n_ctx = {}", params.n_ctx)));
        }

        let seed = if params.seed == DEFAULT_SEED { wall_clock_seed() } else { params.seed };
        let rng = StdRng::seed_from_u64(seed as u64);

        // KV lives next to the majority of the layers
        let n_layer = model.hparams.n_layer;
        let backend_kv = if model.backends.len() > 1
            && params.n_gpu_layers >= n_layer / 2
            && !params.low_vram
        {
            1
        } else {
            0
        };

        let kv_type = if params.f16_kv { TensorType::F16 } else { TensorType::F32 };
        let n_ctx = model.hparams.n_ctx as usize;
        let kv_self =
            KvCache::init(model.backend(backend_kv), backend_kv, &model.hparams, kv_type, n_ctx)?;
        log::info!("kv self size  = {:7.2} MB", kv_self.tensor_bytes() as f64 / MB as f64);

        let logits_capacity =
            if params.logits_all { n_ctx * model.n_vocab() } else { model.n_vocab() };

        let ctx = Self {
            rng,
            kv_self,
            backend_kv,
            logits: Vec::with_capacity(logits_capacity),
            logits_all: params.logits_all,
            embedding: Vec::new(),
            embedding_enabled: params.embedding,
            tokens_in: vec![0; n_ctx],
            embd_in: vec![0.0; model.n_embd() * n_ctx],
            compute_type: DEFAULT_COMPUTE_TYPE,
            has_evaluated_once: false,
            t_start: model.t_start,
            t_load_us: model.t_load_us,
            t_sample_us: 0,
            t_eval_us: 0,
            t_p_eval_us: 0,
            n_sample: 0,
            n_eval: 0,
            n_p_eval: 0,
            model,
        };

        ctx.log_backend_assignment();
        Ok(ctx)
    }

    /// Load a model and create a context over it in one step.
    pub fn load(path: impl AsRef<std::path::Path>, params: &ContextParams) -> Result<Self> {
        let model = Arc::new(Model::load(path, params)?);
        Self::new(model, params)
    }

    fn log_backend_assignment(&self) {
        let model = &self.model;
        let mut report = format!("input: {}, ", model.backend(model.backend_inp).name());
        let mut start = 0usize;
        let layers = &model.backend_layers;
        for i in 1..=layers.len() {
            if i == layers.len() || layers[i] != layers[start] {
                if start == i - 1 {
                    report.push_str(&format!("layer {}: {}, ", start, model.backend(layers[start]).name()));
                } else {
                    report.push_str(&format!(
                        "layers {}-{}: {}, ",
                        start,
                        i - 1,
                        model.backend(layers[start]).name()
                    ));
                }
                start = i;
            }
        }
        report.push_str(&format!(
            "output: {}, kv: {}",
            model.backend(model.backend_out).name(),
            model.backend(self.backend_kv).name()
        ));
        log::info!("layer backends: {}", report);
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn n_vocab(&self) -> usize {
        self.model.n_vocab()
    }

    pub fn n_ctx(&self) -> usize {
        self.model.n_ctx()
    }

    pub fn n_embd(&self) -> usize {
        self.model.n_embd()
    }

    /// Number of tokens currently in the KV cache.
    pub fn kv_cache_token_count(&self) -> usize {
        self.kv_self.n
    }

    pub fn set_rng_seed(&mut self, seed: u32) {
        let seed = if seed == DEFAULT_SEED { wall_clock_seed() } else { seed };
        self.rng = StdRng::seed_from_u64(seed as u64);
    }

    /// Process a batch of tokens at position `n_past`.
    pub fn eval_tokens(&mut self, tokens: &[TokenId], n_past: usize, n_threads: usize) -> Result<()> {
        self.eval_internal(Some(tokens), None, n_past, n_threads)
    }

    /// Process a batch of pre-computed input embeddings (`n_embd` floats per
    /// token) at position `n_past`.
    pub fn eval_embeddings(&mut self, embd: &[f32], n_past: usize, n_threads: usize) -> Result<()> {
        self.eval_internal(None, Some(embd), n_past, n_threads)
    }

    fn eval_internal(
        &mut self,
        tokens: Option<&[TokenId]>,
        embd: Option<&[f32]>,
        n_past: usize,
        n_threads: usize,
    ) -> Result<()> {
        self.model.validate_eval_ready()?;
        let t_start_us = Instant::now();

        let n_embd = self.model.n_embd();
        let n_tokens = match (tokens, embd) {
            (Some(t), None) => t.len(),
            (None, Some(e)) => {
                if e.len() % n_embd != 0 {
                    return Err(Error::InvalidParameter(format!(
                        "embedding input of {} floats is not a multiple of n_embd = {}",
                        e.len(),
                        n_embd
                    )));
                }
                e.len() / n_embd
            }
            _ => {
                return Err(Error::InvalidParameter(
                    "exactly one of tokens and embeddings must be provided".into(),
                ))
            }
        };
        if n_tokens == 0 {
            return Err(Error::InvalidParameter("empty batch".into()));
        }
        if n_past + n_tokens > self.n_ctx() {
            return Err(Error::InvalidParameter(format!(
                "kv cache overflow: {} + {} > {}",
                n_past,
                n_tokens,
                self.n_ctx()
            )));
        }

        // stage the inputs
        if let Some(tokens) = tokens {
            self.tokens_in[..n_tokens].copy_from_slice(tokens);
        } else if let Some(embd) = embd {
            self.embd_in[..n_tokens * n_embd].copy_from_slice(embd);
        }

        let model = Arc::clone(&self.model);
        let graph = build_graph(
            model.as_ref(),
            &GraphParams {
                n_tokens,
                n_past,
                embeddings_input: embd.is_some(),
                compute_type: self.compute_type,
                logits_all: self.logits_all,
                want_embeddings: self.embedding_enabled,
                backend_kv: self.backend_kv,
            },
        )?;

        let mut env = ExecEnv::new(
            &graph,
            model.as_ref(),
            &mut self.kv_self,
            &self.tokens_in,
            &self.embd_in,
            &mut self.logits,
            &mut self.embedding,
        );
        scheduler::execute(&graph, model.as_ref(), &mut env, n_threads)?;

        // update kv token count
        self.kv_self.n = n_past + n_tokens;

        let elapsed = t_start_us.elapsed().as_micros() as i64;
        if n_tokens == 1 {
            self.t_eval_us += elapsed;
            self.n_eval += 1;
        } else {
            self.t_p_eval_us += elapsed;
            self.n_p_eval += n_tokens as i32;
        }
        if !self.has_evaluated_once {
            self.t_load_us = self.t_start.elapsed().as_micros() as i64;
            self.has_evaluated_once = true;
        }
        Ok(())
    }

    /// Logits of the last eval: `n_vocab` floats, or `n_vocab * n_tokens`
    /// when the context was created with `logits_all`.
    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    /// Hidden-state embedding of the last evaluated token (`n_embd` floats).
    /// Empty unless the context was created with `embedding` set.
    pub fn embeddings(&self) -> &[f32] {
        &self.embedding
    }

    pub fn tokenize(&self, text: &str, add_bos: bool) -> Vec<TokenId> {
        self.model.tokenize(text, add_bos)
    }

    pub fn token_to_bytes(&self, id: TokenId) -> Option<&[u8]> {
        self.model.token_to_bytes(id)
    }
}

fn wall_clock_seed() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
