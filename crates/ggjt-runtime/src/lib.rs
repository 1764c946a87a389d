//! Inference runtime for GGML/GGMF/GGJT LLaMA-family models.
//!
//! Loads quantized weights into one or more compute backends, builds a split
//! computation graph over a persistent KV cache for every batch, and exposes
//! the model through [`Model`] and [`Context`].
//!
//! ```no_run
//! use ggjt_runtime::{backend_init, Context, ContextParams};
//!
//! backend_init(false);
//! let params = ContextParams::default();
//! let mut ctx = Context::load("7B/ggml-model-q5_1.bin", &params)?;
//! let tokens = ctx.tokenize("The quick brown fox", true);
//! ctx.eval_tokens(&tokens, 0, 4)?;
//! let logits = ctx.logits();
//! # Ok::<(), ggjt_core::error::Error>(())
//! ```

pub mod backend;
pub mod context;
mod exec;
pub mod graph;
pub mod kv_cache;
mod loader;
pub mod model;
pub mod quantize;
pub mod sampling;
pub mod scheduler;
pub mod session;
pub mod timings;

pub use context::Context;
pub use ggjt_core::error::{Error, Result};
pub use ggjt_core::formats::ggjt::{FType, FileVersion, HParams};
pub use ggjt_core::vocab::{TokenId, TOKEN_BOS, TOKEN_EOS, TOKEN_NL, TOKEN_UNK};
pub use model::{ContextParams, Model, ModelSize, DEFAULT_SEED};
pub use quantize::{quantize_model, QuantizeParams};
pub use sampling::{TokenData, TokenDataArray};
pub use session::{SESSION_MAGIC, SESSION_VERSION};
pub use timings::Timings;

use std::sync::atomic::{AtomicBool, Ordering};

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static NUMA: AtomicBool = AtomicBool::new(false);

/// Process-wide backend initialization. Call once before loading models;
/// `numa` disables page prefaulting so first-touch placement works.
pub fn backend_init(numa: bool) {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        log::warn!("backend_init called more than once");
        return;
    }
    NUMA.store(numa, Ordering::SeqCst);
}

/// Process-wide teardown; the counterpart of [`backend_init`].
pub fn backend_free() {
    INITIALIZED.store(false, Ordering::SeqCst);
}

pub(crate) fn numa_enabled() -> bool {
    NUMA.load(Ordering::SeqCst)
}

/// Capability report for CLI banners.
pub fn system_info() -> String {
    let f = ggjt_cpu::CpuFeatures::detect();
    format!(
        "AVX = {} | AVX2 = {} | FMA = {} | NEON = {} | SSE3 = {} | BLAS = {} | mmap = 1 | mlock = 1",
        f.avx as u8, f.avx2 as u8, f.fma as u8, f.neon as u8, f.sse3 as u8, f.blas as u8
    )
}
