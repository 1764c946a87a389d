//! Core primitives for the ggjt runtime.
//!
//! This crate provides the pieces of the runtime that do not depend on a
//! compute backend:
//! - the GGML/GGMF/GGJT model file codec
//! - tensor types and quantization block codecs
//! - the scored-merge tokenizer and its vocabulary
//! - memory-mapping support for zero-copy weight loading

pub mod error;
pub mod formats;
pub mod mmap;
pub mod quant;
pub mod tensor;
pub mod tokenizer;
pub mod vocab;

pub use error::{Error, Result};
pub use formats::ggjt::{FType, FileVersion, GgjtParser, GgjtWriter, HParams, ModelFile};
pub use tensor::{TensorDesc, TensorType};
pub use tokenizer::tokenize;
pub use vocab::{TokenId, Vocabulary, TOKEN_BOS, TOKEN_EOS, TOKEN_NL, TOKEN_UNK};

/// Core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
