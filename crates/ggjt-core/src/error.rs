use thiserror::Error;

/// Error types shared by every ggjt crate.
///
/// Load-time and quantize-time failures abort the operation; eval failures
/// leave the context's KV cache in an unspecified state for the current batch
/// and callers should discard it.
#[derive(Error, Debug)]
pub enum Error {
    #[error("bad file magic: {0:#010x}")]
    BadMagic(u32),

    #[error("unknown (magic, version) combination: {magic:#010x}, {version}")]
    UnsupportedVersion { magic: u32, version: u32 },

    #[error("unsupported file type {0} for this file version")]
    UnsupportedFType(u32),

    #[error("tensor '{0}' is missing from model")]
    MissingTensor(String),

    #[error("tensor '{name}' has wrong shape; expected {expected}, got {actual}")]
    ShapeMismatch { name: String, expected: String, actual: String },

    #[error("file contained more tensors than expected")]
    ExtraTensors,

    #[error("invalid layer number in tensor name '{0}'")]
    InvalidLayerNumber(String),

    #[error("unrecognized tensor type {0}")]
    UnsupportedTensorType(u32),

    #[error("allocation failed: {0}")]
    AllocationFailure(String),

    #[error("arithmetic overflow in {0}")]
    ArithmeticOverflow(&'static str),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("cannot quantize tensor '{0}' with this target type")]
    QuantizeIncompatible(String),

    #[error("not implemented: {0}")]
    Unimplemented(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
