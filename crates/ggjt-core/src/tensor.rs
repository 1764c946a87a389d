use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Tensor data types found in GGML-family model files.
///
/// The discriminants are the on-disk type words.
#[allow(non_camel_case_types)]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TensorType {
    F32 = 0,
    F16 = 1,
    Q4_0 = 2,
    Q4_1 = 3,
    Q5_0 = 6,
    Q5_1 = 7,
    Q8_0 = 8,
    Q2_K = 10,
    Q3_K = 11,
    Q4_K = 12,
    Q5_K = 13,
    Q6_K = 14,
}

impl TensorType {
    pub fn from_u32(v: u32) -> Result<Self> {
        use TensorType::*;
        Ok(match v {
            0 => F32,
            1 => F16,
            2 => Q4_0,
            3 => Q4_1,
            6 => Q5_0,
            7 => Q5_1,
            8 => Q8_0,
            10 => Q2_K,
            11 => Q3_K,
            12 => Q4_K,
            13 => Q5_K,
            14 => Q6_K,
            other => return Err(Error::UnsupportedTensorType(other)),
        })
    }

    /// Elements per quantization block (1 for scalar types).
    pub fn block_size(&self) -> usize {
        use TensorType::*;
        match self {
            F32 | F16 => 1,
            Q4_0 | Q4_1 | Q5_0 | Q5_1 | Q8_0 => 32,
            Q2_K | Q3_K | Q4_K | Q5_K | Q6_K => crate::quant::QK_K,
        }
    }

    /// Bytes occupied by one block.
    pub fn type_size(&self) -> usize {
        use TensorType::*;
        match self {
            F32 => 4,
            F16 => 2,
            Q4_0 => 18,  // f16 scale + 16 packed bytes
            Q4_1 => 20,  // f16 scale + f16 min + 16 packed bytes
            Q5_0 => 22,  // f16 scale + 4 high bits + 16 packed bytes
            Q5_1 => 24,
            Q8_0 => 34,  // f16 scale + 32 bytes
            Q2_K => 84,
            Q3_K => 110,
            Q4_K => 144,
            Q5_K => 176,
            Q6_K => 210,
        }
    }

    pub fn is_quantized(&self) -> bool {
        !matches!(self, TensorType::F32 | TensorType::F16)
    }

    pub fn name(&self) -> &'static str {
        use TensorType::*;
        match self {
            F32 => "f32",
            F16 => "f16",
            Q4_0 => "q4_0",
            Q4_1 => "q4_1",
            Q5_0 => "q5_0",
            Q5_1 => "q5_1",
            Q8_0 => "q8_0",
            Q2_K => "q2_K",
            Q3_K => "q3_K",
            Q4_K => "q4_K",
            Q5_K => "q5_K",
            Q6_K => "q6_K",
        }
    }
}

/// Byte size of a tensor with the given element counts, with overflow checks.
///
/// The element count must be divisible by the type's block size.
pub fn tensor_size(ne: &[u32], dtype: TensorType) -> Result<u64> {
    let mut size = dtype.type_size() as u64;
    for &dim in ne {
        size = size
            .checked_mul(dim as u64)
            .ok_or(Error::ArithmeticOverflow("tensor size"))?;
    }
    let blck = dtype.block_size() as u64;
    if blck == 0 || size % blck != 0 {
        return Err(Error::ArithmeticOverflow("tensor block division"));
    }
    Ok(size / blck)
}

/// Metadata for one tensor as declared in a model file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorDesc {
    pub name: String,
    pub dtype: TensorType,
    /// Element counts, innermost dimension first. One or two dimensions.
    pub ne: Vec<u32>,
    /// Absolute byte offset of the payload in the file.
    pub file_off: u64,
    /// Payload size in bytes.
    pub size: u64,
}

impl TensorDesc {
    pub fn new(name: String, dtype: TensorType, ne: Vec<u32>, file_off: u64) -> Result<Self> {
        if ne.is_empty() || ne.len() > 2 {
            return Err(Error::InvalidParameter(format!(
                "tensor '{}' should not be {}-dimensional",
                name,
                ne.len()
            )));
        }
        let size = tensor_size(&ne, dtype)?;
        Ok(Self { name, dtype, ne, file_off, size })
    }

    pub fn n_elements(&self) -> usize {
        self.ne.iter().map(|&d| d as usize).product()
    }

    /// Shape rendered the way the loader reports mismatches, e.g. `4096 x 32000`.
    pub fn shape_string(ne: &[u32]) -> String {
        ne.iter().map(|d| format!("{:5}", d)).collect::<Vec<_>>().join(" x ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_words_round_trip() {
        for ty in [
            TensorType::F32,
            TensorType::F16,
            TensorType::Q4_0,
            TensorType::Q4_1,
            TensorType::Q5_0,
            TensorType::Q5_1,
            TensorType::Q8_0,
            TensorType::Q2_K,
            TensorType::Q3_K,
            TensorType::Q4_K,
            TensorType::Q5_K,
            TensorType::Q6_K,
        ] {
            assert_eq!(TensorType::from_u32(ty as u32).unwrap(), ty);
        }
        assert!(TensorType::from_u32(9).is_err());
        assert!(TensorType::from_u32(255).is_err());
    }

    #[test]
    fn size_arithmetic() {
        // 4096 x 4096 f16
        assert_eq!(tensor_size(&[4096, 4096], TensorType::F16).unwrap(), 4096 * 4096 * 2);
        // Q4_0: 32 elements -> 18 bytes
        assert_eq!(tensor_size(&[32], TensorType::Q4_0).unwrap(), 18);
        assert_eq!(tensor_size(&[4096, 64], TensorType::Q4_0).unwrap(), 4096 * 64 / 32 * 18);
        // Q6_K super-blocks
        assert_eq!(tensor_size(&[256], TensorType::Q6_K).unwrap(), 210);
        // element count not divisible by block size
        assert!(tensor_size(&[33], TensorType::Q4_0).is_err());
    }

    #[test]
    fn size_overflow_is_reported() {
        let err = tensor_size(&[u32::MAX, u32::MAX, u32::MAX], TensorType::F32);
        assert!(matches!(err, Err(Error::ArithmeticOverflow(_))));
    }

    #[test]
    fn desc_rejects_bad_dims() {
        assert!(TensorDesc::new("t".into(), TensorType::F32, vec![], 0).is_err());
        assert!(TensorDesc::new("t".into(), TensorType::F32, vec![1, 2, 3], 0).is_err());
    }
}
