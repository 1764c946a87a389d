//! Matrix multiplication kernels.
//!
//! Weight matrices stay in their on-disk encoding; rows are dequantized on
//! the fly into a per-thread block buffer and dotted against f32 activations.

use ggjt_core::error::{Error, Result};
use ggjt_core::quant::{dequantize_row, QK_K};
use ggjt_core::tensor::TensorType;
use half::f16;
use rayon::prelude::*;

/// Dot product of one encoded row against an f32 vector of the same length.
pub fn vec_dot(dtype: TensorType, row: &[u8], x: &[f32]) -> Result<f32> {
    match dtype {
        TensorType::F32 => {
            let mut sum = 0.0f32;
            for (chunk, &b) in row.chunks_exact(4).zip(x.iter()) {
                sum += f32::from_le_bytes(chunk.try_into().unwrap()) * b;
            }
            Ok(sum)
        }
        TensorType::F16 => {
            let mut sum = 0.0f32;
            for (chunk, &b) in row.chunks_exact(2).zip(x.iter()) {
                let a = f16::from_bits(u16::from_le_bytes(chunk.try_into().unwrap())).to_f32();
                sum += a * b;
            }
            Ok(sum)
        }
        _ => {
            let blck = dtype.block_size();
            let ts = dtype.type_size();
            if row.len() * blck != x.len() * ts {
                return Err(Error::InvalidParameter(format!(
                    "row/vector length mismatch: {} blocks vs {} elements",
                    row.len() / ts,
                    x.len()
                )));
            }
            let mut buf = [0.0f32; QK_K];
            let mut sum = 0.0f32;
            for (i, bytes) in row.chunks_exact(ts).enumerate() {
                dequantize_row(dtype, bytes, &mut buf[..blck])?;
                let xs = &x[i * blck..(i + 1) * blck];
                for (a, b) in buf[..blck].iter().zip(xs.iter()) {
                    sum += a * b;
                }
            }
            Ok(sum)
        }
    }
}

/// `dst[o, c] = dot(w[o, :], x[:, c])` for an encoded weight matrix
/// `w: [n_in x n_out]` and f32 activations `x: [n_in x n_cols]`.
///
/// Output rows are distributed over the ambient rayon pool; run inside
/// `ThreadPool::install` to bound the parallelism.
pub fn matmul(
    dst: &mut [f32],
    w: &[u8],
    dtype: TensorType,
    n_in: usize,
    n_out: usize,
    x: &[f32],
    n_cols: usize,
) -> Result<()> {
    let row_bytes = n_in / dtype.block_size() * dtype.type_size();
    if w.len() < n_out * row_bytes {
        return Err(Error::InvalidParameter(format!(
            "weight buffer too small: {} < {}",
            w.len(),
            n_out * row_bytes
        )));
    }
    if x.len() != n_in * n_cols || dst.len() != n_out * n_cols {
        return Err(Error::InvalidParameter("matmul activation shape mismatch".into()));
    }

    // one output column per activation column, dst laid out [n_out, n_cols]
    // with the output dimension contiguous
    let results: Result<Vec<()>> = dst
        .par_chunks_mut(n_out)
        .enumerate()
        .map(|(c, out_col)| {
            let xs = &x[c * n_in..(c + 1) * n_in];
            for (o, out) in out_col.iter_mut().enumerate() {
                *out = vec_dot(dtype, &w[o * row_bytes..(o + 1) * row_bytes], xs)?;
            }
            Ok(())
        })
        .collect();
    results.map(|_| ())
}

/// Plain f32 `C = A * B` used by tests and benches.
///
/// A: [M, K], B: [K, N], C: [M, N], all row-major.
pub fn matmul_f32(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) -> Result<()> {
    if a.len() != m * k || b.len() != k * n || c.len() != m * n {
        return Err(Error::InvalidParameter("matmul_f32 shape mismatch".into()));
    }
    c.fill(0.0);
    for i in 0..m {
        for l in 0..k {
            let av = a[i * k + l];
            for j in 0..n {
                c[i * n + j] += av * b[l * n + j];
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ggjt_core::quant::{quantize_chunk, HIST_BINS};

    #[test]
    fn matmul_f32_identity() {
        let a = vec![1.0, 0.0, 0.0, 1.0];
        let b = vec![5.0, 6.0, 7.0, 8.0];
        let mut c = vec![0.0; 4];
        matmul_f32(&a, &b, &mut c, 2, 2, 2).unwrap();
        assert_eq!(c, vec![5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn vec_dot_f32_matches_naive() {
        let a: Vec<f32> = (0..32).map(|i| i as f32).collect();
        let bytes: Vec<u8> = a.iter().flat_map(|v| v.to_le_bytes()).collect();
        let x: Vec<f32> = (0..32).map(|i| (i % 5) as f32).collect();
        let expect: f32 = a.iter().zip(x.iter()).map(|(p, q)| p * q).sum();
        assert_eq!(vec_dot(TensorType::F32, &bytes, &x).unwrap(), expect);
    }

    #[test]
    fn quantized_matmul_tracks_f32() {
        let n_in = 64;
        let n_out = 3;
        let w: Vec<f32> = (0..n_in * n_out).map(|i| ((i % 17) as f32 - 8.0) / 8.0).collect();
        let x: Vec<f32> = (0..n_in).map(|i| ((i % 7) as f32 - 3.0) / 3.0).collect();

        let mut exact = vec![0.0f32; n_out];
        for o in 0..n_out {
            exact[o] = w[o * n_in..(o + 1) * n_in].iter().zip(x.iter()).map(|(a, b)| a * b).sum();
        }

        let mut packed =
            vec![0u8; n_in * n_out / TensorType::Q8_0.block_size() * TensorType::Q8_0.type_size()];
        let mut hist = [0i64; HIST_BINS];
        quantize_chunk(TensorType::Q8_0, &w, &mut packed, 0, n_in * n_out, &mut hist).unwrap();

        let mut dst = vec![0.0f32; n_out];
        matmul(&mut dst, &packed, TensorType::Q8_0, n_in, n_out, &x, 1).unwrap();

        for (a, b) in exact.iter().zip(dst.iter()) {
            assert!((a - b).abs() < 0.05, "{} vs {}", a, b);
        }
    }

    #[test]
    fn matmul_rejects_bad_shapes() {
        let w = vec![0u8; 16];
        let x = vec![0.0f32; 4];
        let mut dst = vec![0.0f32; 4];
        assert!(matmul(&mut dst, &w, TensorType::F32, 4, 4, &x, 1).is_err());
    }
}
