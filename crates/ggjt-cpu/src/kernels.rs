//! Element-wise and row-wise tensor kernels.

use ggjt_core::error::Result;

/// Epsilon added to the mean square before the reciprocal square root.
pub const RMS_NORM_EPS: f32 = 1e-6;

/// RMS-normalize one row: `out = x / sqrt(mean(x^2) + eps)`.
pub fn rms_norm(x: &[f32], out: &mut [f32]) {
    debug_assert_eq!(x.len(), out.len());
    let mean_sq = x.iter().map(|&v| v * v).sum::<f32>() / x.len() as f32;
    let scale = 1.0 / (mean_sq + RMS_NORM_EPS).sqrt();
    for (o, &v) in out.iter_mut().zip(x.iter()) {
        *o = v * scale;
    }
}

/// Softmax one row in place, max-subtracted for stability.
pub fn softmax_inplace(row: &mut [f32]) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    let inv = 1.0 / sum;
    for v in row.iter_mut() {
        *v *= inv;
    }
}

/// SILU activation in place: `x * sigmoid(x)`.
pub fn silu_inplace(x: &mut [f32]) {
    for v in x.iter_mut() {
        *v = *v / (1.0 + (-*v).exp());
    }
}

pub fn add(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert_eq!(a.len(), b.len());
    for ((o, &x), &y) in out.iter_mut().zip(a.iter()).zip(b.iter()) {
        *o = x + y;
    }
}

pub fn mul(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert_eq!(a.len(), b.len());
    for ((o, &x), &y) in out.iter_mut().zip(a.iter()).zip(b.iter()) {
        *o = x * y;
    }
}

pub fn scale_inplace(x: &mut [f32], s: f32) {
    for v in x.iter_mut() {
        *v *= s;
    }
}

/// Rotary position embedding, in place, over `[head_dim, n_head, n_tokens]`
/// data. Token `i` is rotated as absolute position `n_past + i`; adjacent
/// element pairs form the complex components.
pub fn rope_inplace(
    x: &mut [f32],
    head_dim: usize,
    n_head: usize,
    n_tokens: usize,
    n_past: usize,
    n_rot: usize,
    freq_base: f32,
    freq_scale: f32,
) -> Result<()> {
    debug_assert_eq!(x.len(), head_dim * n_head * n_tokens);
    let theta_scale = freq_base.powf(-2.0 / n_rot as f32);

    for t in 0..n_tokens {
        let p = (n_past + t) as f32;
        for h in 0..n_head {
            let base = (t * n_head + h) * head_dim;
            let mut theta = freq_scale * p;
            let mut i0 = 0;
            while i0 + 1 < n_rot.min(head_dim) {
                let (sin_t, cos_t) = theta.sin_cos();
                let x0 = x[base + i0];
                let x1 = x[base + i0 + 1];
                x[base + i0] = x0 * cos_t - x1 * sin_t;
                x[base + i0 + 1] = x0 * sin_t + x1 * cos_t;
                theta *= theta_scale;
                i0 += 2;
            }
        }
    }
    Ok(())
}
