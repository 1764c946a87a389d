//! Shared fixtures: a tiny but complete GGJT v3 model file.
#![allow(dead_code)]

use ggjt_core::formats::ggjt::{FType, FileVersion, GgjtWriter, HParams};
use ggjt_core::tensor::TensorType;
use ggjt_core::vocab::Vocabulary;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

pub const N_VOCAB: u32 = 32;
pub const N_EMBD: u32 = 32;
pub const N_MULT: u32 = 32;
pub const N_HEAD: u32 = 2;
pub const N_LAYER: u32 = 2;
pub const N_ROT: u32 = 16;

pub fn tiny_hparams() -> HParams {
    HParams {
        n_vocab: N_VOCAB,
        n_embd: N_EMBD,
        n_mult: N_MULT,
        n_head: N_HEAD,
        n_layer: N_LAYER,
        n_rot: N_ROT,
        ftype: FType::AllF32,
        ..HParams::default()
    }
}

pub fn tiny_vocab() -> Vocabulary {
    let mut vocab = Vocabulary::with_capacity(N_VOCAB as usize);
    vocab.push(b"<unk>".to_vec(), 0.0);
    vocab.push(b"<s>".to_vec(), 0.0);
    vocab.push(b"</s>".to_vec(), 0.0);
    for i in 3..N_VOCAB {
        vocab.push(format!("t{}", i).into_bytes(), -(i as f32) / 10.0);
    }
    vocab
}

/// Deterministic pseudo-random weight values in roughly [-0.5, 0.5).
fn weight_value(seed: usize, i: usize) -> f32 {
    let x = (seed.wrapping_mul(31) ^ i).wrapping_mul(7919) % 1000;
    (x as f32 - 500.0) / 1000.0
}

fn f32_tensor(seed: usize, n: usize) -> Vec<u8> {
    (0..n).flat_map(|i| weight_value(seed, i).to_le_bytes()).collect()
}

/// Norm scales stay close to one so activations neither vanish nor blow up.
fn norm_tensor(seed: usize, n: usize) -> Vec<u8> {
    (0..n)
        .flat_map(|i| (1.0 + 0.1 * weight_value(seed, i)).to_le_bytes())
        .collect()
}

/// Write a complete all-F32 model with every tensor the loader expects.
pub fn write_tiny_model(path: &Path) {
    let hparams = tiny_hparams();
    let n_embd = N_EMBD;
    let n_vocab = N_VOCAB;
    let n_ff = hparams.n_ff();

    let file = BufWriter::new(File::create(path).unwrap());
    let mut w =
        GgjtWriter::new(file, &hparams, &tiny_vocab(), FType::AllF32, FileVersion::GgjtV3).unwrap();

    let f32t = TensorType::F32;
    let ne2 = |a: u32, b: u32| vec![a, b];

    w.write_tensor(
        "tok_embeddings.weight",
        f32t,
        &ne2(n_embd, n_vocab),
        &f32_tensor(1, (n_embd * n_vocab) as usize),
    )
    .unwrap();
    w.write_tensor("norm.weight", f32t, &[n_embd], &norm_tensor(2, n_embd as usize)).unwrap();
    w.write_tensor(
        "output.weight",
        f32t,
        &ne2(n_embd, n_vocab),
        &f32_tensor(3, (n_embd * n_vocab) as usize),
    )
    .unwrap();

    for il in 0..N_LAYER {
        let seed = 100 * (il as usize + 1);
        let p = format!("layers.{}", il);
        w.write_tensor(
            &format!("{}.attention_norm.weight", p),
            f32t,
            &[n_embd],
            &norm_tensor(seed + 1, n_embd as usize),
        )
        .unwrap();
        for (i, name) in ["wq", "wk", "wv", "wo"].iter().enumerate() {
            w.write_tensor(
                &format!("{}.attention.{}.weight", p, name),
                f32t,
                &ne2(n_embd, n_embd),
                &f32_tensor(seed + 2 + i, (n_embd * n_embd) as usize),
            )
            .unwrap();
        }
        w.write_tensor(
            &format!("{}.ffn_norm.weight", p),
            f32t,
            &[n_embd],
            &norm_tensor(seed + 6, n_embd as usize),
        )
        .unwrap();
        w.write_tensor(
            &format!("{}.feed_forward.w1.weight", p),
            f32t,
            &ne2(n_embd, n_ff),
            &f32_tensor(seed + 7, (n_embd * n_ff) as usize),
        )
        .unwrap();
        w.write_tensor(
            &format!("{}.feed_forward.w2.weight", p),
            f32t,
            &ne2(n_ff, n_embd),
            &f32_tensor(seed + 8, (n_ff * n_embd) as usize),
        )
        .unwrap();
        w.write_tensor(
            &format!("{}.feed_forward.w3.weight", p),
            f32t,
            &ne2(n_embd, n_ff),
            &f32_tensor(seed + 9, (n_embd * n_ff) as usize),
        )
        .unwrap();
    }
    w.finish().unwrap();
}
