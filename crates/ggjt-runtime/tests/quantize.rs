mod common;

use common::write_tiny_model;
use ggjt_core::error::Error;
use ggjt_core::formats::ggjt::{FType, GgjtParser};
use ggjt_core::tensor::TensorType;
use ggjt_runtime::{quantize_model, Context, ContextParams, QuantizeParams};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

fn parse(path: &Path) -> ggjt_core::formats::ggjt::ModelFile {
    let mut parser = GgjtParser::new(BufReader::new(File::open(path).unwrap()));
    parser.parse().unwrap()
}

#[test]
fn quantize_to_q4_0() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("f32.bin");
    let dst = dir.path().join("q4_0.bin");
    write_tiny_model(&src);

    let params = QuantizeParams { ftype: FType::MostlyQ4_0, n_threads: 2, ..Default::default() };
    quantize_model(&src, &dst, &params).unwrap();

    let out = parse(&dst);
    assert_eq!(out.hparams.ftype, FType::MostlyQ4_0);
    for t in &out.tensors {
        if t.ne.len() == 2 && t.name.ends_with("weight") {
            assert_eq!(t.dtype, TensorType::Q4_0, "tensor {}", t.name);
        } else {
            // 1-D norms are copied through
            assert_eq!(t.dtype, TensorType::F32, "tensor {}", t.name);
        }
        // payload alignment is preserved by the writer
        assert_eq!(t.file_off % 32, 0);
    }

    // the quantized model still loads and evaluates
    let cparams = ContextParams { n_ctx: 16, use_mmap: false, ..ContextParams::default() };
    let mut ctx = Context::load(&dst, &cparams).unwrap();
    ctx.eval_tokens(&[1, 2, 3], 0, 2).unwrap();
    assert!(ctx.logits().iter().all(|l| l.is_finite()));
}

#[test]
fn quantized_logits_track_f32_logits() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("f32.bin");
    let dst = dir.path().join("q8_0.bin");
    write_tiny_model(&src);

    let params = QuantizeParams { ftype: FType::MostlyQ8_0, ..Default::default() };
    quantize_model(&src, &dst, &params).unwrap();

    let cparams = ContextParams { n_ctx: 16, use_mmap: false, ..ContextParams::default() };
    let mut full = Context::load(&src, &cparams).unwrap();
    full.eval_tokens(&[1, 2, 3], 0, 1).unwrap();
    let mut quant = Context::load(&dst, &cparams).unwrap();
    quant.eval_tokens(&[1, 2, 3], 0, 1).unwrap();

    for (a, b) in full.logits().iter().zip(quant.logits().iter()) {
        assert!((a - b).abs() < 0.1, "{} vs {}", a, b);
    }
}

#[test]
fn same_type_quantize_copies_through() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("f32.bin");
    let dst = dir.path().join("f32_again.bin");
    write_tiny_model(&src);

    // F32 -> F32: every tensor is a pass-through, so files are identical
    let params = QuantizeParams {
        ftype: FType::AllF32,
        allow_requantize: true,
        ..Default::default()
    };
    quantize_model(&src, &dst, &params).unwrap();

    let a = std::fs::read(&src).unwrap();
    let b = std::fs::read(&dst).unwrap();
    assert_eq!(a, b);
}

#[test]
fn requantize_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("f32.bin");
    let q1 = dir.path().join("q5_1.bin");
    let q2 = dir.path().join("q5_1_again.bin");
    write_tiny_model(&src);

    let params = QuantizeParams { ftype: FType::MostlyQ5_1, ..Default::default() };
    quantize_model(&src, &q1, &params).unwrap();

    // quantizing an already-Q5_1 file to Q5_1 copies tensors whose type
    // already matches, so the payload is bit-identical
    let again = QuantizeParams {
        ftype: FType::MostlyQ5_1,
        allow_requantize: true,
        ..Default::default()
    };
    quantize_model(&q1, &q2, &again).unwrap();

    let a = std::fs::read(&q1).unwrap();
    let b = std::fs::read(&q2).unwrap();
    assert_eq!(a, b);
}

#[test]
fn requantize_requires_opt_in() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("f32.bin");
    let q = dir.path().join("q4_0.bin");
    let q2 = dir.path().join("q4_1.bin");
    write_tiny_model(&src);

    quantize_model(
        &src,
        &q,
        &QuantizeParams { ftype: FType::MostlyQ4_0, ..Default::default() },
    )
    .unwrap();

    let err = quantize_model(
        &q,
        &q2,
        &QuantizeParams { ftype: FType::MostlyQ4_1, ..Default::default() },
    )
    .unwrap_err();
    assert!(matches!(err, Error::QuantizeIncompatible(_)));

    quantize_model(
        &q,
        &q2,
        &QuantizeParams { ftype: FType::MostlyQ4_1, allow_requantize: true, ..Default::default() },
    )
    .unwrap();
    assert_eq!(parse(&q2).hparams.ftype, FType::MostlyQ4_1);
}

#[test]
fn k_quant_incompatible_tensors_fall_back_or_fail() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("f32.bin");
    let dst = dir.path().join("q4_k.bin");
    write_tiny_model(&src);

    // the tiny model's dims are far from multiples of 256: output.weight and
    // tok_embeddings.weight fall back, any other 2-D weight is fatal
    let err = quantize_model(
        &src,
        &dst,
        &QuantizeParams { ftype: FType::MostlyQ4KM, ..Default::default() },
    )
    .unwrap_err();
    assert!(matches!(err, Error::QuantizeIncompatible(_)));
}
