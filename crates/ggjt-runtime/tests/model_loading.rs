mod common;

use common::{tiny_hparams, tiny_vocab, write_tiny_model, N_EMBD, N_LAYER, N_VOCAB};
use ggjt_core::error::Error;
use ggjt_core::formats::ggjt::{FType, FileVersion, GgjtWriter};
use ggjt_core::tensor::TensorType;
use ggjt_runtime::{ContextParams, Model, ModelSize};
use std::fs::File;
use std::io::BufWriter;

fn no_mmap_params() -> ContextParams {
    ContextParams { use_mmap: false, ..ContextParams::default() }
}

#[test]
fn loads_complete_model() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.bin");
    write_tiny_model(&path);

    let model = Model::load(&path, &no_mmap_params()).unwrap();
    assert_eq!(model.n_vocab(), N_VOCAB as usize);
    assert_eq!(model.n_embd(), N_EMBD as usize);
    assert_eq!(model.hparams.n_layer, N_LAYER);
    assert_eq!(model.layers.len(), N_LAYER as usize);
    assert_eq!(model.size, ModelSize::Model7B); // small layer count falls back
    assert!(!model.is_vocab_only());
}

#[test]
fn mmap_and_read_paths_agree() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.bin");
    write_tiny_model(&path);

    let mapped = Model::load(&path, &ContextParams::default()).unwrap();
    let read = Model::load(&path, &no_mmap_params()).unwrap();

    // every tensor's bytes must be identical whichever path loaded them
    let mut count = 0;
    for ((name_a, bytes_a), (name_b, bytes_b)) in
        mapped.tensors_by_name().zip(read.tensors_by_name())
    {
        assert_eq!(name_a, name_b);
        assert_eq!(bytes_a, bytes_b, "tensor {} differs between load paths", name_a);
        count += 1;
    }
    assert_eq!(count, 3 + 9 * N_LAYER as usize);

    let tokens = mapped.tokenize("t5", false);
    assert_eq!(tokens, read.tokenize("t5", false));
}

#[test]
fn vocab_only_skips_weights() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.bin");
    write_tiny_model(&path);

    let params = ContextParams { vocab_only: true, ..ContextParams::default() };
    let model = Model::load(&path, &params).unwrap();
    assert!(model.is_vocab_only());
    assert_eq!(model.n_vocab(), N_VOCAB as usize);
    // tokenization still works without weights
    assert!(!model.tokenize("t7", true).is_empty());
}

#[test]
fn missing_tensor_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("incomplete.bin");

    let file = BufWriter::new(File::create(&path).unwrap());
    let mut w =
        GgjtWriter::new(file, &tiny_hparams(), &tiny_vocab(), FType::AllF32, FileVersion::GgjtV3)
            .unwrap();
    // only the embedding table; everything else is absent
    let data: Vec<u8> = std::iter::repeat([0u8; 4]).take((N_EMBD * N_VOCAB) as usize).flatten().collect();
    w.write_tensor("tok_embeddings.weight", TensorType::F32, &[N_EMBD, N_VOCAB], &data).unwrap();
    w.finish().unwrap();

    let err = Model::load(&path, &no_mmap_params()).unwrap_err();
    assert!(matches!(err, Error::MissingTensor(name) if name == "norm.weight"));
}

#[test]
fn wrong_shape_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("misshapen.bin");

    let file = BufWriter::new(File::create(&path).unwrap());
    let mut w =
        GgjtWriter::new(file, &tiny_hparams(), &tiny_vocab(), FType::AllF32, FileVersion::GgjtV3)
            .unwrap();
    // embedding table transposed relative to what the loader expects
    let data: Vec<u8> = vec![0u8; (N_EMBD * N_VOCAB * 4) as usize];
    w.write_tensor("tok_embeddings.weight", TensorType::F32, &[N_VOCAB, N_EMBD], &data).unwrap();
    w.finish().unwrap();

    let err = Model::load(&path, &no_mmap_params()).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { name, .. } if name == "tok_embeddings.weight"));
}

#[test]
fn unknown_layer_tensor_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("tiny.bin");
    write_tiny_model(&src);

    // append a tensor whose name matches no known pattern
    use std::io::{Seek, SeekFrom, Write};
    let mut file = std::fs::OpenOptions::new().append(true).open(&src).unwrap();
    file.seek(SeekFrom::End(0)).unwrap();
    let mut meta = Vec::new();
    meta.extend_from_slice(&1u32.to_le_bytes()); // n_dims
    meta.extend_from_slice(&("bogus.weight".len() as u32).to_le_bytes());
    meta.extend_from_slice(&0u32.to_le_bytes()); // f32
    meta.extend_from_slice(&8u32.to_le_bytes()); // ne[0]
    meta.extend_from_slice(b"bogus.weight");
    file.write_all(&meta).unwrap();
    let pos = file.stream_position().unwrap();
    let pad = (32 - pos % 32) % 32;
    file.write_all(&vec![0u8; pad as usize + 32]).unwrap();

    let err = Model::load(&src, &no_mmap_params()).unwrap_err();
    assert!(matches!(err, Error::InvalidLayerNumber(_)));
}

#[test]
fn extra_tensor_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("tiny.bin");
    write_tiny_model(&src);

    // append a well-formed tensor the model never asks for
    use std::io::{Seek, SeekFrom, Write};
    let mut file = std::fs::OpenOptions::new().append(true).open(&src).unwrap();
    file.seek(SeekFrom::End(0)).unwrap();
    let name = "layers.0.surplus.weight";
    let mut meta = Vec::new();
    meta.extend_from_slice(&1u32.to_le_bytes());
    meta.extend_from_slice(&(name.len() as u32).to_le_bytes());
    meta.extend_from_slice(&0u32.to_le_bytes());
    meta.extend_from_slice(&8u32.to_le_bytes());
    meta.extend_from_slice(name.as_bytes());
    file.write_all(&meta).unwrap();
    let pos = file.stream_position().unwrap();
    let pad = (32 - pos % 32) % 32;
    file.write_all(&vec![0u8; pad as usize + 32]).unwrap();

    let err = Model::load(&src, &no_mmap_params()).unwrap_err();
    assert!(matches!(err, Error::ExtraTensors));
}

#[test]
fn gpu_layer_split_assigns_backends() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.bin");
    write_tiny_model(&path);

    let params = ContextParams { n_gpu_layers: 1, use_mmap: false, ..ContextParams::default() };
    let model = Model::load(&path, &params).unwrap();

    // last layer offloaded, first stays on cpu; output follows the offload
    assert_eq!(model.backend_layers, vec![0, 1]);
    assert_eq!(model.backend_inp, 0);
    assert_eq!(model.backend_out, 1);

    let all = ContextParams { n_gpu_layers: 3, use_mmap: false, ..ContextParams::default() };
    let model = Model::load(&path, &all).unwrap();
    assert_eq!(model.backend_layers, vec![1, 1]);
    assert_eq!(model.backend_inp, 1); // n_gpu_layers > n_layer pulls the input in too
    assert_eq!(model.backend_out, 1);
}

#[test]
fn mmap_with_offload_uploads_to_aux() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny.bin");
    write_tiny_model(&path);

    // mmap + non-RAM-shared backend exercises the upload-and-discard path
    let params = ContextParams { n_gpu_layers: 2, ..ContextParams::default() };
    let model = Model::load(&path, &params).unwrap();
    assert_eq!(model.backend_layers, vec![1, 1]);
}
