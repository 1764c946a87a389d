//! Weight loading: tensor enumeration, shape validation, backend assignment
//! and the four data-load paths (mmap or read, RAM-shared or upload).

use crate::backend::{Backend, BackendBuffer, BackendId, CpuBackend};
use crate::model::{ContextParams, LayerWeights, Model, ModelSize, WeightLoc, WeightTensor, MB};
use ggjt_core::error::{Error, Result};
use ggjt_core::formats::ggjt::{check_ftype_supported, GgjtParser};
use ggjt_core::mmap::{MemoryLock, ModelMapping};
use ggjt_core::tensor::TensorDesc;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Book-keeping overhead per tensor in the per-backend size accounting.
const TENSOR_HEADER_OVERHEAD: usize = 64;

/// Name-keyed view over the file's tensor table, preserving file order.
struct TensorMap {
    descs: Vec<TensorDesc>,
    name_to_idx: HashMap<String, usize>,
}

impl TensorMap {
    fn new(descs: Vec<TensorDesc>) -> Self {
        let name_to_idx =
            descs.iter().enumerate().map(|(i, t)| (t.name.clone(), i)).collect();
        Self { descs, name_to_idx }
    }
}

/// Backend assignment by tensor name.
fn backend_for_tensor(
    name: &str,
    backend_inp: BackendId,
    backend_out: BackendId,
    backend_layers: &[BackendId],
) -> Result<BackendId> {
    if name == "tok_embeddings.weight" {
        return Ok(backend_inp);
    }
    if name == "norm.weight" || name == "output.weight" {
        return Ok(backend_out);
    }
    let rest = name
        .strip_prefix("layers.")
        .ok_or_else(|| Error::InvalidLayerNumber(name.to_string()))?;
    let digits = rest.split('.').next().unwrap_or("");
    let layer: usize =
        digits.parse().map_err(|_| Error::InvalidLayerNumber(name.to_string()))?;
    if layer >= backend_layers.len() {
        return Err(Error::InvalidLayerNumber(name.to_string()));
    }
    Ok(backend_layers[layer])
}

/// Requests tensors by name, validating shapes and assigning arena offsets.
struct TensorRequester<'a> {
    map: &'a TensorMap,
    backends: &'a [Arc<dyn Backend>],
    use_mmap: bool,
    cursors: Vec<usize>,
    out: Vec<Option<WeightTensor>>,
    created: usize,
}

impl<'a> TensorRequester<'a> {
    fn new(map: &'a TensorMap, backends: &'a [Arc<dyn Backend>], use_mmap: bool) -> Self {
        Self {
            map,
            backends,
            use_mmap,
            cursors: vec![0; backends.len()],
            out: (0..map.descs.len()).map(|_| None).collect(),
            created: 0,
        }
    }

    fn get(&mut self, name: &str, ne: &[u32], backend: BackendId) -> Result<usize> {
        let idx = *self
            .map
            .name_to_idx
            .get(name)
            .ok_or_else(|| Error::MissingTensor(name.to_string()))?;
        let desc = &self.map.descs[idx];
        if desc.ne != ne {
            return Err(Error::ShapeMismatch {
                name: name.to_string(),
                expected: TensorDesc::shape_string(ne),
                actual: TensorDesc::shape_string(&desc.ne),
            });
        }
        if self.out[idx].is_some() {
            // requested twice; treat like a malformed model table
            return Err(Error::ExtraTensors);
        }

        let ram_shared = self.backends[backend].is_ram_shared();
        let loc = if self.use_mmap && ram_shared {
            WeightLoc::Mapped { offset: desc.file_off as usize }
        } else {
            let offset = self.cursors[backend];
            self.cursors[backend] += desc.size as usize;
            WeightLoc::Buffer { offset }
        };
        self.out[idx] = Some(WeightTensor {
            name: name.to_string(),
            dtype: desc.dtype,
            ne: desc.ne.clone(),
            size: desc.size as usize,
            backend,
            loc,
        });
        self.created += 1;
        Ok(idx)
    }

    fn done(self) -> Result<Vec<WeightTensor>> {
        if self.created != self.map.descs.len() {
            return Err(Error::ExtraTensors);
        }
        self.out.into_iter().map(|t| t.ok_or(Error::ExtraTensors)).collect()
    }
}

pub(crate) fn load_model(path: &Path, params: &ContextParams) -> Result<Model> {
    let t_start = Instant::now();
    log::info!("loading model from {}", path.display());

    let file = File::open(path)?;
    let mut parser = GgjtParser::new(BufReader::new(file));
    let model_file = parser.parse()?;

    let version = model_file.version;
    let mut hparams = model_file.hparams;
    hparams.n_ctx = params.n_ctx;
    hparams.rope_freq_base = params.rope_freq_base;
    hparams.rope_freq_scale = params.rope_freq_scale;

    let size = ModelSize::from_n_layer(hparams.n_layer);

    log::info!("format     = {}", version.name());
    log::info!("n_vocab    = {}", hparams.n_vocab);
    log::info!("n_ctx      = {}", hparams.n_ctx);
    log::info!("n_embd     = {}", hparams.n_embd);
    log::info!("n_mult     = {}", hparams.n_mult);
    log::info!("n_head     = {}", hparams.n_head);
    log::info!("n_layer    = {}", hparams.n_layer);
    log::info!("n_rot      = {}", hparams.n_rot);
    log::info!("freq_base  = {:.1}", hparams.rope_freq_base);
    log::info!("freq_scale = {}", hparams.rope_freq_scale);
    log::info!("ftype      = {} ({})", hparams.ftype as u32, hparams.ftype.name());
    log::info!("n_ff       = {}", hparams.n_ff());
    log::info!("model size = {}", size.name());

    check_ftype_supported(version, hparams.ftype)?;

    if params.vocab_only {
        return Ok(Model {
            hparams,
            vocab: model_file.vocab,
            size,
            n_gpu_layers: 0,
            backends: Vec::new(),
            backend_inp: 0,
            backend_out: 0,
            backend_layers: Vec::new(),
            buffers: Vec::new(),
            mapping: None,
            tensors: Vec::new(),
            tok_embeddings: 0,
            norm: 0,
            output: 0,
            layers: Vec::new(),
            t_start,
            t_load_us: 0,
        });
    }

    let map = TensorMap::new(model_file.tensors);
    let n_layer = hparams.n_layer;

    // backends: the CPU backend always exists; a secondary backend joins in
    // when layers are offloaded
    let mut backends: Vec<Arc<dyn Backend>> = vec![Arc::new(CpuBackend::new())];
    let backend_cpu: BackendId = 0;
    let backend_gpu: BackendId = if params.n_gpu_layers > 0 {
        backends.push(Arc::new(CpuBackend::aux()));
        1
    } else {
        backend_cpu
    };

    let i_gpu_start = n_layer.saturating_sub(params.n_gpu_layers) as usize;
    let backend_inp = if params.n_gpu_layers > n_layer { backend_gpu } else { backend_cpu };
    let backend_out = if params.n_gpu_layers > 0 { backend_gpu } else { backend_cpu };
    let backend_layers: Vec<BackendId> = (0..n_layer as usize)
        .map(|i| if i >= i_gpu_start { backend_gpu } else { backend_cpu })
        .collect();

    // per-backend context sizes
    let mut ctx_sizes = vec![0usize; backends.len()];
    for desc in &map.descs {
        let b = backend_for_tensor(&desc.name, backend_inp, backend_out, &backend_layers)?;
        ctx_sizes[b] += TENSOR_HEADER_OVERHEAD + desc.size as usize;
    }

    let use_mmap = params.use_mmap;
    let mut mmap_size = 0usize;
    if use_mmap {
        for (i, backend) in backends.iter().enumerate() {
            if backend.is_ram_shared() {
                mmap_size += ctx_sizes[i];
                ctx_sizes[i] = 0;
            }
        }
    }

    log::info!("ctx sizes:");
    for (i, backend) in backends.iter().enumerate() {
        log::info!("{:>8} = {:7.2} MB", backend.name(), ctx_sizes[i] as f64 / MB as f64);
    }
    if mmap_size > 0 {
        log::info!("{:>8} = {:7.2} MB", "mmap", mmap_size as f64 / MB as f64);
    }

    let mut buffers: Vec<BackendBuffer> = Vec::with_capacity(backends.len());
    for (i, backend) in backends.iter().enumerate() {
        buffers.push(backend.alloc_buffer(ctx_sizes[i], map.descs.len())?);
    }

    let mapping = if use_mmap {
        let file = File::open(path)?;
        Some(ModelMapping::new(&file, crate::numa_enabled())?)
    } else {
        None
    };

    // request every known tensor with its expected shape
    let n_embd = hparams.n_embd;
    let n_vocab = hparams.n_vocab;
    let n_ff = hparams.n_ff();

    let mut req = TensorRequester::new(&map, &backends, use_mmap);
    let tok_embeddings = req.get("tok_embeddings.weight", &[n_embd, n_vocab], backend_inp)?;
    let norm = req.get("norm.weight", &[n_embd], backend_out)?;
    let output = req.get("output.weight", &[n_embd, n_vocab], backend_out)?;

    let mut layers = Vec::with_capacity(n_layer as usize);
    for i in 0..n_layer as usize {
        let b = backend_layers[i];
        let prefix = format!("layers.{}", i);
        layers.push(LayerWeights {
            attention_norm: req.get(&format!("{}.attention_norm.weight", prefix), &[n_embd], b)?,
            wq: req.get(&format!("{}.attention.wq.weight", prefix), &[n_embd, n_embd], b)?,
            wk: req.get(&format!("{}.attention.wk.weight", prefix), &[n_embd, n_embd], b)?,
            wv: req.get(&format!("{}.attention.wv.weight", prefix), &[n_embd, n_embd], b)?,
            wo: req.get(&format!("{}.attention.wo.weight", prefix), &[n_embd, n_embd], b)?,
            ffn_norm: req.get(&format!("{}.ffn_norm.weight", prefix), &[n_embd], b)?,
            w1: req.get(&format!("{}.feed_forward.w1.weight", prefix), &[n_embd, n_ff], b)?,
            w2: req.get(&format!("{}.feed_forward.w2.weight", prefix), &[n_ff, n_embd], b)?,
            w3: req.get(&format!("{}.feed_forward.w3.weight", prefix), &[n_embd, n_ff], b)?,
        });
    }
    let tensors = req.done()?;

    // load the data in file order, reporting progress by bytes
    let total_bytes: u64 = map.descs.iter().map(|d| d.size).sum();
    let mut done_bytes = 0u64;
    let mut lock = MemoryLock::default();

    let mut scratch_size = 0usize;
    for t in &tensors {
        if !use_mmap && !backends[t.backend].is_ram_shared() {
            scratch_size = scratch_size.max(t.size);
        }
    }
    let mut scratch = vec![0u8; scratch_size];

    let progress = |done: u64| {
        let fraction = if total_bytes == 0 { 1.0 } else { done as f32 / total_bytes as f32 };
        match &params.progress_callback {
            Some(cb) => cb(fraction),
            None => log::debug!("load progress: {:3.0}%", fraction * 100.0),
        }
    };

    for (idx, t) in tensors.iter().enumerate() {
        progress(done_bytes);
        let desc = &map.descs[idx];
        let ram_shared = backends[t.backend].is_ram_shared();

        match (&mapping, t.loc) {
            (Some(m), WeightLoc::Mapped { offset }) => {
                // served straight from the page cache
                debug_assert!(ram_shared);
                if params.use_mlock {
                    lock.grow_to(m, offset + t.size);
                }
            }
            (Some(m), WeightLoc::Buffer { offset }) => {
                // mapped file, device-side tensor: upload, then drop the pages
                let src = &m.as_slice()[desc.file_off as usize..desc.file_off as usize + t.size];
                backends[t.backend].tensor_set(&mut buffers[t.backend], offset, src)?;
                m.discard(desc.file_off as usize, t.size);
            }
            (None, WeightLoc::Buffer { offset }) => {
                if ram_shared {
                    let dst = &mut buffers[t.backend].as_mut_slice()[offset..offset + t.size];
                    parser.read_tensor_into(desc.file_off, dst)?;
                } else {
                    let dst = &mut scratch[..t.size];
                    parser.read_tensor_into(desc.file_off, dst)?;
                    backends[t.backend].tensor_set(&mut buffers[t.backend], offset, dst)?;
                }
            }
            (None, WeightLoc::Mapped { .. }) => {
                return Err(Error::InvalidParameter(
                    "mapped tensor without an active mapping".into(),
                ));
            }
        }
        done_bytes += t.size as u64;
    }
    progress(total_bytes);
    if lock.locked_bytes() > 0 {
        log::info!("mlocked {:.2} MB of the mapping", lock.locked_bytes() as f64 / MB as f64);
    }

    // total memory footprint, like the reference reports it
    let ctx_sum: usize = mmap_size + ctx_sizes.iter().sum::<usize>();
    log::info!(
        "mem required  = {:7.2} MB (+ {:7.2} MB per state)",
        (ctx_sum + size.mem_req_eval()) as f64 / MB as f64,
        size.mem_req_kv_self() as f64 / MB as f64
    );

    let t_load_us = t_start.elapsed().as_micros() as i64;

    Ok(Model {
        hparams,
        vocab: model_file.vocab,
        size,
        n_gpu_layers: params.n_gpu_layers,
        backends,
        backend_inp,
        backend_out,
        backend_layers,
        buffers,
        mapping,
        tensors,
        tok_embeddings,
        norm,
        output,
        layers,
        t_start,
        t_load_us,
    })
}
