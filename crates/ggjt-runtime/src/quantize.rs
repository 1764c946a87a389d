//! Model-to-model requantization.
//!
//! Streams every tensor of an input model through dequantize/requantize and
//! writes a new file under the requested file type. Per-tensor target types
//! follow the K-quant promotion rules; anything that is not a 2-D `*weight`
//! tensor is copied through unchanged.

use ggjt_core::error::{Error, Result};
use ggjt_core::formats::ggjt::{FType, GgjtParser, GgjtWriter};
use ggjt_core::quant::{dequantize_row, quantize_chunk, HIST_BINS, QK_K};
use ggjt_core::tensor::{TensorDesc, TensorType};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Mutex;

/// Elements handed to one quantization worker at a time.
const CHUNK_SIZE: usize = 32 * 512;

pub struct QuantizeParams {
    /// Worker threads; 0 means one per hardware thread.
    pub n_threads: usize,
    pub ftype: FType,
    /// Allow a quantized source tensor to be dequantized and requantized.
    pub allow_requantize: bool,
    /// Quantize `output.weight` too (otherwise copied through).
    pub quantize_output_tensor: bool,
}

impl Default for QuantizeParams {
    fn default() -> Self {
        Self {
            n_threads: 0,
            ftype: FType::MostlyQ5_1,
            allow_requantize: false,
            quantize_output_tensor: true,
        }
    }
}

/// Layers that get extra bits under the medium K-quant mixes: the first and
/// last eighth, and every third layer in between.
fn use_more_bits(i_layer: usize, num_layers: usize) -> bool {
    i_layer < num_layers / 8
        || i_layer >= 7 * num_layers / 8
        || (i_layer.wrapping_sub(num_layers / 8)) % 3 == 2
}

fn is_k_quant(t: TensorType) -> bool {
    matches!(
        t,
        TensorType::Q2_K | TensorType::Q3_K | TensorType::Q4_K | TensorType::Q5_K | TensorType::Q6_K
    )
}

/// Dequantize or convert a whole tensor to f32, splitting block-aligned
/// ranges across `nthread` workers for large tensors.
fn convert_to_f32(
    dtype: TensorType,
    data: &[u8],
    nelements: usize,
    nthread: usize,
    out: &mut [f32],
) -> Result<()> {
    if dtype.is_quantized() || dtype == TensorType::F16 {
        // fall through to the row codecs
    } else {
        return Err(Error::QuantizeIncompatible(format!(
            "cannot dequantize/convert tensor type {}",
            dtype.name()
        )));
    }

    if nthread < 2 {
        return dequantize_row(dtype, data, out);
    }

    let block_size = dtype.block_size();
    let block_bytes = dtype.type_size();
    let nblocks = nelements / block_size;
    let blocks_per_thread = (nblocks / nthread).max(1);

    let mut jobs: Vec<(&[u8], &mut [f32])> = Vec::new();
    let mut rest_in = data;
    let mut rest_out = out;
    let mut blocks_left = nblocks;
    while blocks_left > 0 {
        let take = blocks_per_thread.min(blocks_left);
        // the last worker also gets the remainder
        let take = if blocks_left - take < blocks_per_thread { blocks_left } else { take };
        let (in_chunk, in_rest) = rest_in.split_at(take * block_bytes);
        let (out_chunk, out_rest) = rest_out.split_at_mut(take * block_size);
        jobs.push((in_chunk, out_chunk));
        rest_in = in_rest;
        rest_out = out_rest;
        blocks_left -= take;
    }

    std::thread::scope(|s| {
        let mut handles = Vec::new();
        for (src, dst) in jobs {
            handles.push(s.spawn(move || dequantize_row(dtype, src, dst)));
        }
        for handle in handles {
            handle
                .join()
                .map_err(|_| Error::QuantizeIncompatible("dequantize worker panicked".into()))??;
        }
        Ok(())
    })
}

/// Quantize `f32_data` into `dtype`, dispatching [`CHUNK_SIZE`]-element
/// chunks to `nthread` workers from a shared counter. Returns the packed
/// bytes and byte size, and merges the nibble histogram into `hist`.
fn quantize_tensor(
    dtype: TensorType,
    f32_data: &[f32],
    nthread: usize,
    hist: &mut [i64; HIST_BINS],
) -> Result<Vec<u8>> {
    let nelements = f32_data.len();
    let out_bytes = nelements / dtype.block_size() * dtype.type_size();
    let mut work = vec![0u8; out_bytes];

    let nchunk = (nelements + CHUNK_SIZE - 1) / CHUNK_SIZE;
    let nthread_use = if nthread > 1 { nthread.min(nchunk).max(1) } else { 1 };

    if nthread_use < 2 {
        quantize_chunk(dtype, f32_data, &mut work, 0, nelements, hist)?;
        return Ok(work);
    }

    let counter = Mutex::new(0usize);
    let results: Mutex<Vec<(usize, Vec<u8>)>> = Mutex::new(Vec::with_capacity(nchunk));
    let shared_hist = Mutex::new([0i64; HIST_BINS]);

    std::thread::scope(|s| -> Result<()> {
        let compute = || -> Result<()> {
            let mut local_hist = [0i64; HIST_BINS];
            loop {
                let first = {
                    let mut c = counter.lock().unwrap();
                    let first = *c;
                    *c += CHUNK_SIZE;
                    first
                };
                if first >= nelements {
                    let mut h = shared_hist.lock().unwrap();
                    for (a, b) in h.iter_mut().zip(local_hist.iter()) {
                        *a += b;
                    }
                    return Ok(());
                }
                let last = nelements.min(first + CHUNK_SIZE);
                let n = last - first;
                let mut chunk = vec![0u8; n / dtype.block_size() * dtype.type_size()];
                quantize_chunk(dtype, &f32_data[first..last], &mut chunk, 0, n, &mut local_hist)?;
                results.lock().unwrap().push((first, chunk));
            }
        };

        let mut handles = Vec::new();
        for _ in 0..nthread_use - 1 {
            handles.push(s.spawn(compute));
        }
        compute()?;
        for handle in handles {
            handle
                .join()
                .map_err(|_| Error::QuantizeIncompatible("quantize worker panicked".into()))??;
        }
        Ok(())
    })?;

    for (first, chunk) in results.into_inner().unwrap() {
        let start = first / dtype.block_size() * dtype.type_size();
        work[start..start + chunk.len()].copy_from_slice(&chunk);
    }
    let h = shared_hist.into_inner().unwrap();
    for (a, b) in hist.iter_mut().zip(h.iter()) {
        *a += b;
    }
    Ok(work)
}

/// Pick the on-disk type for one tensor under the requested scheme.
fn pick_tensor_type(
    desc: &TensorDesc,
    ftype: FType,
    quantized_type: TensorType,
    i_attention_wv: &mut usize,
    n_attention_wv: usize,
    i_feed_forward_w2: &mut usize,
    n_feed_forward_w2: usize,
) -> Result<TensorType> {
    let mut new_type = quantized_type;

    let mut convert_incompatible_tensor = false;
    if is_k_quant(quantized_type) {
        let nx = desc.ne[0] as usize;
        let ny = desc.ne.get(1).copied().unwrap_or(1) as usize;
        if nx % QK_K != 0 || ny % QK_K != 0 {
            log::warn!(
                "tensor sizes {} x {} are not divisible by {}, required for k-quants",
                nx,
                ny,
                QK_K
            );
            convert_incompatible_tensor = true;
        }
    }

    if desc.name == "output.weight" {
        let nx = desc.ne[0] as usize;
        let ny = desc.ne.get(1).copied().unwrap_or(1) as usize;
        if nx % QK_K == 0 && ny % QK_K == 0 {
            new_type = TensorType::Q6_K;
        }
    } else if desc.name.contains("attention.wv.weight") {
        if matches!(ftype, FType::MostlyQ3KM | FType::MostlyQ2K) {
            new_type = TensorType::Q4_K;
        } else if ftype == FType::MostlyQ3KL {
            new_type = TensorType::Q5_K;
        } else if matches!(ftype, FType::MostlyQ4KM | FType::MostlyQ5KM)
            && use_more_bits(*i_attention_wv, n_attention_wv)
        {
            new_type = TensorType::Q6_K;
        } else if QK_K == 64
            && matches!(ftype, FType::MostlyQ4KS | FType::MostlyQ3KS)
            && (*i_attention_wv < n_attention_wv / 8
                || *i_attention_wv >= 7 * n_attention_wv / 8)
        {
            new_type = TensorType::Q6_K;
        }
        *i_attention_wv += 1;
    } else if desc.name.contains("feed_forward.w2.weight") {
        if matches!(ftype, FType::MostlyQ3KM | FType::MostlyQ2K) {
            new_type = TensorType::Q4_K;
        } else if ftype == FType::MostlyQ3KL {
            new_type = TensorType::Q5_K;
        } else if matches!(ftype, FType::MostlyQ4KM | FType::MostlyQ5KM)
            && use_more_bits(*i_feed_forward_w2, n_feed_forward_w2)
        {
            new_type = TensorType::Q6_K;
        }
        *i_feed_forward_w2 += 1;
    } else if desc.name.contains("attention.wo.weight") {
        if matches!(ftype, FType::MostlyQ3KM | FType::MostlyQ2K) {
            new_type = TensorType::Q4_K;
        } else if ftype == FType::MostlyQ3KL {
            new_type = TensorType::Q5_K;
        }
    }

    if convert_incompatible_tensor {
        if desc.name == "output.weight" {
            // fall back instead of failing
            new_type = TensorType::F16;
            log::warn!("F16 will be used for this tensor instead");
        } else if desc.name == "tok_embeddings.weight" {
            new_type = TensorType::Q4_0;
            log::warn!("Q4_0 will be used for this tensor instead");
        } else {
            return Err(Error::QuantizeIncompatible(desc.name.clone()));
        }
    }

    Ok(new_type)
}

/// Convert `fname_inp` into `fname_out` under `params.ftype`.
pub fn quantize_model(
    fname_inp: impl AsRef<Path>,
    fname_out: impl AsRef<Path>,
    params: &QuantizeParams,
) -> Result<()> {
    let quantized_type = params.ftype.quantized_type()?;

    let nthread = if params.n_threads == 0 {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    } else {
        params.n_threads
    };

    log::info!("quantizing {} to {}", fname_inp.as_ref().display(), fname_out.as_ref().display());

    let mut parser = GgjtParser::new(BufReader::new(File::open(fname_inp.as_ref())?));
    let model_file = parser.parse()?;

    let out_file = BufWriter::new(File::create(fname_out.as_ref())?);
    let mut writer = GgjtWriter::new(
        out_file,
        &model_file.hparams,
        &model_file.vocab,
        params.ftype,
        model_file.version,
    )?;

    let n_attention_wv =
        model_file.tensors.iter().filter(|t| t.name.contains("attention.wv.weight")).count();
    let n_feed_forward_w2 =
        model_file.tensors.iter().filter(|t| t.name.contains("feed_forward.w2.weight")).count();
    let mut i_attention_wv = 0usize;
    let mut i_feed_forward_w2 = 0usize;

    let mut total_size_org = 0u64;
    let mut total_size_new = 0u64;
    let mut hist_all = [0i64; HIST_BINS];

    let n_tensors = model_file.tensors.len();
    for (idx, desc) in model_file.tensors.iter().enumerate() {
        let data = parser.read_tensor_data(desc.file_off, desc.size as usize)?;

        log::info!(
            "[{:4}/{:4}] {:36} - {:16}, type = {:6}",
            idx + 1,
            n_tensors,
            desc.name,
            TensorDesc::shape_string(&desc.ne),
            desc.dtype.name()
        );

        let mut quantize = desc.name.ends_with("weight");
        quantize &= desc.ne.len() == 2;
        quantize &= params.quantize_output_tensor || desc.name != "output.weight";
        quantize &= quantized_type != desc.dtype;

        let (new_type, new_data) = if !quantize {
            log::info!("size = {:8.3} MB", desc.size as f64 / 1024.0 / 1024.0);
            (desc.dtype, data)
        } else {
            let new_type = pick_tensor_type(
                desc,
                params.ftype,
                quantized_type,
                &mut i_attention_wv,
                n_attention_wv,
                &mut i_feed_forward_w2,
                n_feed_forward_w2,
            )?;

            let nelements = desc.n_elements();
            let f32_data: Vec<f32> = if desc.dtype == TensorType::F32 {
                data.chunks_exact(4)
                    .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                    .collect()
            } else {
                if desc.dtype.is_quantized() && !params.allow_requantize {
                    return Err(Error::QuantizeIncompatible(format!(
                        "requantizing from type {} is disabled",
                        desc.dtype.name()
                    )));
                }
                let mut out = vec![0.0f32; nelements];
                convert_to_f32(desc.dtype, &data, nelements, nthread, &mut out)?;
                out
            };

            let mut hist_cur = [0i64; HIST_BINS];
            let packed = quantize_tensor(new_type, &f32_data, nthread, &mut hist_cur)?;

            log::info!(
                "quantized to {:6}, size = {:8.2} MB -> {:8.2} MB",
                new_type.name(),
                desc.size as f64 / 1024.0 / 1024.0,
                packed.len() as f64 / 1024.0 / 1024.0
            );
            let tot_count: i64 = hist_cur.iter().sum();
            if tot_count > 0 {
                let hist_line: Vec<String> = hist_cur
                    .iter()
                    .map(|&h| format!("{:5.3}", h as f64 / nelements as f64))
                    .collect();
                log::info!("hist: {}", hist_line.join(" "));
            }
            for (a, b) in hist_all.iter_mut().zip(hist_cur.iter()) {
                *a += b;
            }

            (new_type, packed)
        };

        total_size_org += desc.size;
        total_size_new += new_data.len() as u64;
        writer.write_tensor(&desc.name, new_type, &desc.ne, &new_data)?;
    }
    writer.finish()?;

    log::info!("model size  = {:8.2} MB", total_size_org as f64 / 1024.0 / 1024.0);
    log::info!("quant size  = {:8.2} MB", total_size_new as f64 / 1024.0 / 1024.0);

    let sum_all: i64 = hist_all.iter().sum();
    if sum_all > 0 {
        let hist_line: Vec<String> =
            hist_all.iter().map(|&h| format!("{:5.3}", h as f64 / sum_all as f64)).collect();
        log::info!("hist: {}", hist_line.join(" "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn more_bits_schedule() {
        // first eighth, last eighth, and every third in between
        let n = 32;
        assert!(use_more_bits(0, n));
        assert!(use_more_bits(3, n));
        assert!(!use_more_bits(4, n));
        assert!(use_more_bits(6, n)); // (6 - 4) % 3 == 2
        assert!(!use_more_bits(7, n));
        assert!(use_more_bits(28, n));
        assert!(use_more_bits(31, n));
    }

    #[test]
    fn k_quant_family() {
        assert!(is_k_quant(TensorType::Q4_K));
        assert!(is_k_quant(TensorType::Q6_K));
        assert!(!is_k_quant(TensorType::Q4_0));
        assert!(!is_k_quant(TensorType::F16));
    }
}
