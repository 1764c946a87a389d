//! Sub-graph scheduler.
//!
//! Walks the split graph in insertion order, stages cross-backend transfers
//! ahead of each sub-graph, and synchronizes the output backend before the
//! caller reads logits or embeddings. Intra-sub-graph parallelism belongs to
//! the backend.

use crate::exec::ExecEnv;
use crate::graph::SplitGraph;
use crate::model::Model;
use ggjt_core::error::Result;

/// Threshold batch size above which a BLAS-capable CPU backend runs single
/// threaded; worker threads would only spin-wait on the BLAS calls.
const BLAS_BATCH_THRESHOLD: usize = 32;

/// Effective CPU thread count for one eval.
pub fn effective_n_threads(model: &Model, n_tokens: usize, n_threads: usize) -> usize {
    let cpu = model.backend(0);
    if n_tokens >= BLAS_BATCH_THRESHOLD && cpu.has_blas() {
        1
    } else {
        n_threads.max(1)
    }
}

/// Execute the whole split graph against `env`.
pub fn execute(graph: &SplitGraph, model: &Model, env: &mut ExecEnv, n_threads: usize) -> Result<()> {
    let n_threads = effective_n_threads(model, graph.n_tokens, n_threads);
    model.backend(0).set_n_threads(n_threads);

    for split in &graph.splits {
        // stage externally-produced inputs; device backends would overlap
        // these copies with compute on their queues
        for &(producer, local) in &split.inputs {
            let src_backend = graph.splits[producer.split].backend;
            let bytes = env.stage_input(
                producer,
                crate::graph::NodeRef { split: split.index, node: local },
            )?;
            log::trace!(
                "transfer '{}': {} bytes {} -> {}",
                split.name,
                bytes,
                model.backend(src_backend).name(),
                model.backend(split.backend).name(),
            );
        }

        model.backend(split.backend).execute(split, env)?;
    }

    // make the final outputs visible to the caller
    model.backend(model.backend_out).synchronize();
    Ok(())
}
