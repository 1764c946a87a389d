//! Split computation graph for the transformer forward pass.
//!
//! The builder emits the standard rotary-embedding LLaMA decoder DAG over the
//! persistent KV cache, partitioned into per-backend sub-graphs. An op is
//! materialized in the sub-graph of the backend that owns its output; values
//! crossing a backend boundary are re-registered as named inputs of the
//! consuming sub-graph so the scheduler can stage the transfers.

use crate::backend::BackendId;
use crate::model::{Model, WeightId};
use ggjt_core::error::{Error, Result};
use ggjt_core::tensor::TensorType;

/// Logical tensor layout over some backing storage: element counts, element
/// strides and an element offset. At most three dimensions appear in the
/// forward graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Layout {
    pub ne: [usize; 3],
    pub stride: [usize; 3],
    pub offset: usize,
}

impl Layout {
    pub fn contiguous(ne: [usize; 3]) -> Self {
        Self { ne, stride: [1, ne[0], ne[0] * ne[1]], offset: 0 }
    }

    pub fn n_elements(&self) -> usize {
        self.ne[0] * self.ne[1] * self.ne[2]
    }

    pub fn is_contiguous(&self) -> bool {
        self.stride[0] == 1
            && self.stride[1] == self.ne[0]
            && self.stride[2] == self.ne[0] * self.ne[1]
    }

    /// ggml's permute(0, 2, 1, 3): swap the middle dimensions.
    pub fn permute_0213(mut self) -> Self {
        self.ne.swap(1, 2);
        self.stride.swap(1, 2);
        self
    }

    /// Swap the first two dimensions.
    pub fn transpose(mut self) -> Self {
        self.ne.swap(0, 1);
        self.stride.swap(0, 1);
        self
    }
}

/// Reference to a node: sub-graph index plus node index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub split: usize,
    pub node: usize,
}

/// Which KV arena a cache op touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvTarget {
    K,
    V,
}

/// Graph operations. These are the named ops of the backend contract; view,
/// reshape, permute and transpose are metadata-only and resolve to aliases of
/// their source's storage at execution time.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Value produced by another sub-graph, staged in by the scheduler.
    Input,
    /// View of the context's token staging buffer, `[n_tokens]` i32.
    ViewTokens,
    /// View of the context's input-embedding staging buffer, `[n_embd, n_tokens]`.
    ViewEmbd,
    /// Embedding lookup: rows of a weight matrix selected by token ids.
    GetRows { weight: WeightId },
    RmsNorm,
    /// Broadcast multiply by a 1-D weight (norm scales).
    MulWeight { weight: WeightId },
    /// `weight [n_in x n_out]` times the source activations `[n_in, N]`.
    MatMulWeight { weight: WeightId },
    /// Generic matmul: both sources share contiguous dim 0, grouped on dim 2.
    MatMul,
    Reshape { ne: [usize; 3] },
    Permute0213,
    Transpose,
    Rope { n_past: usize, n_rot: usize },
    /// Store the current batch into the KV cache for `layer` at `n_past`.
    CpyKv { target: KvTarget, layer: usize, n_past: usize },
    /// Strided view of one layer's KV cache covering `n_kv` positions. The
    /// source edge is the corresponding `CpyKv` node: an ordering constraint,
    /// not a data edge.
    ViewKv { target: KvTarget, layer: usize, n_kv: usize },
    Scale { value: f32 },
    DiagMaskInf { n_past: usize },
    SoftMax,
    Silu,
    Mul,
    Add,
    /// Materialize a strided source as a contiguous tensor of `dtype`.
    Contiguous { dtype: TensorType },
    /// Copy logits into the context's output buffer.
    CpyLogits { all: bool },
    /// Copy the last token's hidden state into the embeddings output buffer.
    CpyEmbdOut,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub src: [Option<NodeRef>; 2],
    pub name: &'static str,
}

/// One backend-local sub-graph plus its externally-sourced inputs.
#[derive(Debug)]
pub struct Split {
    /// Position of this sub-graph in the global execution order.
    pub index: usize,
    pub backend: BackendId,
    pub name: String,
    /// `(producer, local_input_node)` pairs: before execution the scheduler
    /// copies the producer's value into the local `Op::Input` node.
    pub inputs: Vec<(NodeRef, usize)>,
    pub nodes: Vec<Node>,
}

/// The full forward graph: sub-graphs in execution order.
#[derive(Debug)]
pub struct SplitGraph {
    pub splits: Vec<Split>,
    pub n_tokens: usize,
}

struct GraphBuilder {
    splits: Vec<Split>,
}

impl GraphBuilder {
    fn new() -> Self {
        Self { splits: Vec::new() }
    }

    fn current_backend(&self) -> Option<BackendId> {
        self.splits.last().map(|s| s.backend)
    }

    fn push(&mut self, op: Op, src: [Option<NodeRef>; 2], name: &'static str) -> NodeRef {
        let split = self.splits.len() - 1;
        let nodes = &mut self.splits[split].nodes;
        nodes.push(Node { op, src, name });
        NodeRef { split, node: nodes.len() - 1 }
    }

    fn push1(&mut self, op: Op, src: NodeRef, name: &'static str) -> NodeRef {
        self.push(op, [Some(src), None], name)
    }

    /// Continue on `backend`, transferring the `moved` values across the
    /// boundary when the backend changes. Each moved reference is rewritten
    /// to the proxy input node in the new sub-graph.
    fn split_to(&mut self, backend: BackendId, name: String, moved: &mut [&mut NodeRef]) {
        if self.current_backend() == Some(backend) {
            return;
        }
        let split = self.splits.len();
        self.splits.push(Split { index: split, backend, name, inputs: Vec::new(), nodes: Vec::new() });
        for value in moved.iter_mut() {
            let producer = **value;
            let local = self.splits[split].nodes.len();
            self.splits[split].nodes.push(Node { op: Op::Input, src: [None, None], name: "input" });
            self.splits[split].inputs.push((producer, local));
            **value = NodeRef { split, node: local };
        }
    }
}

/// Parameters of one forward-graph construction.
pub struct GraphParams {
    pub n_tokens: usize,
    pub n_past: usize,
    pub embeddings_input: bool,
    pub compute_type: TensorType,
    pub logits_all: bool,
    pub want_embeddings: bool,
    pub backend_kv: BackendId,
}

/// Build the split forward graph for one batch.
pub fn build_graph(model: &Model, params: &GraphParams) -> Result<SplitGraph> {
    let hparams = &model.hparams;
    let n = params.n_tokens;
    let n_embd = hparams.n_embd as usize;
    let n_head = hparams.n_head as usize;
    let n_layer = hparams.n_layer as usize;
    let n_rot = n_embd / n_head;
    let head_dim = n_embd / n_head;
    let n_past = params.n_past;
    let n_kv = n_past + n;

    if n == 0 {
        return Err(Error::InvalidParameter("empty batch".into()));
    }
    if !matches!(params.compute_type, TensorType::F32 | TensorType::F16) {
        return Err(Error::InvalidParameter("compute type must be F32 or F16".into()));
    }

    let kq_scale = 1.0 / (n_embd as f32 / n_head as f32).sqrt();

    let mut b = GraphBuilder::new();

    let mut inp_l;
    if params.embeddings_input {
        b.split_to(model.backend_inp, "input_embd".to_string(), &mut []);
        inp_l = b.push(Op::ViewEmbd, [None, None], "embeddings_in");
    } else {
        b.split_to(model.backend_inp, "input_tokens".to_string(), &mut []);
        let tokens = b.push(Op::ViewTokens, [None, None], "tokens_in");
        inp_l = b.push1(Op::GetRows { weight: model.tok_embeddings }, tokens, "inp_embd");
    }

    for il in 0..n_layer {
        let ctx_l = model.backend_layers[il];
        let layer = &model.layers[il];

        b.split_to(ctx_l, format!("l{}", il), &mut [&mut inp_l]);
        let inp_sa = inp_l;

        // norm
        let mut cur = b.push1(Op::RmsNorm, inp_l, "rms_norm_0");
        cur = b.push1(Op::MulWeight { weight: layer.attention_norm }, cur, "attention_norm_0");

        // self-attention: project, reshape per head, rotate
        let tmpq = b.push1(Op::MatMulWeight { weight: layer.wq }, cur, "tmpq");
        let tmpk = b.push1(Op::MatMulWeight { weight: layer.wk }, cur, "tmpk");
        let tmpv = b.push1(Op::MatMulWeight { weight: layer.wv }, cur, "tmpv");

        let q3 = b.push1(Op::Reshape { ne: [head_dim, n_head, n] }, tmpq, "q3");
        let mut q_cur = b.push1(Op::Rope { n_past, n_rot }, q3, "Qcur");
        let k3 = b.push1(Op::Reshape { ne: [head_dim, n_head, n] }, tmpk, "k3");
        let mut k_cur = b.push1(Op::Rope { n_past, n_rot }, k3, "Kcur");
        let v2 = b.push1(Op::Reshape { ne: [n_embd, n, 1] }, tmpv, "v2");
        let mut v_cur = b.push1(Op::Transpose, v2, "Vcur");

        b.split_to(
            params.backend_kv,
            format!("l{}_attn", il),
            &mut [&mut k_cur, &mut v_cur, &mut q_cur],
        );

        // the RoPE-ed K is what the cache stores
        let k_cpy = b.push1(Op::CpyKv { target: KvTarget::K, layer: il, n_past }, k_cur, "k_cpy");
        let v_cpy = b.push1(Op::CpyKv { target: KvTarget::V, layer: il, n_past }, v_cur, "v_cpy");

        let q = b.push1(Op::Permute0213, q_cur, "Q");

        let k_view = b.push1(Op::ViewKv { target: KvTarget::K, layer: il, n_kv }, k_cpy, "k_v");
        let k_resh = b.push1(Op::Reshape { ne: [head_dim, n_head, n_kv] }, k_view, "k3d");
        let k = b.push1(Op::Permute0213, k_resh, "K");

        let kq = b.push(Op::MatMul, [Some(k), Some(q)], "KQ");
        let kq_scaled = b.push1(Op::Scale { value: kq_scale }, kq, "KQ_scaled");
        let kq_masked = b.push1(Op::DiagMaskInf { n_past }, kq_scaled, "KQ_masked");
        let kq_soft_max = b.push1(Op::SoftMax, kq_masked, "KQ_soft_max");

        let v = b.push1(Op::ViewKv { target: KvTarget::V, layer: il, n_kv }, v_cpy, "V");
        let mut kqv = b.push(Op::MatMul, [Some(v), Some(kq_soft_max)], "KQV");

        b.split_to(ctx_l, format!("l{}", il), &mut [&mut kqv]);

        let kqv_merged = b.push1(Op::Permute0213, kqv, "KQV_merged");
        cur = b.push1(
            Op::Contiguous { dtype: params.compute_type },
            kqv_merged,
            "KQV_merged_contiguous",
        );

        // projection (no bias), then residual
        cur = b.push1(Op::MatMulWeight { weight: layer.wo }, cur, "result_wo");
        let inp_ff = b.push(Op::Add, [Some(cur), Some(inp_sa)], "inpFF");

        // feed-forward network
        cur = b.push1(Op::RmsNorm, inp_ff, "rms_norm_1");
        cur = b.push1(Op::MulWeight { weight: layer.ffn_norm }, cur, "ffn_norm");

        let tmp = b.push1(Op::MatMulWeight { weight: layer.w3 }, cur, "result_w3");
        cur = b.push1(Op::MatMulWeight { weight: layer.w1 }, cur, "result_w1");
        cur = b.push1(Op::Silu, cur, "silu");
        cur = b.push(Op::Mul, [Some(cur), Some(tmp)], "silu_x_result_w3");
        cur = b.push1(Op::MatMulWeight { weight: layer.w2 }, cur, "result_w2");

        cur = b.push(Op::Add, [Some(cur), Some(inp_ff)], "inpFF_+_result_w2");

        inp_l = cur;
    }

    b.split_to(model.backend_out, "output".to_string(), &mut [&mut inp_l]);

    // final norm
    let mut cur = b.push1(Op::RmsNorm, inp_l, "rms_norm_2");
    cur = b.push1(Op::MulWeight { weight: model.norm }, cur, "result_norm");

    if params.want_embeddings {
        b.push1(Op::CpyEmbdOut, cur, "embeddings_out");
    }

    // lm_head
    cur = b.push1(Op::MatMulWeight { weight: model.output }, cur, "result_output");
    b.push1(Op::CpyLogits { all: params.logits_all }, cur, "logits");

    Ok(SplitGraph { splits: b.splits, n_tokens: n })
}
