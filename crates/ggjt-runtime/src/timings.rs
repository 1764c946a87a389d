//! Per-context timing counters and reporting.

use crate::context::Context;
use std::time::Instant;

/// Snapshot of a context's timing counters, milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub t_start_ms: f64,
    pub t_end_ms: f64,
    pub t_load_ms: f64,
    pub t_sample_ms: f64,
    pub t_p_eval_ms: f64,
    pub t_eval_ms: f64,

    pub n_sample: i32,
    pub n_p_eval: i32,
    pub n_eval: i32,
}

impl Context {
    pub fn get_timings(&self) -> Timings {
        Timings {
            t_start_ms: 0.0,
            t_end_ms: self.t_start.elapsed().as_secs_f64() * 1e3,
            t_load_ms: 1e-3 * self.t_load_us as f64,
            t_sample_ms: 1e-3 * self.t_sample_us as f64,
            t_p_eval_ms: 1e-3 * self.t_p_eval_us as f64,
            t_eval_ms: 1e-3 * self.t_eval_us as f64,
            n_sample: self.n_sample.max(1),
            n_p_eval: self.n_p_eval.max(1),
            n_eval: self.n_eval.max(1),
        }
    }

    pub fn print_timings(&self) {
        let t = self.get_timings();
        log::info!("       load time = {:8.2} ms", t.t_load_ms);
        log::info!(
            "     sample time = {:8.2} ms / {:5} runs   ({:8.2} ms per token, {:8.2} tokens per second)",
            t.t_sample_ms,
            t.n_sample,
            t.t_sample_ms / t.n_sample as f64,
            1e3 / t.t_sample_ms * t.n_sample as f64
        );
        log::info!(
            "prompt eval time = {:8.2} ms / {:5} tokens ({:8.2} ms per token, {:8.2} tokens per second)",
            t.t_p_eval_ms,
            t.n_p_eval,
            t.t_p_eval_ms / t.n_p_eval as f64,
            1e3 / t.t_p_eval_ms * t.n_p_eval as f64
        );
        log::info!(
            "       eval time = {:8.2} ms / {:5} runs   ({:8.2} ms per token, {:8.2} tokens per second)",
            t.t_eval_ms,
            t.n_eval,
            t.t_eval_ms / t.n_eval as f64,
            1e3 / t.t_eval_ms * t.n_eval as f64
        );
        log::info!("      total time = {:8.2} ms", t.t_end_ms - t.t_start_ms);
    }

    pub fn reset_timings(&mut self) {
        self.t_start = Instant::now();
        self.t_sample_us = 0;
        self.n_sample = 0;
        self.t_eval_us = 0;
        self.n_eval = 0;
        self.t_p_eval_us = 0;
        self.n_p_eval = 0;
    }
}
