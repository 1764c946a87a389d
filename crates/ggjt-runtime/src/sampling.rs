//! Token sampling over a candidate array.
//!
//! Stateless transforms of `(id, logit, p)` candidates plus the RNG-backed
//! pickers on [`Context`]. Transforms that need probabilities call
//! [`softmax`] themselves.

use crate::context::Context;
use ggjt_core::vocab::TokenId;
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub id: TokenId,
    pub logit: f32,
    pub p: f32,
}

/// Candidate set for one sampling step.
#[derive(Debug, Clone)]
pub struct TokenDataArray {
    pub data: Vec<TokenData>,
    /// Whether `data` is sorted by logit, descending.
    pub sorted: bool,
}

impl TokenDataArray {
    /// One candidate per vocabulary entry, ids in logit order.
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| TokenData { id: id as TokenId, logit, p: 0.0 })
            .collect();
        Self { data, sorted: false }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn sort_by_logit(c: &mut TokenDataArray) {
    if !c.sorted {
        c.data.sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(std::cmp::Ordering::Equal));
        c.sorted = true;
    }
}

/// Normalize logits into probabilities, sorting candidates by logit.
pub fn softmax(c: &mut TokenDataArray) {
    assert!(!c.is_empty());
    sort_by_logit(c);
    let max_l = c.data[0].logit;
    let mut cum_sum = 0.0f32;
    for d in c.data.iter_mut() {
        d.p = (d.logit - max_l).exp();
        cum_sum += d.p;
    }
    for d in c.data.iter_mut() {
        d.p /= cum_sum;
    }
}

/// Keep the `k` best candidates (at least `min_keep`).
pub fn top_k(c: &mut TokenDataArray, k: usize, min_keep: usize) {
    let k = k.max(min_keep).min(c.len());
    sort_by_logit(c);
    c.data.truncate(k);
}

/// Nucleus sampling: keep the smallest prefix with cumulative mass >= p.
pub fn top_p(c: &mut TokenDataArray, p: f32, min_keep: usize) {
    if p >= 1.0 {
        return;
    }
    softmax(c);
    let mut cum_sum = 0.0f32;
    let mut last_idx = c.len();
    for (i, d) in c.data.iter().enumerate() {
        cum_sum += d.p;
        if cum_sum >= p && i + 1 >= min_keep {
            last_idx = i + 1;
            break;
        }
    }
    c.data.truncate(last_idx);
}

/// Tail-free sampling over the curvature of the sorted probability curve.
pub fn tail_free(c: &mut TokenDataArray, z: f32, min_keep: usize) {
    if z >= 1.0 || c.len() <= 2 {
        return;
    }
    softmax(c);

    let first: Vec<f32> =
        c.data.windows(2).map(|w| w[0].p - w[1].p).collect();
    let mut second: Vec<f32> = first.windows(2).map(|w| (w[0] - w[1]).abs()).collect();
    let sum: f32 = second.iter().sum();
    if sum > 0.0 {
        for v in second.iter_mut() {
            *v /= sum;
        }
    }

    let mut cum_sum = 0.0f32;
    let mut last_idx = c.len();
    for (i, &v) in second.iter().enumerate() {
        cum_sum += v;
        if cum_sum > z && i >= min_keep {
            last_idx = i;
            break;
        }
    }
    c.data.truncate(last_idx);
}

/// Locally typical sampling: rank by closeness to the distribution entropy.
pub fn typical(c: &mut TokenDataArray, p: f32, min_keep: usize) {
    if p >= 1.0 {
        return;
    }
    softmax(c);

    let entropy: f32 = c.data.iter().map(|d| -d.p * d.p.ln()).sum();
    let mut indices: Vec<usize> = (0..c.len()).collect();
    indices.sort_by(|&a, &b| {
        let sa = (-c.data[a].p.ln() - entropy).abs();
        let sb = (-c.data[b].p.ln() - entropy).abs();
        sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut cum_sum = 0.0f32;
    let mut last_idx = indices.len();
    for (i, &idx) in indices.iter().enumerate() {
        cum_sum += c.data[idx].p;
        if cum_sum > p && i + 1 >= min_keep {
            last_idx = i + 1;
            break;
        }
    }

    let new_data: Vec<TokenData> = indices[..last_idx].iter().map(|&i| c.data[i]).collect();
    c.data = new_data;
    c.sorted = false;
}

/// Divide every logit by `temp`.
pub fn temperature(c: &mut TokenDataArray, temp: f32) {
    for d in c.data.iter_mut() {
        d.logit /= temp;
    }
}

/// Penalize tokens seen in `last_tokens`: positive logits shrink, negative
/// logits grow more negative.
pub fn repetition_penalty(c: &mut TokenDataArray, last_tokens: &[TokenId], penalty: f32) {
    if last_tokens.is_empty() || penalty == 1.0 {
        return;
    }
    for d in c.data.iter_mut() {
        if !last_tokens.contains(&d.id) {
            continue;
        }
        if d.logit <= 0.0 {
            d.logit *= penalty;
        } else {
            d.logit /= penalty;
        }
    }
    c.sorted = false;
}

/// OpenAI-style frequency and presence penalties.
pub fn frequency_and_presence_penalties(
    c: &mut TokenDataArray,
    last_tokens: &[TokenId],
    alpha_frequency: f32,
    alpha_presence: f32,
) {
    if last_tokens.is_empty() || (alpha_frequency == 0.0 && alpha_presence == 0.0) {
        return;
    }
    let mut counts = std::collections::HashMap::new();
    for &t in last_tokens {
        *counts.entry(t).or_insert(0i32) += 1;
    }
    for d in c.data.iter_mut() {
        if let Some(&count) = counts.get(&d.id) {
            d.logit -= count as f32 * alpha_frequency + if count > 0 { alpha_presence } else { 0.0 };
        }
    }
    c.sorted = false;
}

fn log_softmax(array: &mut [f32]) {
    let max_l = array.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in array.iter_mut() {
        *v = (*v - max_l).exp();
        sum += *v;
    }
    for v in array.iter_mut() {
        *v = (*v / sum).ln();
    }
}

impl Context {
    fn timed<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let t0 = Instant::now();
        let r = f(self);
        self.t_sample_us += t0.elapsed().as_micros() as i64;
        r
    }

    pub fn sample_softmax(&mut self, c: &mut TokenDataArray) {
        self.timed(|_| softmax(c));
    }

    pub fn sample_top_k(&mut self, c: &mut TokenDataArray, k: usize, min_keep: usize) {
        self.timed(|_| top_k(c, k, min_keep));
    }

    pub fn sample_top_p(&mut self, c: &mut TokenDataArray, p: f32, min_keep: usize) {
        self.timed(|_| top_p(c, p, min_keep));
    }

    pub fn sample_tail_free(&mut self, c: &mut TokenDataArray, z: f32, min_keep: usize) {
        self.timed(|_| tail_free(c, z, min_keep));
    }

    pub fn sample_typical(&mut self, c: &mut TokenDataArray, p: f32, min_keep: usize) {
        self.timed(|_| typical(c, p, min_keep));
    }

    pub fn sample_temperature(&mut self, c: &mut TokenDataArray, temp: f32) {
        self.timed(|_| temperature(c, temp));
    }

    pub fn sample_repetition_penalty(
        &mut self,
        c: &mut TokenDataArray,
        last_tokens: &[TokenId],
        penalty: f32,
    ) {
        self.timed(|_| repetition_penalty(c, last_tokens, penalty));
    }

    pub fn sample_frequency_and_presence_penalties(
        &mut self,
        c: &mut TokenDataArray,
        last_tokens: &[TokenId],
        alpha_frequency: f32,
        alpha_presence: f32,
    ) {
        self.timed(|_| frequency_and_presence_penalties(c, last_tokens, alpha_frequency, alpha_presence));
    }

    /// Blend the candidates' logits with those of a guidance evaluation.
    pub fn sample_classifier_free_guidance(
        &mut self,
        c: &mut TokenDataArray,
        guidance_logits: &[f32],
        scale: f32,
        smooth_factor: f32,
    ) {
        self.timed(|_| {
            assert_eq!(c.len(), guidance_logits.len());
            assert!(!c.sorted);

            let mut logits_base: Vec<f32> = c.data.iter().map(|d| d.logit).collect();
            log_softmax(&mut logits_base);

            let mut logits_guidance = guidance_logits.to_vec();
            log_softmax(&mut logits_guidance);

            for (g, &b) in logits_guidance.iter_mut().zip(logits_base.iter()) {
                *g = scale * (b - *g) + *g;
            }
            log_softmax(&mut logits_guidance);

            for (d, (&g, &b)) in c.data.iter_mut().zip(logits_guidance.iter().zip(logits_base.iter()))
            {
                d.logit = smooth_factor * g + (1.0 - smooth_factor) * b;
            }
        })
    }

    /// Mirostat v1: estimate the Zipf exponent from the top `m` candidates,
    /// derive a dynamic top-k, and track surprise against `tau` via `mu`.
    pub fn sample_token_mirostat(
        &mut self,
        c: &mut TokenDataArray,
        tau: f32,
        eta: f32,
        m: usize,
        mu: &mut f32,
    ) -> TokenId {
        let n_vocab = self.n_vocab() as f32;
        self.timed(|_| softmax(c));

        let mut sum_ti_bi = 0.0f32;
        let mut sum_ti_sq = 0.0f32;
        for i in 0..m.saturating_sub(1).min(c.len().saturating_sub(1)) {
            let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
            let b_i = (c.data[i].p / c.data[i + 1].p).ln();
            sum_ti_bi += t_i * b_i;
            sum_ti_sq += t_i * t_i;
        }
        let s_hat = sum_ti_bi / sum_ti_sq;

        let epsilon_hat = s_hat - 1.0;
        let k = ((epsilon_hat * 2.0f32.powf(*mu)) / (1.0 - n_vocab.powf(-epsilon_hat)))
            .powf(1.0 / s_hat);

        self.timed(|_| top_k(c, k as usize, 1));
        let x = self.sample_token(c);

        let observed_surprise = self.timed(|_| {
            let idx = c.data.iter().position(|d| d.id == x).unwrap_or(0);
            -c.data[idx].p.log2()
        });
        *mu -= eta * (observed_surprise - tau);
        x
    }

    /// Mirostat v2: truncate candidates above the `mu` surprise bound.
    pub fn sample_token_mirostat_v2(
        &mut self,
        c: &mut TokenDataArray,
        tau: f32,
        eta: f32,
        mu: &mut f32,
    ) -> TokenId {
        self.timed(|_| {
            softmax(c);
            let cut = c.data.iter().position(|d| -d.p.log2() > *mu).unwrap_or(c.len());
            c.data.truncate(cut.max(1));
            softmax(c);
        });

        let x = self.sample_token(c);

        let observed_surprise = self.timed(|_| {
            let idx = c.data.iter().position(|d| d.id == x).unwrap_or(0);
            -c.data[idx].p.log2()
        });
        *mu -= eta * (observed_surprise - tau);
        x
    }

    /// Pick the highest-logit candidate.
    pub fn sample_token_greedy(&mut self, c: &mut TokenDataArray) -> TokenId {
        self.timed(|this| {
            let best = c
                .data
                .iter()
                .max_by(|a, b| a.logit.partial_cmp(&b.logit).unwrap_or(std::cmp::Ordering::Equal))
                .map(|d| d.id)
                .unwrap_or(0);
            this.n_sample += 1;
            best
        })
    }

    /// Sample proportionally to the candidates' probabilities.
    pub fn sample_token(&mut self, c: &mut TokenDataArray) -> TokenId {
        softmax(c);
        self.timed(|this| {
            let probs: Vec<f32> = c.data.iter().map(|d| d.p).collect();
            let idx = match WeightedIndex::new(&probs) {
                Ok(dist) => dist.sample(&mut this.rng),
                Err(_) => 0,
            };
            this.n_sample += 1;
            c.data[idx].id
        })
    }
}
