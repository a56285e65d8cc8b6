// ============================================================
// Layer 2 — Bias Correction Layer (Burn)
// ============================================================
// A drop-in module for the hidden states of a host model:
//
//   input  [batch, seq, hidden]
//      │
//      ▼  for each scale: project → divergence vs reference
//      │                  (training) gate a correction, keep it
//      │                  only if the divergence goes down
//      ▼
//   per-token normalisation → gamma / beta affine
//      │
//      ▼
//   output [batch, seq, hidden]
//
// Learnable tensors are Params and are updated by the host
// optimiser. Running statistics live in ReflectionStats and
// change on every training-mode forward call, so identical
// inputs can produce different outputs over time. Evaluation
// mode freezes all state and makes the layer deterministic.

use burn::{
    module::{Ignored, Param},
    prelude::*,
    tensor::{activation::sigmoid, Distribution},
};

use crate::domain::error::{LayerError, LayerResult};
use crate::domain::policy::NonFinitePolicy;
use crate::domain::report::ReflectionReport;
use crate::ml::config::BiasCorrectionConfig;
use crate::ml::divergence::{ChannelMoments, DivergenceEstimator};
use crate::ml::stats::ReflectionStats;

/// Weight of the L1 penalty returned by `sparsity_loss`
const PROJ_SPARSITY: f64 = 0.01;

/// Bounds on the mean deviation that scales a correction
const DEVIATION_FLOOR: f64 = 0.05;
const DEVIATION_CEIL:  f64 = 10.0;

#[derive(Module, Debug)]
pub struct BiasCorrectionLayer<B: Backend> {
    gamma:        Param<Tensor<B, 1>>,
    beta:         Param<Tensor<B, 1>>,
    /// [ref_dim, hidden_dim]
    proj:         Param<Tensor<B, 2>>,
    proj_bias:    Param<Tensor<B, 1>>,
    /// Per-scale channel gates before the sigmoid, [scales, ref_dim]
    proj_weights: Param<Tensor<B, 2>>,
    ref_mu:       Param<Tensor<B, 1>>,
    ref_sigma:    Param<Tensor<B, 1>>,
    stats:        ReflectionStats<B>,
    config:       Ignored<BiasCorrectionConfig>,
    training:     bool,
}

/// Everything a diagnostic forward pass produces.
#[derive(Debug, Clone)]
pub struct ReflectionOutput<B: Backend> {
    pub output:          Tensor<B, 3>,
    /// Kept corrections of this pass, quantised and detached, each [hidden]
    pub corrections:     Vec<Tensor<B, 1>>,
    pub reference_mu:    Tensor<B, 1>,
    pub reference_sigma: Tensor<B, 1>,
    pub report:          ReflectionReport,
}

/// Result of projecting one scale.
struct Projection<B: Backend> {
    moments:  ChannelMoments<B>,
    /// Gated projection matrix, [ref_dim, hidden_dim]
    weighted: Tensor<B, 2>,
}

impl<B: Backend> BiasCorrectionLayer<B> {
    /// Build from an already validated config. Use `BiasCorrectionConfig::init`.
    pub(crate) fn from_config(config: BiasCorrectionConfig, device: &B::Device) -> Self {
        let hidden = config.hidden_dim;
        let refd   = config.ref_dim;
        let proj_std = 1.0 / (hidden as f64).sqrt();

        let proj = Tensor::random([refd, hidden], Distribution::Normal(0.0, proj_std), device);

        Self {
            gamma:        Param::from_tensor(Tensor::ones([hidden], device)),
            beta:         Param::from_tensor(Tensor::zeros([hidden], device)),
            proj:         Param::from_tensor(proj),
            proj_bias:    Param::from_tensor(Tensor::zeros([refd], device)),
            proj_weights: Param::from_tensor(Tensor::ones([config.scales.len(), refd], device)),
            ref_mu:       Param::from_tensor(Tensor::zeros([refd], device)),
            ref_sigma:    Param::from_tensor(Tensor::ones([refd], device)),
            stats:        ReflectionStats::new(
                hidden,
                config.history_rows(),
                config.trainable_reference,
                device,
            ),
            config:       Ignored(config),
            training:     true,
        }
    }

    // ── Mode ──────────────────────────────────────────────────────────────────

    /// Statistics update and corrections are applied (the default).
    pub fn train(mut self) -> Self {
        self.training = true;
        self
    }

    /// Frozen state: no statistics update, no corrections.
    pub fn eval(mut self) -> Self {
        self.training = false;
        self
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    // ── Forward ───────────────────────────────────────────────────────────────

    /// input: [batch, seq, hidden_dim] → [batch, seq, hidden_dim]
    pub fn forward(&self, input: Tensor<B, 3>) -> LayerResult<Tensor<B, 3>> {
        self.forward_with_report(input).map(|out| out.output)
    }

    /// Same as `forward` but also returns the per-scale divergences,
    /// the kept corrections and a snapshot of the running statistics.
    pub fn forward_with_report(&self, input: Tensor<B, 3>) -> LayerResult<ReflectionOutput<B>> {
        let cfg = &*self.config;
        let dims = input.dims();
        let [batch, seq, hidden] = dims;
        if hidden != cfg.hidden_dim || batch == 0 || seq == 0 {
            return Err(LayerError::Shape { expected: cfg.hidden_dim, actual: dims });
        }

        let non_finite = count_non_finite(&input);
        if non_finite > 0 {
            if cfg.non_finite == NonFinitePolicy::Reject {
                return Err(LayerError::NonFinite { count: non_finite });
            }
            tracing::warn!("{} non-finite input values, running statistics left untouched", non_finite);
        }
        let update_stats = self.training && non_finite == 0;
        let correcting   = update_stats && !cfg.monitor_only;

        let threshold = cfg.kl_threshold * (1.0 + self.stats.variance_ema());

        let mut x_corr = input;
        let mut corrections: Vec<Tensor<B, 1>> = Vec::new();
        let mut kl_values = Vec::with_capacity(cfg.scales.len());

        for (idx, &scale) in cfg.scales.iter().enumerate() {
            if corrections.len() >= cfg.max_corrections {
                break;
            }

            let projection = self.project(x_corr.clone(), idx, scale);
            let kl = self.divergence(&projection.moments);
            let kl_value = kl.clone().into_scalar().elem::<f64>();
            kl_values.push(kl_value);

            if update_stats {
                self.update_reference(kl);
            }
            if !correcting || kl_value <= threshold {
                continue;
            }

            let correction = self.compute_correction(&projection, scale);
            let x_post = x_corr.clone() + correction.clone().reshape([1, 1, hidden]);

            // keep the correction only if it moves the batch towards the reference
            let post = self.project(x_post.clone(), idx, scale);
            let kl_post = self.divergence(&post.moments).into_scalar().elem::<f64>();
            if kl_post < kl_value {
                tracing::debug!(
                    "scale {} ({}): kl {:.5} → {:.5}, correction kept",
                    idx, scale, kl_value, kl_post
                );
                x_corr = x_post;
                corrections.push(self.compress(correction.detach()));
            }
        }

        if update_stats {
            self.stats.record_corrections(&corrections);
        }

        let x_norm = self.normalize(x_corr, update_stats);
        let output = x_norm * self.gamma.val().reshape([1, 1, hidden])
            + self.beta.val().reshape([1, 1, hidden]);

        let report = ReflectionReport {
            kl_values,
            threshold,
            correction_count:    corrections.len(),
            kl_ema:              self.stats.kl_ema(),
            variance_ema:        self.stats.variance_ema(),
            reference_trainable: self.stats.reference_open(),
        };
        tracing::debug!(
            "forward [{}, {}, {}]: kl={:?} threshold={:.5} corrections={}",
            batch, seq, hidden, report.kl_values, threshold, report.correction_count
        );

        Ok(ReflectionOutput {
            output,
            corrections,
            reference_mu:    self.ref_mu.val().detach(),
            reference_sigma: self.ref_sigma.val().detach(),
            report,
        })
    }

    /// Project `x * scale` into the reference space with the rows of the
    /// projection gated by `sigmoid(proj_weights[scale_idx])`.
    fn project(&self, x: Tensor<B, 3>, scale_idx: usize, scale: f64) -> Projection<B> {
        let [batch, seq, hidden] = x.dims();
        let refd = self.config.ref_dim;

        let gates = sigmoid(
            self.proj_weights.val().slice([scale_idx..scale_idx + 1, 0..refd]),
        ).reshape([refd, 1]);
        let weighted = self.proj.val() * gates;

        let rows = x.reshape([batch * seq, hidden]).mul_scalar(scale)
            .matmul(weighted.clone().transpose())
            + self.proj_bias.val().reshape([1, refd]);

        Projection {
            moments: ChannelMoments::from_rows(rows, self.config.eps),
            weighted,
        }
    }

    fn divergence(&self, batch: &ChannelMoments<B>) -> Tensor<B, 1> {
        let reference = self.reference_moments();
        self.config.divergence.divergence(batch, &reference, self.config.eps)
    }

    /// Reference parameters, cut from the graph while the gate is closed.
    fn reference_moments(&self) -> ChannelMoments<B> {
        let (mu, sigma) = if self.stats.reference_open() {
            (self.ref_mu.val(), self.ref_sigma.val())
        } else {
            (self.ref_mu.val().detach(), self.ref_sigma.val().detach())
        };
        ChannelMoments::reference(mu, sigma, self.config.eps)
    }

    /// Shift in input space that pulls the projected mean towards the
    /// reference mean:
    ///   −α · clamp(mean|δ|, 0.05, 10) · (δ · W) · scale,  δ = μ − μ_ref
    fn compute_correction(&self, projection: &Projection<B>, scale: f64) -> Tensor<B, 1> {
        let cfg = &*self.config;
        let [refd, hidden] = projection.weighted.dims();

        let delta = projection.moments.mean.clone() - self.reference_moments().mean;
        let magnitude = delta.clone().abs().mean()
            .clamp(DEVIATION_FLOOR, DEVIATION_CEIL)
            .mul_scalar(-cfg.alpha * scale);

        let back = delta.reshape([1, refd]).matmul(projection.weighted.clone());
        let correction = (back * magnitude.reshape([1, 1])).reshape([hidden]);

        match cfg.gradient_clip {
            Some(clip) if self.training => correction.clamp(-clip, clip),
            _ => correction,
        }
    }

    /// Round to multiples of `1 / compression_factor`.
    fn compress(&self, correction: Tensor<B, 1>) -> Tensor<B, 1> {
        let factor = self.config.compression_factor as f64;
        correction.mul_scalar(factor).round().div_scalar(factor)
    }

    /// Per-token standardisation over the hidden axis with the unbiased std.
    fn normalize(&self, x: Tensor<B, 3>, update_stats: bool) -> Tensor<B, 3> {
        let [_, _, hidden] = x.dims();
        let eps = self.config.eps;

        let mean = x.clone().mean_dim(2);
        let var = if hidden > 1 { x.clone().var(2) } else { x.clone().var_bias(2) };

        if update_stats {
            let observed = var.clone().sqrt().mean();
            self.stats.record_variance(observed, self.config.ema_decay);
        }

        let floor = eps * 10.0;
        let std = var.clamp_min(floor * floor).sqrt();
        (x - mean) / std.add_scalar(eps)
    }

    /// Fold the divergence into `kl_ema` and open or close the reference
    /// gate: open above twice the threshold, closed at or below it.
    fn update_reference(&self, kl: Tensor<B, 1>) {
        let cfg = &*self.config;
        self.stats.record_divergence(kl, cfg.ema_decay);

        let kl_ema = self.stats.kl_ema();
        let open = self.stats.reference_open();
        if !open && kl_ema > 2.0 * cfg.kl_threshold {
            tracing::debug!("kl_ema {:.5} above 2×threshold, reference unfrozen", kl_ema);
            self.stats.set_reference_gate(true);
        } else if open && kl_ema <= cfg.kl_threshold {
            tracing::debug!("kl_ema {:.5} within threshold, reference frozen", kl_ema);
            self.stats.set_reference_gate(false);
        }
    }

    // ── Maintenance ───────────────────────────────────────────────────────────

    /// Tensor that, added to an input, undoes the corrections of the last
    /// training pass: all of them for `None`, one history row for `Some(i)`.
    /// An out-of-range step logs a warning and yields zeros.
    pub fn rollback(&self, step: Option<usize>) -> Tensor<B, 1> {
        let len = self.stats.history_len();
        if len == 0 {
            return self.zeros_hidden();
        }
        match step {
            None => self.stats.correction_buffer().neg(),
            Some(i) => match self.stats.history_row(i) {
                Some(row) => row.neg(),
                None => {
                    tracing::warn!(
                        "invalid rollback step {}, must be None or in range [0, {}]",
                        i, len - 1
                    );
                    self.zeros_hidden()
                }
            },
        }
    }

    /// L1 regulariser on the projection gates, to be added to the host loss.
    pub fn sparsity_loss(&self) -> Tensor<B, 1> {
        self.proj_weights.val().abs().mean().mul_scalar(PROJ_SPARSITY)
    }

    /// Stop gradients into the reference distribution until the
    /// divergence average reopens the gate.
    pub fn freeze_reference(&self) {
        self.stats.set_reference_gate(false);
    }

    /// Restore the running statistics and correction history to their initial values.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn config(&self) -> &BiasCorrectionConfig {
        &self.config
    }

    pub fn hidden_dim(&self) -> usize {
        self.config.hidden_dim
    }

    pub fn kl_ema(&self) -> f64 {
        self.stats.kl_ema()
    }

    pub fn variance_ema(&self) -> f64 {
        self.stats.variance_ema()
    }

    pub fn reference_trainable(&self) -> bool {
        self.stats.reference_open()
    }

    pub fn correction_buffer(&self) -> Tensor<B, 1> {
        self.stats.correction_buffer()
    }

    /// Corrections kept by the last training pass, oldest first
    pub fn correction_history(&self) -> Vec<Tensor<B, 1>> {
        (0..self.stats.history_len())
            .filter_map(|i| self.stats.history_row(i))
            .collect()
    }

    /// One-line summary of the configuration and gate state.
    pub fn describe(&self) -> String {
        let cfg = &*self.config;
        format!(
            "hidden_dim={}, ref_dim={}, alpha={}, eps={}, kl_threshold={}, \
             trainable_reference={}, monitor_only={}, gradient_clip={:?}",
            cfg.hidden_dim, cfg.ref_dim, cfg.alpha, cfg.eps, cfg.kl_threshold,
            self.reference_trainable(), cfg.monitor_only, cfg.gradient_clip,
        )
    }

    fn zeros_hidden(&self) -> Tensor<B, 1> {
        Tensor::zeros([self.config.hidden_dim], &self.gamma.val().device())
    }
}

fn count_non_finite<B: Backend>(x: &Tensor<B, 3>) -> usize {
    let bad = x.clone().is_nan().int().sum() + x.clone().is_inf().int().sum();
    bad.into_scalar().elem::<i64>() as usize
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::DivergenceKind;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::TensorData;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    type B = NdArray;

    /// Uniform values in `offset ± spread`, reproducible per seed
    fn random_input<Bk: Backend>(shape: [usize; 3], offset: f32, spread: f32, seed: u64) -> Tensor<Bk, 3> {
        let mut rng = StdRng::seed_from_u64(seed);
        let n: usize = shape.iter().product();
        let values: Vec<f32> = (0..n).map(|_| offset + rng.gen_range(-spread..spread)).collect();
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    fn small_layer(cfg: BiasCorrectionConfig) -> BiasCorrectionLayer<B> {
        cfg.init::<B>(&Default::default()).unwrap()
    }

    fn biased_config() -> BiasCorrectionConfig {
        BiasCorrectionConfig::new(32)
            .with_ref_dim(16)
            .with_alpha(0.1)
            .with_kl_threshold(0.0)
    }

    fn to_vec<const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
        t.into_data().to_vec().unwrap()
    }

    #[test]
    fn test_output_shape_matches_input() {
        let layer = small_layer(BiasCorrectionConfig::new(768));
        let x = random_input::<B>([16, 24, 768], 0.0, 1.0, 7);
        let out = layer.forward(x).unwrap();
        assert_eq!(out.dims(), [16, 24, 768]);
        assert_eq!(count_non_finite(&out), 0);
    }

    #[test]
    fn test_mismatched_hidden_dim_is_shape_error() {
        let layer = small_layer(BiasCorrectionConfig::new(768));
        let x = Tensor::<B, 3>::zeros([16, 24, 512], &Default::default());
        let err = layer.forward(x).unwrap_err();
        assert_eq!(err, LayerError::Shape { expected: 768, actual: [16, 24, 512] });
    }

    #[test]
    fn test_eval_mode_is_idempotent() {
        let layer = small_layer(biased_config()).eval();
        let x = random_input::<B>([4, 8, 32], 4.0, 1.0, 1);

        let first  = to_vec(layer.forward(x.clone()).unwrap());
        let second = to_vec(layer.forward(x).unwrap());
        assert_eq!(first, second);
        // nothing moved
        assert_eq!(layer.kl_ema(), 0.0);
        assert_eq!(layer.variance_ema(), 1.0);
    }

    #[test]
    fn test_training_updates_statistics() {
        let layer = small_layer(BiasCorrectionConfig::new(32).with_ref_dim(8));
        let x = random_input::<B>([4, 8, 32], 0.0, 5.0, 2);
        layer.forward(x).unwrap();
        assert!(layer.kl_ema() > 0.0);
        assert!(layer.variance_ema() > 1.0);
    }

    #[test]
    fn test_variance_ema_converges_on_repeated_input() {
        let layer = small_layer(BiasCorrectionConfig::new(64).with_ref_dim(8).with_monitor_only(true));
        let x = random_input::<B>([4, 8, 64], 0.0, 5.0, 3);

        let mut previous = layer.variance_ema();
        let mut deltas = Vec::new();
        for _ in 0..60 {
            layer.forward(x.clone()).unwrap();
            let current = layer.variance_ema();
            deltas.push((current - previous).abs());
            previous = current;
        }
        for pair in deltas.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-6, "deltas grew: {:?}", pair);
        }
        assert!(deltas[59] < deltas[0] * 0.1);
    }

    #[test]
    fn test_variance_ema_converges_on_fixed_distribution() {
        let layer = small_layer(BiasCorrectionConfig::new(64).with_ref_dim(8).with_monitor_only(true));

        let mut previous = layer.variance_ema();
        let mut deltas = Vec::new();
        for seed in 0..200 {
            layer.forward(random_input::<B>([4, 8, 64], 0.0, 5.0, seed)).unwrap();
            let current = layer.variance_ema();
            deltas.push((current - previous).abs());
            previous = current;
        }
        let late: f64 = deltas[190..].iter().sum::<f64>() / 10.0;
        assert!(late < deltas[0] / 5.0, "first={} late={}", deltas[0], late);
    }

    #[test]
    fn test_biased_input_gets_corrected() {
        let layer = small_layer(biased_config());
        let x = random_input::<B>([4, 8, 32], 4.0, 1.0, 4);

        let out = layer.forward_with_report(x).unwrap();
        assert!(out.report.corrected());
        assert_eq!(out.corrections.len(), out.report.correction_count);
        assert_eq!(layer.correction_history().len(), out.report.correction_count);
        assert_eq!(count_non_finite(&out.output), 0);
    }

    #[test]
    fn test_monitor_only_never_corrects() {
        let layer = small_layer(biased_config().with_monitor_only(true));
        let x = random_input::<B>([4, 8, 32], 4.0, 1.0, 4);

        let out = layer.forward_with_report(x).unwrap();
        assert_eq!(out.report.correction_count, 0);
        assert_eq!(out.report.kl_values.len(), 3);
        assert!(layer.kl_ema() > 0.0);
    }

    #[test]
    fn test_max_corrections_stops_scale_loop() {
        let layer = small_layer(biased_config().with_max_corrections(1));
        let x = random_input::<B>([4, 8, 32], 4.0, 1.0, 4);

        let report = layer.forward_with_report(x).unwrap().report;
        assert_eq!(report.correction_count, 1);
        assert_eq!(report.kl_values.len(), 1);
    }

    #[test]
    fn test_rollback_without_history_is_zero() {
        let layer = small_layer(BiasCorrectionConfig::new(8).with_ref_dim(4));
        assert_eq!(to_vec(layer.rollback(None)), vec![0.0; 8]);
        assert_eq!(to_vec(layer.rollback(Some(0))), vec![0.0; 8]);
    }

    #[test]
    fn test_rollback_negates_kept_corrections() {
        let layer = small_layer(biased_config());
        layer.forward(random_input::<B>([4, 8, 32], 4.0, 1.0, 4)).unwrap();

        let history = layer.correction_history();
        assert!(!history.is_empty());

        let undo_all: Vec<f32> = to_vec(layer.rollback(None));
        let buffer: Vec<f32> = to_vec(layer.correction_buffer());
        assert_eq!(undo_all, buffer.iter().map(|v| -v).collect::<Vec<_>>());

        let undo_first: Vec<f32> = to_vec(layer.rollback(Some(0)));
        let first: Vec<f32> = to_vec(history[0].clone());
        assert_eq!(undo_first, first.iter().map(|v| -v).collect::<Vec<_>>());

        assert_eq!(to_vec(layer.rollback(Some(99))), vec![0.0; 32]);
    }

    #[test]
    fn test_corrections_are_quantised() {
        let layer = small_layer(biased_config().with_compression_factor(4));
        let out = layer.forward_with_report(random_input::<B>([4, 8, 32], 4.0, 1.0, 4)).unwrap();
        for correction in out.corrections {
            for v in to_vec(correction) {
                assert_eq!((v * 4.0).fract(), 0.0, "{v} is not a multiple of 0.25");
            }
        }
    }

    #[test]
    fn test_reject_policy_fails_on_nan() {
        let layer = small_layer(
            BiasCorrectionConfig::new(4).with_ref_dim(2).with_non_finite(NonFinitePolicy::Reject),
        );
        let x = Tensor::<B, 3>::from_floats([[[1.0, f32::NAN, 0.0, 2.0]]], &Default::default());
        assert_eq!(layer.forward(x).unwrap_err(), LayerError::NonFinite { count: 1 });
        assert_eq!(layer.variance_ema(), 1.0);
    }

    #[test]
    fn test_propagate_policy_leaves_statistics_alone() {
        let layer = small_layer(BiasCorrectionConfig::new(4).with_ref_dim(2));
        let x = Tensor::<B, 3>::from_floats([[[1.0, f32::INFINITY, 0.0, 2.0]]], &Default::default());
        let out = layer.forward(x).unwrap();
        assert!(count_non_finite(&out) > 0);
        assert_eq!(layer.kl_ema(), 0.0);
        assert_eq!(layer.variance_ema(), 1.0);
    }

    #[test]
    fn test_reference_gate_follows_kl_ema() {
        let layer = small_layer(biased_config().with_kl_threshold(0.01).with_monitor_only(true));
        assert!(!layer.reference_trainable());

        layer.forward(random_input::<B>([4, 8, 32], 4.0, 1.0, 5)).unwrap();
        assert!(layer.reference_trainable());

        layer.freeze_reference();
        assert!(!layer.reference_trainable());

        layer.reset_stats();
        assert_eq!(layer.kl_ema(), 0.0);
        assert_eq!(layer.variance_ema(), 1.0);
    }

    #[test]
    fn test_gradients_reach_affine_but_not_frozen_reference() {
        type AB = Autodiff<NdArray>;
        let layer = BiasCorrectionConfig::new(32)
            .with_ref_dim(16)
            .init::<AB>(&Default::default())
            .unwrap();
        let x = random_input::<AB>([2, 4, 32], 1.0, 1.0, 6);

        let loss = layer.forward(x).unwrap().sum();
        let grads = loss.backward();
        assert!(layer.gamma.val().grad(&grads).is_some());
        assert!(layer.ref_mu.val().grad(&grads).is_none());
    }

    #[test]
    fn test_gradient_clip_bounds_corrections() {
        let layer = small_layer(
            biased_config()
                .with_gradient_clip(Some(0.3))
                .with_compression_factor(100),
        );
        let out = layer.forward_with_report(random_input::<B>([4, 8, 32], 4.0, 1.0, 4)).unwrap();

        assert!(out.report.corrected());
        for correction in out.corrections {
            for v in to_vec(correction) {
                assert!(v.abs() <= 0.3 + 1e-6, "{v} escapes the clip");
            }
        }
    }

    #[test]
    fn test_trainable_reference_receives_gradients() {
        type AB = Autodiff<NdArray>;
        let layer = biased_config()
            .with_trainable_reference(true)
            .init::<AB>(&Default::default())
            .unwrap();
        assert!(layer.reference_trainable());

        let out = layer.forward_with_report(random_input::<AB>([4, 8, 32], 4.0, 1.0, 4)).unwrap();
        assert!(out.report.corrected());
        assert!(out.report.reference_trainable);

        let grads = out.output.sum().backward();
        assert!(layer.ref_mu.val().grad(&grads).is_some());
    }

    #[test]
    fn test_wide_batch_raises_threshold_for_later_calls() {
        // decay 0: variance_ema is the std observed on the previous call
        let layer = small_layer(biased_config().with_kl_threshold(0.1).with_ema_decay(0.0));
        let biased = random_input::<B>([4, 8, 32], 4.0, 1.0, 4);

        let before = layer.forward_with_report(biased.clone()).unwrap().report;
        assert!((before.threshold - 0.2).abs() < 1e-9);
        assert!(before.corrected());

        layer.forward(random_input::<B>([4, 8, 32], 0.0, 20_000.0, 9)).unwrap();
        assert!(layer.variance_ema() > 1_000.0);

        let after = layer.forward_with_report(biased).unwrap().report;
        assert!(after.threshold > 100.0, "threshold = {}", after.threshold);
        assert!(after.kl_values.iter().all(|&kl| kl <= after.threshold));
        assert_eq!(after.correction_count, 0);
        assert!(layer.correction_history().is_empty());
    }

    #[test]
    fn test_symmetric_divergence_forward() {
        let layer = small_layer(biased_config().with_divergence(DivergenceKind::SymmetricKl));
        let out = layer.forward(random_input::<B>([2, 4, 32], 4.0, 1.0, 8)).unwrap();
        assert_eq!(out.dims(), [2, 4, 32]);
        assert_eq!(count_non_finite(&out), 0);
    }

    #[test]
    fn test_sparsity_loss_with_unit_gates() {
        let layer = small_layer(BiasCorrectionConfig::new(8).with_ref_dim(4));
        let loss = layer.sparsity_loss().into_scalar().elem::<f64>();
        assert!((loss - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_describe_lists_configuration() {
        let layer = small_layer(BiasCorrectionConfig::new(8).with_ref_dim(4));
        let text = layer.describe();
        assert!(text.starts_with("hidden_dim=8, ref_dim=4"));
        assert!(text.contains("trainable_reference=false"));
    }
}
