// ============================================================
// Layer 2 — Layer Configuration
// ============================================================
// All hyperparameters of a BiasCorrectionLayer. Only
// `hidden_dim` is required; everything else has the defaults
// of the reference layer.
//
// #[derive(Config)] generates `new(hidden_dim)`, a `with_*`
// builder per defaulted field and serde support, so the
// checkpoint manager can store the config next to the weights.

use burn::prelude::*;

use crate::domain::error::{LayerError, LayerResult};
use crate::domain::policy::{DivergenceKind, NonFinitePolicy};
use crate::ml::layer::BiasCorrectionLayer;

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize.
#[derive(Config, Debug)]
pub struct BiasCorrectionConfig {
    /// Width of the incoming hidden states
    pub hidden_dim: usize,

    /// Width of the reference space the input is projected into
    #[config(default = 64)]
    pub ref_dim: usize,

    /// Correction learning rate
    #[config(default = 0.01)]
    pub alpha: f64,

    #[config(default = 1e-6)]
    pub eps: f64,

    /// Base divergence above which a correction is attempted
    #[config(default = 0.1)]
    pub kl_threshold: f64,

    #[config(default = 0.95)]
    pub ema_decay: f64,

    /// One projection per entry, applied to `x * scale`
    #[config(default = "vec![1.0, 0.5, 0.1]")]
    pub scales: Vec<f64>,

    /// Upper bound on corrections kept in a single forward pass
    #[config(default = 3)]
    pub max_corrections: usize,

    /// Corrections are stored rounded to multiples of `1 / compression_factor`.
    /// Entries below `1 / (2 * compression_factor)` in magnitude are stored as zero,
    /// so `rollback` can return zeros after a pass that did correct.
    #[config(default = 4)]
    pub compression_factor: usize,

    /// Whether the reference distribution starts out receiving gradients
    #[config(default = false)]
    pub trainable_reference: bool,

    /// Measure divergences and update statistics, never correct
    #[config(default = false)]
    pub monitor_only: bool,

    /// Symmetric clamp on each correction while training
    #[config(default = "None")]
    pub gradient_clip: Option<f64>,

    #[config(default = "DivergenceKind::GaussianKl")]
    pub divergence: DivergenceKind,

    #[config(default = "NonFinitePolicy::Propagate")]
    pub non_finite: NonFinitePolicy,
}

impl BiasCorrectionConfig {
    /// Check every field that would make the layer meaningless.
    /// An `alpha` outside (0, 1) is allowed but logged.
    pub fn validate(&self) -> LayerResult<()> {
        if self.hidden_dim == 0 || self.ref_dim == 0 {
            return Err(LayerError::config(format!(
                "dimensions must be positive integers (hidden_dim={}, ref_dim={})",
                self.hidden_dim, self.ref_dim
            )));
        }
        if !(self.eps > 0.0 && self.eps.is_finite()) {
            return Err(LayerError::config(format!("eps must be positive, got {}", self.eps)));
        }
        if !(0.0..=1.0).contains(&self.ema_decay) {
            return Err(LayerError::config(format!(
                "ema_decay must lie in [0, 1], got {}",
                self.ema_decay
            )));
        }
        if !(self.kl_threshold >= 0.0 && self.kl_threshold.is_finite()) {
            return Err(LayerError::config(format!(
                "kl_threshold must be a finite non-negative number, got {}",
                self.kl_threshold
            )));
        }
        if self.scales.is_empty() {
            return Err(LayerError::config("at least one projection scale is required"));
        }
        if let Some(bad) = self.scales.iter().find(|s| !s.is_finite()) {
            return Err(LayerError::config(format!("scale {bad} is not finite")));
        }
        if self.compression_factor == 0 {
            return Err(LayerError::config("compression_factor must be positive"));
        }
        if let Some(clip) = self.gradient_clip {
            if !(clip > 0.0) {
                return Err(LayerError::config(format!(
                    "gradient_clip must be positive, got {clip}"
                )));
            }
        }
        if !self.alpha.is_finite() {
            return Err(LayerError::config(format!("alpha must be finite, got {}", self.alpha)));
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            tracing::warn!("alpha {} is outside the recommended range (0, 1)", self.alpha);
        }
        Ok(())
    }

    /// Validate and build the layer on `device`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> LayerResult<BiasCorrectionLayer<B>> {
        self.validate()?;
        let layer = BiasCorrectionLayer::from_config(self.clone(), device);
        tracing::info!(
            "Bias correction layer ready: hidden_dim={}, ref_dim={}, scales={:?}",
            self.hidden_dim, self.ref_dim, self.scales
        );
        Ok(layer)
    }

    /// Number of rows kept in the correction history buffer
    pub(crate) fn history_rows(&self) -> usize {
        self.max_corrections.clamp(1, self.scales.len())
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = BiasCorrectionConfig::new(768);
        assert_eq!(cfg.ref_dim, 64);
        assert_eq!(cfg.scales, vec![1.0, 0.5, 0.1]);
        assert_eq!(cfg.max_corrections, 3);
        assert_eq!(cfg.gradient_clip, None);
        assert_eq!(cfg.divergence, DivergenceKind::GaussianKl);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_zero_hidden_dim_is_rejected() {
        let err = BiasCorrectionConfig::new(0).validate().unwrap_err();
        assert!(matches!(err, LayerError::Configuration(_)));
    }

    #[test]
    fn test_zero_ref_dim_is_rejected() {
        let cfg = BiasCorrectionConfig::new(16).with_ref_dim(0);
        assert!(matches!(cfg.validate(), Err(LayerError::Configuration(_))));
    }

    #[test]
    fn test_non_positive_eps_is_rejected() {
        let cfg = BiasCorrectionConfig::new(16).with_eps(0.0);
        assert!(matches!(cfg.validate(), Err(LayerError::Configuration(_))));
    }

    #[test]
    fn test_decay_out_of_range_is_rejected() {
        let cfg = BiasCorrectionConfig::new(16).with_ema_decay(1.5);
        assert!(matches!(cfg.validate(), Err(LayerError::Configuration(_))));
    }

    #[test]
    fn test_empty_scales_are_rejected() {
        let cfg = BiasCorrectionConfig::new(16).with_scales(Vec::new());
        assert!(matches!(cfg.validate(), Err(LayerError::Configuration(_))));
    }

    #[test]
    fn test_alpha_outside_unit_interval_only_warns() {
        let cfg = BiasCorrectionConfig::new(16).with_alpha(2.0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_zero_hidden_dim_fails_init() {
        type B = burn::backend::NdArray;
        let device = Default::default();
        let result = BiasCorrectionConfig::new(0).init::<B>(&device);
        assert!(matches!(result, Err(LayerError::Configuration(_))));
    }

    #[test]
    fn test_config_json_round_trip() {
        let cfg = BiasCorrectionConfig::new(32)
            .with_gradient_clip(Some(0.5))
            .with_non_finite(NonFinitePolicy::Reject);
        let json = serde_json::to_string(&cfg).unwrap();
        let back: BiasCorrectionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hidden_dim, 32);
        assert_eq!(back.gradient_clip, Some(0.5));
        assert_eq!(back.non_finite, NonFinitePolicy::Reject);
    }
}
