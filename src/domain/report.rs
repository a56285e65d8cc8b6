// ============================================================
// Layer 1 — Forward Report
// ============================================================
// Host-side scalars describing what one forward pass observed
// and decided. The tensor parts (output, kept corrections,
// reference snapshot) live in `ml::layer::ReflectionOutput`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReflectionReport {
    /// Divergence measured at each visited scale, in scale order.
    /// Shorter than the configured scales when the correction cap stopped the loop.
    pub kl_values: Vec<f64>,

    /// Gate applied to this pass: `kl_threshold * (1 + variance_ema)`
    pub threshold: f64,

    /// Number of corrections kept during this pass
    pub correction_count: usize,

    /// Running divergence average after this pass
    pub kl_ema: f64,

    /// Running per-token std average after this pass
    pub variance_ema: f64,

    /// Whether the reference distribution currently receives gradients
    pub reference_trainable: bool,
}

impl ReflectionReport {
    /// Largest divergence seen across scales, `None` when no scale was visited
    pub fn max_kl(&self) -> Option<f64> {
        self.kl_values.iter().copied().reduce(f64::max)
    }

    pub fn corrected(&self) -> bool {
        self.correction_count > 0
    }
}
