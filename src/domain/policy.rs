// ============================================================
// Layer 1 — Strategy Selectors
// ============================================================
// The divergence estimator and the treatment of NaN/Inf input
// are chosen through the layer config. Both enums serialise
// with the config so a checkpoint rebuilds the same layer.

use serde::{Deserialize, Serialize};

/// How the divergence between the batch and the reference
/// distribution is measured in the projected space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DivergenceKind {
    /// KL(reference ‖ batch) under a per-channel Gaussian model.
    #[default]
    GaussianKl,

    /// Mean of both KL directions (Jeffreys divergence / 2).
    SymmetricKl,
}

/// What the forward pass does with NaN or infinite input values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NonFinitePolicy {
    /// Let the values flow through to the output.
    /// Running statistics are not updated from such a batch.
    #[default]
    Propagate,

    /// Fail with `LayerError::NonFinite` before any state changes.
    Reject,
}
