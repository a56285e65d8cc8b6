// ============================================================
// Layer 1 — Layer Errors
// ============================================================
// Every failure is raised synchronously at the point of
// violation. There is no retry: the caller must fix the config
// or the input tensor and call again.

use thiserror::Error;

/// Errors raised by [`BiasCorrectionConfig::init`] and the forward pass.
///
/// [`BiasCorrectionConfig::init`]: crate::ml::config::BiasCorrectionConfig::init
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LayerError {
    /// Invalid construction argument (dimension, epsilon, decay, ...).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Input is not `[batch, seq, hidden_dim]` with non-empty batch and sequence.
    #[error("shape error: expected [batch, seq, {expected}], got {actual:?}")]
    Shape { expected: usize, actual: [usize; 3] },

    /// Input holds NaN or infinite values and the policy is `Reject`.
    #[error("numerical error: input contains {count} non-finite values")]
    NonFinite { count: usize },
}

impl LayerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

pub type LayerResult<T> = Result<T, LayerError>;
