// ============================================================
// Layer 2 — Divergence Estimators
// ============================================================
// Measures how far the projected batch has drifted from the
// reference distribution. Both sides are summarised as
// per-channel Gaussians (mean, std) in the reference space;
// the estimator turns the two summaries into one scalar.

use burn::prelude::*;

use crate::domain::policy::DivergenceKind;

/// Per-channel mean and standard deviation, both `[ref_dim]`.
#[derive(Debug, Clone)]
pub struct ChannelMoments<B: Backend> {
    pub mean: Tensor<B, 1>,
    pub std:  Tensor<B, 1>,
}

impl<B: Backend> ChannelMoments<B> {
    /// Summarise projected rows `[tokens, ref_dim]` over the token axis.
    /// The population std is floored at `eps`.
    pub fn from_rows(rows: Tensor<B, 2>, eps: f64) -> Self {
        let [_, channels] = rows.dims();
        let mean = rows.clone().mean_dim(0).reshape([channels]);
        // clamp before sqrt keeps the gradient finite for constant channels
        let std = rows.var_bias(0).clamp_min(eps * eps).sqrt().reshape([channels]);
        Self { mean, std }
    }

    /// Wrap the reference parameters; the std is floored at `eps`.
    pub fn reference(mean: Tensor<B, 1>, std: Tensor<B, 1>, eps: f64) -> Self {
        Self { mean, std: std.clamp_min(eps) }
    }
}

/// A scalar divergence between the current batch and the reference.
pub trait DivergenceEstimator {
    /// Returns a single-element tensor so gradients can flow through it.
    fn divergence<B: Backend>(
        &self,
        batch:     &ChannelMoments<B>,
        reference: &ChannelMoments<B>,
        eps:       f64,
    ) -> Tensor<B, 1>;
}

/// KL(p ‖ q) for diagonal Gaussians, averaged over channels:
///   ln(σq/σp + ε) + (σp² + (μp − μq)²) / (2σq²) − ½
fn gaussian_kl<B: Backend>(
    p:   &ChannelMoments<B>,
    q:   &ChannelMoments<B>,
    eps: f64,
) -> Tensor<B, 1> {
    let log_ratio = (q.std.clone() / p.std.clone()).add_scalar(eps).log();
    let mean_gap  = (p.mean.clone() - q.mean.clone()).powf_scalar(2.0);
    let spread    = (p.std.clone().powf_scalar(2.0) + mean_gap)
        / q.std.clone().powf_scalar(2.0).mul_scalar(2.0);
    (log_ratio + spread).sub_scalar(0.5).mean()
}

impl DivergenceEstimator for DivergenceKind {
    fn divergence<B: Backend>(
        &self,
        batch:     &ChannelMoments<B>,
        reference: &ChannelMoments<B>,
        eps:       f64,
    ) -> Tensor<B, 1> {
        match self {
            DivergenceKind::GaussianKl => gaussian_kl(reference, batch, eps),
            DivergenceKind::SymmetricKl => {
                (gaussian_kl(reference, batch, eps) + gaussian_kl(batch, reference, eps))
                    .mul_scalar(0.5)
            }
        }
    }
}
