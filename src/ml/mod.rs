// ============================================================
// Layer 2 — ML / Module Layer (Burn)
// ============================================================
// All Burn framework code lives in this layer. The domain
// layer stays free of tensor types; infra only sees the
// layer through its record and config.
//
//   config.rs     — BiasCorrectionConfig: hyperparameters,
//                   validation and `init`
//
//   divergence.rs — per-channel moments and the pluggable
//                   divergence estimators (Gaussian KL,
//                   symmetric KL)
//
//   stats.rs      — running statistics kept in burn
//                   RunningState buffers (EMA of divergence
//                   and variance, reference gate, history)
//
//   layer.rs      — BiasCorrectionLayer itself: multi-scale
//                   projection, gated correction, normalisation
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn BatchNorm (running statistics)

/// Layer hyperparameters and construction
pub mod config;

/// Divergence between projected batch and reference distribution
pub mod divergence;

/// Running statistics persisted with the module record
pub mod stats;

/// The bias correction module
pub mod layer;
