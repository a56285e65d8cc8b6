//! Adaptive bias reflective layer for [burn] models.
//!
//! [`BiasCorrectionLayer`] sits in the forward pass of a host model. It
//! projects hidden states `[batch, seq, hidden]` into a small reference
//! space at several scales, measures the divergence from a reference
//! distribution, nudges the input back towards it while training, and
//! finishes with a learnable per-token normalisation. Running statistics
//! (divergence and variance averages, correction history) are burn
//! `RunningState` buffers and are saved with the module record.
//!
//! ```no_run
//! use bias_reflect::BiasCorrectionConfig;
//! use burn::backend::NdArray;
//! use burn::tensor::{Distribution, Tensor};
//!
//! let device = Default::default();
//! let layer = BiasCorrectionConfig::new(768)
//!     .with_ref_dim(32)
//!     .with_kl_threshold(0.15)
//!     .init::<NdArray>(&device)?;
//!
//! let x = Tensor::<NdArray, 3>::random([16, 24, 768], Distribution::Default, &device);
//! let out = layer.forward_with_report(x)?;
//! println!("{:?}", out.report.kl_values);
//! # Ok::<(), bias_reflect::LayerError>(())
//! ```
//!
//! A layer must not run forward from several threads at once: the running
//! statistics assume a single writer.

pub mod domain;
pub mod infra;
pub mod ml;

pub use domain::error::{LayerError, LayerResult};
pub use domain::policy::{DivergenceKind, NonFinitePolicy};
pub use domain::report::ReflectionReport;
pub use infra::checkpoint::CheckpointManager;
pub use infra::metrics::ReportLogger;
pub use ml::config::BiasCorrectionConfig;
pub use ml::divergence::{ChannelMoments, DivergenceEstimator};
pub use ml::layer::{BiasCorrectionLayer, ReflectionOutput};
