// ============================================================
// Layer 3 — Infrastructure Layer
// ============================================================
// File-backed helpers around the layer:
//
//   checkpoint.rs — Saving and loading a layer. The record
//                   (parameters and running statistics) goes
//                   through burn's named MessagePack recorder,
//                   the config is written as JSON so the layer
//                   can be rebuilt before the record is loaded.
//
//   metrics.rs    — Appends forward-pass reports to a CSV
//                   file for later analysis and plotting.
//
// Reference: Burn Book §5 (Records and Checkpointing)

/// Layer checkpoint saving and loading
pub mod checkpoint;

/// Forward report CSV logger
pub mod metrics;
