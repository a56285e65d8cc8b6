// ============================================================
// Layer 1 — Domain Layer
// ============================================================
// Plain Rust types that describe the bias correction layer
// without touching any tensor code:
//
//   error.rs  — the error kinds raised by construction and forward
//   policy.rs — strategy selectors stored in the layer config
//   report.rs — host-side diagnostics produced by one forward pass
//
// Rules for this layer:
//   - NO Burn framework types allowed here
//   - NO file I/O
//   - Only plain Rust structs, enums, and traits

/// Construction and forward-pass errors
pub mod error;

/// Divergence estimator and non-finite input selectors
pub mod policy;

/// Scalar diagnostics of a single forward pass
pub mod report;
