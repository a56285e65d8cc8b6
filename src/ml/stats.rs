// ============================================================
// Layer 2 — Running Statistics
// ============================================================
// State that persists across forward calls and travels with
// the module record:
//
//   kl_ema            — EMA of the measured divergence
//   variance_ema      — EMA of the mean per-token std
//   reference_gate    — 1.0 while the reference receives gradients
//   correction_buffer — sum of the corrections kept last pass  [hidden]
//   history           — those corrections, one per row         [rows, hidden]
//   history_len       — how many history rows are in use
//
// Every value is a burn RunningState, the same container
// BatchNorm uses for its running mean and variance. Values
// written here are always detached from the autodiff graph.
//
// RunningState keeps one pending value per thread and averages
// them on sync. Forward calls on one layer must therefore come
// from a single writer at a time.

use burn::{module::RunningState, prelude::*};

/// Exponential moving average: `decay * previous + (1 - decay) * observed`
pub fn ema<B: Backend, const D: usize>(
    previous: Tensor<B, D>,
    observed: Tensor<B, D>,
    decay:    f64,
) -> Tensor<B, D> {
    previous.mul_scalar(decay) + observed.detach().mul_scalar(1.0 - decay)
}

#[derive(Module, Debug)]
pub struct ReflectionStats<B: Backend> {
    kl_ema:            RunningState<Tensor<B, 1>>,
    variance_ema:      RunningState<Tensor<B, 1>>,
    reference_gate:    RunningState<Tensor<B, 1>>,
    correction_buffer: RunningState<Tensor<B, 1>>,
    history:           RunningState<Tensor<B, 2>>,
    history_len:       RunningState<Tensor<B, 1>>,
}

impl<B: Backend> ReflectionStats<B> {
    pub fn new(
        hidden_dim:      usize,
        history_rows:    usize,
        reference_open:  bool,
        device:          &B::Device,
    ) -> Self {
        Self {
            kl_ema:            RunningState::new(Tensor::zeros([1], device)),
            variance_ema:      RunningState::new(Tensor::ones([1], device)),
            reference_gate:    RunningState::new(gate_value(reference_open, device)),
            correction_buffer: RunningState::new(Tensor::zeros([hidden_dim], device)),
            history:           RunningState::new(Tensor::zeros([history_rows, hidden_dim], device)),
            history_len:       RunningState::new(Tensor::zeros([1], device)),
        }
    }

    pub fn kl_ema(&self) -> f64 {
        scalar(self.kl_ema.value_sync())
    }

    pub fn variance_ema(&self) -> f64 {
        scalar(self.variance_ema.value_sync())
    }

    pub fn reference_open(&self) -> bool {
        scalar(self.reference_gate.value_sync()) > 0.5
    }

    pub fn history_len(&self) -> usize {
        scalar(self.history_len.value_sync()).round() as usize
    }

    pub fn correction_buffer(&self) -> Tensor<B, 1> {
        self.correction_buffer.value_sync()
    }

    /// Row `index` of the correction history, `None` past the rows in use
    pub fn history_row(&self, index: usize) -> Option<Tensor<B, 1>> {
        if index >= self.history_len() {
            return None;
        }
        let history = self.history.value_sync();
        let [_, hidden] = history.dims();
        Some(history.slice([index..index + 1, 0..hidden]).reshape([hidden]))
    }

    pub fn record_divergence(&self, kl: Tensor<B, 1>, decay: f64) {
        let next = ema(self.kl_ema.value_sync(), kl, decay);
        self.kl_ema.update(next);
    }

    pub fn record_variance(&self, observed: Tensor<B, 1>, decay: f64) {
        let next = ema(self.variance_ema.value_sync(), observed, decay);
        self.variance_ema.update(next);
    }

    pub fn set_reference_gate(&self, open: bool) {
        let device = self.reference_gate.value_sync().device();
        self.reference_gate.update(gate_value(open, &device));
    }

    /// Replace the buffer and history with the corrections of the latest pass.
    /// An empty slice clears both.
    pub fn record_corrections(&self, corrections: &[Tensor<B, 1>]) {
        let history = self.history.value_sync();
        let [rows, hidden] = history.dims();
        let device = history.device();
        let kept = corrections.len().min(rows);

        let (buffer, history) = if kept == 0 {
            (Tensor::zeros([hidden], &device), Tensor::zeros([rows, hidden], &device))
        } else {
            let stacked = Tensor::stack::<2>(
                corrections[..kept].iter().map(|c| c.clone().detach()).collect(),
                0,
            );
            let buffer = stacked.clone().sum_dim(0).reshape([hidden]);
            let history = if kept < rows {
                Tensor::cat(vec![stacked, Tensor::zeros([rows - kept, hidden], &device)], 0)
            } else {
                stacked
            };
            (buffer, history)
        };

        self.correction_buffer.update(buffer);
        self.history.update(history);
        self.history_len.update(Tensor::from_floats([kept as f32], &device));
    }

    /// Back to the freshly constructed values. The reference gate is left alone.
    pub fn reset(&self) {
        let history = self.history.value_sync();
        let [rows, hidden] = history.dims();
        let device = history.device();
        self.kl_ema.update(Tensor::zeros([1], &device));
        self.variance_ema.update(Tensor::ones([1], &device));
        self.correction_buffer.update(Tensor::zeros([hidden], &device));
        self.history.update(Tensor::zeros([rows, hidden], &device));
        self.history_len.update(Tensor::zeros([1], &device));
    }
}

fn gate_value<B: Backend>(open: bool, device: &B::Device) -> Tensor<B, 1> {
    Tensor::from_floats([if open { 1.0f32 } else { 0.0 }], device)
}

fn scalar<B: Backend>(t: Tensor<B, 1>) -> f64 {
    t.into_scalar().elem::<f64>()
}
