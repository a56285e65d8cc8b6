// ============================================================
// Layer 3 — Report Logger
// ============================================================
// Records one CSV row per forward report so divergence drift
// and correction activity can be plotted after a run.
//
// Columns:
//   step             — caller supplied step counter
//   kl_values        — divergence per visited scale, ';'-separated
//   threshold        — gate used in that pass
//   kl_ema           — running divergence after the pass
//   variance_ema     — running per-token std after the pass
//   corrections      — corrections kept in the pass
//   reference_open   — 1 if the reference was receiving gradients
//
// Example CSV output:
//   step,kl_values,threshold,kl_ema,variance_ema,corrections,reference_open
//   1,0.412000;0.388100;0.129300,0.200000,0.046470,1.045000,1,0

use anyhow::{Context, Result};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::PathBuf,
};

use crate::domain::report::ReflectionReport;

const HEADER: &str = "step,kl_values,threshold,kl_ema,variance_ema,corrections,reference_open";

/// Appends forward reports to `<dir>/reflection.csv`.
pub struct ReportLogger {
    csv_path: PathBuf,
}

impl ReportLogger {
    /// Create the logger. Writes the CSV header if the file doesn't exist yet,
    /// so repeated runs append to one log.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create log directory '{}'", dir.display()))?;

        let csv_path = dir.join("reflection.csv");
        if !csv_path.exists() {
            let mut f = fs::File::create(&csv_path)
                .with_context(|| format!("Cannot create '{}'", csv_path.display()))?;
            writeln!(f, "{HEADER}")?;
            tracing::debug!("Created report CSV: '{}'", csv_path.display());
        }

        Ok(Self { csv_path })
    }

    /// Append one report as a new row.
    pub fn log(&self, step: usize, report: &ReflectionReport) -> Result<()> {
        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.csv_path)
            .with_context(|| format!("Cannot open '{}'", self.csv_path.display()))?;

        let kl_values = report
            .kl_values
            .iter()
            .map(|kl| format!("{kl:.6}"))
            .collect::<Vec<_>>()
            .join(";");

        writeln!(
            f,
            "{},{},{:.6},{:.6},{:.6},{},{}",
            step,
            kl_values,
            report.threshold,
            report.kl_ema,
            report.variance_ema,
            report.correction_count,
            u8::from(report.reference_trainable),
        )?;
        Ok(())
    }

    pub fn csv_path(&self) -> &PathBuf {
        &self.csv_path
    }
}
