// ============================================================
// Layer 3 — Checkpoint Manager
// ============================================================
// Saves and restores a BiasCorrectionLayer.
//
// What gets saved per checkpoint name:
//   1. {name}.mpk         — parameters and running statistics
//   2. {name}.config.json — the BiasCorrectionConfig
//
// The recorder runs at full precision so running statistics
// load back bit-exact.
//
// File layout:
//   checkpoints/
//     bias_layer.mpk
//     bias_layer.config.json
//     latest.json            ← name of the most recent save

use anyhow::{Context, Result};
use std::{fs, path::PathBuf};
use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
};

use crate::ml::config::BiasCorrectionConfig;
use crate::ml::layer::BiasCorrectionLayer;

type LayerRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Manages saving and loading of layer checkpoints in one directory.
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Create the manager, creating the directory (like `mkdir -p`) if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create checkpoint directory '{}'", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Save the layer record and its config under `name`.
    pub fn save_layer<B: Backend>(&self, layer: &BiasCorrectionLayer<B>, name: &str) -> Result<()> {
        // recorder appends the .mpk extension
        let path = self.dir.join(name);
        LayerRecorder::new()
            .record(layer.clone().into_record(), path.clone())
            .with_context(|| format!("Failed to save checkpoint to '{}'", path.display()))?;

        self.save_config(layer.config(), name)?;

        let latest_path = self.dir.join("latest.json");
        fs::write(&latest_path, serde_json::to_string(name)?)
            .with_context(|| "Failed to write latest.json")?;

        tracing::debug!("Saved layer checkpoint '{}'", name);
        Ok(())
    }

    /// Rebuild the layer from its config and load the saved record into it.
    /// The loaded layer is in training mode.
    pub fn load_layer<B: Backend>(&self, name: &str, device: &B::Device) -> Result<BiasCorrectionLayer<B>> {
        let config = self.load_config(name)?;
        let layer = config
            .init::<B>(device)
            .with_context(|| format!("Stored config for '{name}' is invalid"))?;

        let path = self.dir.join(name);
        let record = LayerRecorder::new()
            .load(path.clone(), device)
            .with_context(|| {
                format!("Cannot load checkpoint '{}'. Has it been saved?", path.display())
            })?;

        tracing::info!("Loaded layer checkpoint '{}'", name);
        Ok(layer.load_record(record))
    }

    /// Load whichever checkpoint was saved last.
    pub fn load_latest<B: Backend>(&self, device: &B::Device) -> Result<BiasCorrectionLayer<B>> {
        let name = self.latest_name()?;
        self.load_layer(&name, device)
    }

    pub fn save_config(&self, cfg: &BiasCorrectionConfig, name: &str) -> Result<()> {
        let path = self.config_path(name);
        let json = serde_json::to_string_pretty(cfg)?;
        fs::write(&path, json)
            .with_context(|| format!("Cannot write config to '{}'", path.display()))?;
        Ok(())
    }

    pub fn load_config(&self, name: &str) -> Result<BiasCorrectionConfig> {
        let path = self.config_path(name);
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read config from '{}'", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Malformed config in '{}'", path.display()))
    }

    fn latest_name(&self) -> Result<String> {
        let path = self.dir.join("latest.json");
        let s = fs::read_to_string(&path)
            .with_context(|| "Cannot find 'latest.json'. Has a checkpoint been saved?")?;
        Ok(serde_json::from_str::<String>(&s)?)
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.config.json"))
    }
}
