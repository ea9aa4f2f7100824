//! Configuration management for Planar
//!
//! This module handles loading, parsing, and validating configuration from
//! TOML files. The interesting part is display topology: which physical
//! displays are split into logical zones, which group into a mosaic, and
//! which mirror another display.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use log::warn;

/// Main configuration struct containing all Planar settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PlanarConfig {
    /// Kernel device selection
    #[serde(default)]
    pub device: DeviceConfig,

    /// Present-path policy knobs
    #[serde(default)]
    pub present: PresentConfig,

    /// Display topology (ordering, logical splits, mosaic, clone)
    #[serde(default)]
    pub topology: TopologyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Device node to open for the hardware backend
    pub card_path: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            card_path: "/dev/dri/card0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresentConfig {
    /// Request kernel out-fences on steady-state commits
    pub explicit_sync: bool,

    /// Force-flush window for partial logical frames (ms); 0 waits forever
    pub barrier_flush_ms: u64,
}

impl Default for PresentConfig {
    fn default() -> Self {
        Self {
            explicit_sync: true,
            barrier_flush_ms: 1000,
        }
    }
}

/// One logical split: divide a physical display into N zones
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogicalSplit {
    /// Index of the physical display (after ordering)
    pub physical: u32,

    /// Number of side-by-side zones (>= 2)
    pub divisions: u32,
}

/// A group of displays presented as one combined panel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MosaicGroup {
    /// Member display indices, left to right
    pub displays: Vec<u32>,
}

/// A mirror set: the first display is the source, the rest clone it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloneGroup {
    pub displays: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TopologyConfig {
    /// Presentation order of physical displays; omitted displays append
    /// in enumeration order
    #[serde(default)]
    pub physical_order: Vec<u32>,

    #[serde(default)]
    pub logical: Vec<LogicalSplit>,

    #[serde(default)]
    pub mosaic: Vec<MosaicGroup>,

    #[serde(default, rename = "clone")]
    pub clones: Vec<CloneGroup>,
}

impl PlanarConfig {
    /// Loads configuration from a TOML file, falling back to defaults on
    /// any failure (a composer with a bad config still has to light up).
    pub fn load_or_default(path: &str) -> PlanarConfig {
        match Self::load(path) {
            Ok(config) => config,
            Err(err) => {
                warn!("using default configuration: {}", err);
                PlanarConfig::default()
            }
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<PlanarConfig> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: PlanarConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("failed to write config file: {}", path.as_ref().display()))
    }

    /// Rejects topologies the device assembly cannot honor.
    pub fn validate(&self) -> Result<()> {
        for split in &self.topology.logical {
            if split.divisions < 2 {
                anyhow::bail!(
                    "logical split of display {} needs at least 2 divisions",
                    split.physical
                );
            }
        }

        let mut seen_mosaic = std::collections::HashSet::new();
        for group in &self.topology.mosaic {
            if group.displays.is_empty() {
                anyhow::bail!("empty mosaic group");
            }
            for &display in &group.displays {
                if !seen_mosaic.insert(display) {
                    anyhow::bail!("display {} appears in more than one mosaic group", display);
                }
            }
        }

        let mut seen_clone = std::collections::HashSet::new();
        for group in &self.topology.clones {
            if group.displays.len() < 2 {
                anyhow::bail!("clone group needs a source and at least one mirror");
            }
            for &display in &group.displays {
                if !seen_clone.insert(display) {
                    anyhow::bail!("display {} appears in more than one clone group", display);
                }
            }
        }

        let mut seen_order = std::collections::HashSet::new();
        for &display in &self.topology.physical_order {
            if !seen_order.insert(display) {
                anyhow::bail!("display {} listed twice in physical_order", display);
            }
        }
        Ok(())
    }

    /// Zone count for a physical display index, 1 when unsplit.
    pub fn divisions_for(&self, physical: u32) -> u32 {
        self.topology
            .logical
            .iter()
            .find(|split| split.physical == physical)
            .map(|split| split.divisions)
            .unwrap_or(1)
    }

    pub fn barrier_flush(&self) -> Option<std::time::Duration> {
        match self.present.barrier_flush_ms {
            0 => None,
            ms => Some(std::time::Duration::from_millis(ms)),
        }
    }
}
