//! Configuration Module
//!
//! TOML configuration for the demo service and test rigs.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// HAL demo configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Hardware generation: "gen8", "gen9", "gen10"
    #[serde(default = "default_generation")]
    pub generation: String,

    /// Override the heap ring depth (0 = generation default)
    #[serde(default)]
    pub num_instances: u32,

    /// Bounded-wait iteration budget when the ring is saturated
    #[serde(default = "default_wait_iterations")]
    pub wait_iterations: u32,

    /// Per-iteration batch-buffer-complete event timeout, milliseconds
    #[serde(default = "default_event_timeout_ms")]
    pub event_timeout_ms: u64,

    /// Track completion through the KMD GPU status tag instead of the
    /// software sync word
    #[serde(default = "default_kmd_frame_tracking")]
    pub kmd_frame_tracking: bool,

    /// Null-hardware mode: commands are built but no engine work runs
    #[serde(default)]
    pub null_hw: bool,

    /// Frames the demo processes before exiting (0 = until ctrl-c)
    #[serde(default = "default_frames")]
    pub frames: u64,

    /// Simulated engine latency per frame, microseconds
    #[serde(default = "default_engine_latency_us")]
    pub engine_latency_us: u64,
}

fn default_generation() -> String {
    "gen9".to_string()
}

fn default_wait_iterations() -> u32 {
    crate::heap::DEFAULT_WAIT_ITERATIONS
}

fn default_event_timeout_ms() -> u64 {
    crate::heap::DEFAULT_EVENT_TIMEOUT_MS
}

fn default_kmd_frame_tracking() -> bool {
    true
}

fn default_frames() -> u64 {
    64
}

fn default_engine_latency_us() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            generation: default_generation(),
            num_instances: 0,
            wait_iterations: default_wait_iterations(),
            event_timeout_ms: default_event_timeout_ms(),
            kmd_frame_tracking: default_kmd_frame_tracking(),
            null_hw: false,
            frames: default_frames(),
            engine_latency_us: default_engine_latency_us(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: Config = toml::from_str("generation = \"gen10\"").unwrap();
        assert_eq!(config.generation, "gen10");
        assert_eq!(config.wait_iterations, 60);
        assert_eq!(config.event_timeout_ms, 5);
        assert!(config.kmd_frame_tracking);
    }
}
