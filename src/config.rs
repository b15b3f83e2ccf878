use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Recognized configuration parameters (§6). CLI flags override a loaded
/// file, which overrides these defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_samples: usize,
    pub bitrate: i32,
    pub jitter: JitterConfig,
    pub kdf_iterations: u32,
    pub key_length: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sample_rate: 16_000,
            channels: 1,
            frame_samples: 320,
            bitrate: 16_000,
            jitter: JitterConfig::default(),
            kdf_iterations: 100_000,
            key_length: 32,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Byte length of one PCM frame for this configuration.
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples * self.channels as usize * 2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    pub max_size: usize,
    pub min_size: usize,
    pub max_delay_secs: f64,
    pub target_delay_secs: f64,
    pub adaptation_rate: f64,
    pub adaptive: bool,
}

impl Default for JitterConfig {
    fn default() -> Self {
        JitterConfig {
            max_size: 50,
            min_size: 10,
            max_delay_secs: 0.5,
            target_delay_secs: 0.1,
            adaptation_rate: 0.1,
            adaptive: true,
        }
    }
}

impl JitterConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.max_delay_secs)
    }

    pub fn target_delay(&self) -> Duration {
        Duration::from_secs_f64(self.target_delay_secs)
    }
}
