//! Engine and speech configuration.
//!
//! [`EngineConfig`] is process-level tuning for one engine instance and is loaded with the
//! `config` crate (defaults < TOML file < `RAILVOX_*` environment). [`SpeechSettings`] travels
//! with every `speak()` call.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::VoxResult;

/// Engine-wide tuning.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | RAILVOX_DATA_PATH | data/vox | Directory holding the chime and impulse-response files. |
/// | RAILVOX_TICK_INTERVAL_MS | 100 | Driver loop period. |
/// | RAILVOX_MAX_PENDING | 10 | Requests allowed in flight at once. |
/// | RAILVOX_MAX_SCHEDULED | 5 | Units allowed on the output graph at once. |
/// | RAILVOX_LATENCY_MARGIN_MS | 150 | Fixed safety margin subtracted from each clip's advance. |
/// | RAILVOX_FALLBACK_BASE_LATENCY_MS | 10 | Used when the device cannot report its base latency. |
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Relative path the chime and impulse responses are fetched from.
    pub data_path: String,
    pub tick_interval_ms: u64,
    pub max_pending: usize,
    pub max_scheduled: usize,
    pub latency_margin_ms: u64,
    pub fallback_base_latency_ms: u64,
    /// High-pass cutoff of the tannoy filter (Hz).
    pub filter_cutoff_hz: f64,
    /// Rate the output graph renders at. Device backends resample as needed.
    pub sample_rate: u32,
    pub channels: u16,
    /// Fade applied to units silenced by `stop()`, so cancellation does not click.
    pub stop_fade_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_path: "data/vox".to_string(),
            tick_interval_ms: 100,
            max_pending: 10,
            max_scheduled: 5,
            latency_margin_ms: 150,
            fallback_base_latency_ms: 10,
            filter_cutoff_hz: 350.0,
            sample_rate: 44_100,
            channels: 2,
            stop_fade_ms: 5,
        }
    }
}

impl EngineConfig {
    /// Load config from file and environment. Precedence: env > `RAILVOX_CONFIG` path
    /// (or `config/railvox.toml`) > defaults.
    pub fn load() -> VoxResult<Self> {
        let config_path =
            std::env::var("RAILVOX_CONFIG").unwrap_or_else(|_| "config/railvox.toml".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load config from a specific file (skipped when missing), then overlay the environment.
    pub fn load_from(path: &Path) -> VoxResult<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("RAILVOX")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VoxResult<()> {
        use crate::error::VoxError;

        if self.max_pending == 0 {
            return Err(VoxError::Config("max_pending must be at least 1".to_string()));
        }
        if self.max_scheduled == 0 {
            return Err(VoxError::Config("max_scheduled must be at least 1".to_string()));
        }
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(VoxError::Config(format!(
                "invalid output format: {} Hz, {} channels",
                self.sample_rate, self.channels
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(VoxError::Config("tick_interval_ms must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// `deviceBaseLatency (or fallback) + margin`, in seconds.
    pub fn latency_compensation(&self, base_latency: Option<f64>) -> f64 {
        let base = base_latency.unwrap_or(self.fallback_base_latency_ms as f64 / 1000.0);
        base + self.latency_margin_ms as f64 / 1000.0
    }
}

/// Voice settings supplied with each utterance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SpeechSettings {
    /// Base directory clips are looked up in, as `{vox_path}/{id}.mp3`.
    pub vox_path: String,
    /// Lead-in clip, relative to the engine's data path. Played at a fixed rate of 1.
    #[serde(default)]
    pub vox_chime: Option<String>,
    /// Impulse-response file key; empty or absent means no reverb.
    #[serde(default)]
    pub vox_reverb: Option<String>,
    /// 0..=1 attenuates; 1..=1.9 amplifies (remapped to 2..=10).
    #[serde(default)]
    pub volume: Option<f32>,
    /// 0.1..=1.9, remapped onto a gentler playback-rate range.
    #[serde(default)]
    pub rate: Option<f32>,
}

impl SpeechSettings {
    pub fn new(vox_path: impl Into<String>) -> Self {
        Self {
            vox_path: vox_path.into(),
            ..Default::default()
        }
    }

    pub fn with_chime(mut self, chime: impl Into<String>) -> Self {
        self.vox_chime = Some(chime.into());
        self
    }

    pub fn with_reverb(mut self, reverb: impl Into<String>) -> Self {
        self.vox_reverb = Some(reverb.into());
        self
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn with_rate(mut self, rate: f32) -> Self {
        self.rate = Some(rate);
        self
    }

    /// Chime file, if one is set and non-empty.
    pub fn chime(&self) -> Option<&str> {
        self.vox_chime.as_deref().filter(|c| !c.trim().is_empty())
    }

    /// Reverb file key, if one is set and non-empty.
    pub fn reverb(&self) -> Option<&str> {
        self.vox_reverb.as_deref().filter(|r| !r.trim().is_empty())
    }
}
