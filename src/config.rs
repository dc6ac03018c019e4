//! Configuration loading — a TOML file describing the streaming engine's
//! tunables plus a static list of channels and their playlists.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::encoder::{EncodingPreset, HardwareAccel};
use crate::error::{ChannelCastError, Result};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub streaming: StreamingConfig,
    /// API bind address/port and CORS behaviour.
    #[serde(default)]
    pub api: ApiConfig,
    /// Statically declared channels, backing the default `StaticRepository`.
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// Every tunable named in the streaming engine's configuration surface.
#[derive(Debug, Deserialize, Clone)]
pub struct StreamingConfig {
    /// Root directory under which `<segment_root>/<channel_id>/` trees live.
    pub segment_path: PathBuf,
    #[serde(default = "default_segment_duration_seconds")]
    pub segment_duration_seconds: u64,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_trigger_threshold")]
    pub trigger_threshold: u64,
    #[serde(default = "default_grace_period_seconds")]
    pub grace_period_seconds: u64,
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    #[serde(default = "default_safety_buffer")]
    pub safety_buffer: usize,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_prune_interval_seconds")]
    pub prune_interval_seconds: u64,
    #[serde(default = "default_segment_filename_pattern")]
    pub segment_filename_pattern: String,
    #[serde(default)]
    pub hardware_accel: HardwareAccel,
    #[serde(default)]
    pub encoding_preset: EncodingPreset,
    #[serde(default = "default_fps")]
    pub fps: u32,
}

fn default_segment_duration_seconds() -> u64 {
    6
}
fn default_window_size() -> usize {
    6
}
fn default_batch_size() -> u64 {
    20
}
fn default_trigger_threshold() -> u64 {
    5
}
fn default_grace_period_seconds() -> u64 {
    60
}
fn default_cleanup_interval_seconds() -> u64 {
    30
}
fn default_safety_buffer() -> usize {
    4
}
fn default_poll_interval_seconds() -> u64 {
    2
}
fn default_prune_interval_seconds() -> u64 {
    10
}
fn default_segment_filename_pattern() -> String {
    "seg-%05d.ts".to_string()
}
fn default_fps() -> u32 {
    30
}

impl StreamingConfig {
    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_seconds)
    }
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_seconds)
    }
}

/// HTTP API configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            port: default_api_port(),
        }
    }
}

fn default_api_enabled() -> bool {
    true
}
fn default_api_port() -> u16 {
    8080
}

/// One statically configured channel and its ordered playlist of media
/// files, the only backing store `StaticRepository` ships.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChannelConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub loop_playback: bool,
    /// Ordered list of media file paths making up the channel's playlist.
    pub items: Vec<PathBuf>,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ChannelCastError::Config(format!("Cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| ChannelCastError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.streaming.segment_path.as_os_str().is_empty() {
            return Err(ChannelCastError::Config("segment_path must not be empty".into()));
        }
        if self.streaming.segment_duration_seconds == 0 {
            return Err(ChannelCastError::Config("segment_duration_seconds must be > 0".into()));
        }
        if self.streaming.batch_size == 0 {
            return Err(ChannelCastError::Config("batch_size must be > 0".into()));
        }
        if self.streaming.trigger_threshold == 0 || self.streaming.trigger_threshold >= self.streaming.batch_size {
            return Err(ChannelCastError::Config(
                "trigger_threshold must satisfy 0 < trigger_threshold < batch_size".into(),
            ));
        }
        if self.streaming.fps == 0 {
            return Err(ChannelCastError::Config("fps must be > 0".into()));
        }
        for channel in &self.channels {
            if channel.items.is_empty() {
                return Err(ChannelCastError::Config(format!(
                    "channel '{}' has no playlist items",
                    channel.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_trigger_threshold() {
        let toml_str = r#"
            [streaming]
            segment_path = "/tmp/channelcast"
            batch_size = 10
            trigger_threshold = 10

            [[channels]]
            id = "demo"
            name = "Demo"
            items = ["a.mp4"]
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_minimal_valid_config() {
        let toml_str = r#"
            [streaming]
            segment_path = "/tmp/channelcast"

            [[channels]]
            id = "demo"
            name = "Demo"
            items = ["a.mp4", "b.mp4"]
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.streaming.segment_duration_seconds, 6);
        assert_eq!(cfg.streaming.segment_filename_pattern, "seg-%05d.ts");
    }
}
