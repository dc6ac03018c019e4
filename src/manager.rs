// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Stream manager: the top-level registry of per-channel controllers.
//!
//! Generalizes the teacher's `RecordingManager` (one worker per camera,
//! spawned eagerly at startup) into a lazily-started registry keyed by
//! channel ID — channels here come to life on first viewer and tear
//! themselves down after the last one leaves, rather than running
//! continuously for the process lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::info;

use crate::config::Config;
use crate::controller::{Controller, ControllerConfig, State};
use crate::encoder::Encoder;
use crate::error::{ChannelCastError, Result};
use crate::repository::ChannelRepository;

/// Registry of active per-channel controllers, created lazily on demand.
pub struct StreamManager {
    registry: Mutex<HashMap<String, Arc<Controller>>>,
    repository: Arc<dyn ChannelRepository>,
    encoder: Arc<dyn Encoder>,
    config: Config,
}

impl StreamManager {
    pub fn new(config: Config, repository: Arc<dyn ChannelRepository>, encoder: Arc<dyn Encoder>) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            repository,
            encoder,
            config,
        }
    }

    /// Idempotently create the controller for `channel_id` if absent,
    /// register `session_id` as a viewer, and return the master playlist
    /// path. Concurrent callers for the same channel see the same
    /// controller; only one performs the cold start.
    pub async fn ensure(&self, channel_id: &str, session_id: &str) -> Result<std::path::PathBuf> {
        let existing = self.registry.lock().get(channel_id).cloned();
        let controller = match existing {
            Some(c) => c,
            None => self.cold_start(channel_id).await?,
        };

        controller.register_client(session_id);
        controller.start().await?;
        Ok(controller.master_playlist_path())
    }

    async fn cold_start(&self, channel_id: &str) -> Result<Arc<Controller>> {
        let (channel, items) = self.repository.load_channel(channel_id).await?;

        let streaming = &self.config.streaming;
        let controller_config = ControllerConfig {
            channel_id: channel.id.clone(),
            segment_root: streaming.segment_path.clone(),
            segment_duration_secs: streaming.segment_duration_seconds as f64,
            window_size: streaming.window_size,
            batch_size: streaming.batch_size,
            trigger_threshold: streaming.trigger_threshold,
            grace_period: streaming.grace_period(),
            safety_buffer: streaming.safety_buffer,
            poll_interval: streaming.poll_interval(),
            prune_interval: streaming.prune_interval(),
            segment_filename_pattern: streaming.segment_filename_pattern.clone(),
            hardware_accel: streaming.hardware_accel,
            encoding_preset: streaming.encoding_preset,
            fps: Some(streaming.fps),
        };

        let controller = Controller::new(controller_config, items, channel.start, channel.loop_playback, self.encoder.clone())?;

        let mut registry = self.registry.lock();
        // Another caller may have won the race while we awaited the repository.
        if let Some(winner) = registry.get(channel_id) {
            return Ok(winner.clone());
        }
        registry.insert(channel_id.to_string(), controller.clone());
        info!(channel = channel_id, "Controller created");
        Ok(controller)
    }

    pub fn register_client(&self, channel_id: &str, session_id: &str) {
        if let Some(c) = self.registry.lock().get(channel_id) {
            c.register_client(session_id);
        }
    }

    /// No-op for an unknown channel, per spec's `NotFound` policy.
    pub fn unregister_client(&self, channel_id: &str, session_id: &str) {
        if let Some(c) = self.registry.lock().get(channel_id) {
            c.unregister_client(session_id);
        }
    }

    pub fn report_position(&self, channel_id: &str, session_id: &str, segment_number: u64, quality: Option<String>) {
        if let Some(c) = self.registry.lock().get(channel_id) {
            c.report_position(session_id, segment_number, quality);
        }
    }

    pub fn controller(&self, channel_id: &str) -> Option<Arc<Controller>> {
        self.registry.lock().get(channel_id).cloned()
    }

    pub fn debug_snapshot(&self, channel_id: &str) -> Result<serde_json::Value> {
        let controller = self
            .registry
            .lock()
            .get(channel_id)
            .cloned()
            .ok_or_else(|| ChannelCastError::ChannelNotFound(channel_id.to_string()))?;

        let health = controller.health_snapshot();
        Ok(serde_json::json!({
            "channel_id": channel_id,
            "state": format!("{:?}", controller.state()),
            "client_count": controller.client_count(),
            "playlist_healthy": health.healthy,
            "since_last_write_secs": health.since_last_write.map(|d| d.as_secs_f64()),
        }))
    }

    /// Stop every active controller in parallel and wait for teardown.
    pub async fn stop(&self) {
        let controllers: Vec<Arc<Controller>> = self.registry.lock().values().cloned().collect();
        let mut set = tokio::task::JoinSet::new();
        for controller in controllers {
            set.spawn(async move {
                controller.stop().await;
            });
        }
        while set.join_next().await.is_some() {}
        self.registry.lock().clear();
        info!("Stream manager stopped");
    }
}

/// Helper for `status`/`channels` CLI subcommands: true once a controller
/// has left the `Cold` state.
pub fn is_active(controller: &Controller) -> bool {
    !matches!(controller.state(), State::Cold | State::Stopped)
}
