//! Per-channel controller — the state machine that owns one channel's
//! encoder lifecycle, playlist, and segment watcher for as long as at least
//! one viewer is tuned in.
//!
//! Grounded on the supervise-loop shape of `quadrant-vms-core`'s
//! `stream-manager.rs` (exponential backoff restart of an external process)
//! and `dog4ik-media-server`'s `hls_stream-job.rs` `tokio::select!` event
//! loop, generalized into a full state machine because (unlike the
//! teacher's 1:1 `CameraWorker`) one channel here owns batch planning across
//! playlist-item boundaries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::encoder::{Encoder, EncoderArgs};
use crate::error::{ChannelCastError, Result};
use crate::playlist::PlaylistManager;
use crate::timeline::{self, PlaylistItem};
use crate::watcher::{Watcher, WatcherConfig};

const TRIGGER_TICK: Duration = Duration::from_millis(1000);
const CLIENT_TTL: Duration = Duration::from_secs(30);
const RETRY_BACKOFF_START: Duration = Duration::from_millis(500);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(10);
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Static per-channel settings resolved once at controller construction.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub channel_id: String,
    pub segment_root: PathBuf,
    pub segment_duration_secs: f64,
    pub window_size: usize,
    pub batch_size: u64,
    pub trigger_threshold: u64,
    pub grace_period: Duration,
    pub safety_buffer: usize,
    pub poll_interval: Duration,
    pub prune_interval: Duration,
    pub segment_filename_pattern: String,
    pub hardware_accel: crate::encoder::HardwareAccel,
    pub encoding_preset: crate::encoder::EncodingPreset,
    pub fps: Option<u32>,
}

/// Coarse controller lifecycle state, exactly spec's `Cold -> Starting ->
/// Running -> Draining -> {Running | Stopping} -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Cold,
    Starting,
    Running(RunningSubState),
    Draining,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningSubState {
    Encoding,
    BatchSwap,
    PreGen,
}

/// One contiguous run of segments produced by a single encoder invocation.
#[derive(Debug, Clone)]
pub struct Batch {
    pub start_segment: u64,
    pub end_segment: u64,
    pub is_complete: bool,
}

struct ClientPosition {
    furthest_segment_number: u64,
    last_seen: Instant,
    quality: Option<String>,
}

struct PlannedRun {
    item_index: usize,
    offset_in_item: f64,
    segment_count: u64,
    discontinuity: bool,
}

/// Plan encoder runs covering `want_segments` starting at a timeline
/// position. Crosses playlist-item boundaries per spec, truncating if the
/// playlist is exhausted and `loop_flag` is false.
fn plan_batch(
    mut item_index: usize,
    mut offset_in_item: f64,
    mut want_segments: u64,
    segment_duration: f64,
    loop_flag: bool,
    items: &[PlaylistItem],
) -> Vec<PlannedRun> {
    let mut runs = Vec::new();
    let mut first = true;

    while want_segments > 0 {
        let Some(item) = items.get(item_index) else {
            break;
        };
        let can_yield = ((item.duration_secs - offset_in_item) / segment_duration).floor().max(0.0) as u64;

        if can_yield >= want_segments {
            runs.push(PlannedRun {
                item_index,
                offset_in_item,
                segment_count: want_segments,
                discontinuity: !first,
            });
            want_segments = 0;
        } else if can_yield > 0 {
            runs.push(PlannedRun {
                item_index,
                offset_in_item,
                segment_count: can_yield,
                discontinuity: !first,
            });
            want_segments -= can_yield;
            match timeline::advance_item(item_index, loop_flag, items) {
                Some(next) => {
                    item_index = next;
                    offset_in_item = 0.0;
                }
                None => break,
            }
        } else {
            match timeline::advance_item(item_index, loop_flag, items) {
                Some(next) => {
                    item_index = next;
                    offset_in_item = 0.0;
                }
                None => break,
            }
        }
        first = false;
    }

    runs
}

/// Owns one channel's encoder, playlist, and segment watcher while at least
/// one viewer is tuned in.
pub struct Controller {
    config: ControllerConfig,
    items: Vec<PlaylistItem>,
    channel_start: DateTime<Utc>,
    loop_flag: bool,
    encoder: Arc<dyn Encoder>,
    playlist: Arc<PlaylistManager>,
    watcher: Arc<Watcher>,
    state: Mutex<State>,
    clients: Mutex<HashMap<String, ClientPosition>>,
    current_batch: Mutex<Option<Batch>>,
    next_segment_number: AtomicU64,
    consecutive_failures: AtomicU64,
    cancel: CancellationToken,
    grace_generation: AtomicU64,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        items: Vec<PlaylistItem>,
        channel_start: DateTime<Utc>,
        loop_flag: bool,
        encoder: Arc<dyn Encoder>,
    ) -> Result<Arc<Self>> {
        if items.is_empty() {
            return Err(ChannelCastError::EmptyPlaylist {
                channel: config.channel_id.clone(),
            });
        }

        let segment_dir = config.segment_root.join(&config.channel_id);
        if segment_dir.exists() {
            std::fs::remove_dir_all(&segment_dir).map_err(ChannelCastError::Io)?;
        }
        std::fs::create_dir_all(&segment_dir).map_err(ChannelCastError::Io)?;

        let playlist_path = segment_dir.join("playlist.m3u8");
        let playlist = Arc::new(PlaylistManager::new(
            playlist_path,
            config.window_size,
            config.segment_duration_secs,
        )?);

        let watcher = Arc::new(Watcher::new(
            WatcherConfig {
                segment_dir: segment_dir.clone(),
                window_size: config.window_size,
                safety_buffer: config.safety_buffer,
                prune_interval: config.prune_interval,
                segment_duration: Duration::from_secs_f64(config.segment_duration_secs),
                poll_interval: config.poll_interval,
            },
            playlist.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            items,
            channel_start,
            loop_flag,
            encoder,
            playlist,
            watcher,
            state: Mutex::new(State::Cold),
            clients: Mutex::new(HashMap::new()),
            current_batch: Mutex::new(None),
            next_segment_number: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            grace_generation: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn master_playlist_path(&self) -> PathBuf {
        self.config.segment_root.join(&self.config.channel_id).join("master.m3u8")
    }

    pub fn media_playlist_path(&self) -> PathBuf {
        self.config.segment_root.join(&self.config.channel_id).join("playlist.m3u8")
    }

    pub fn segment_dir(&self) -> PathBuf {
        self.config.segment_root.join(&self.config.channel_id)
    }

    pub fn state(&self) -> State {
        *self.state.lock()
    }

    /// Cold-start: resolve the timeline and start the watcher synchronously,
    /// then hand batch #1 and the look-ahead trigger loop to a background
    /// task so `Ensure` can return the master playlist promptly — segments
    /// appear on disk asynchronously as the encoder produces them. Idempotent
    /// — a controller already past `Cold` is untouched.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != State::Cold {
                return Ok(());
            }
            *state = State::Starting;
        }

        self.watcher.start();

        let pos = timeline::resolve_position(self.channel_start, Utc::now(), self.loop_flag, &self.items)
            .map_err(|e| ChannelCastError::PlaylistIo(e.to_string()))?;

        self.next_segment_number.store(0, Ordering::SeqCst);
        *self.state.lock() = State::Running(RunningSubState::Encoding);

        let this = self.clone();
        let batch_size = self.config.batch_size;
        let run_task = tokio::spawn(async move {
            match this.run_batch(pos.item_index, pos.offset_in_item, batch_size).await {
                Ok(()) => Self::trigger_loop(this).await,
                Err(e) => {
                    error!(channel = this.config.channel_id, error = %e, "Initial batch run failed");
                }
            }
        });
        self.tasks.lock().push(run_task);
        Ok(())
    }

    /// Run a single batch end-to-end (one or more encoder invocations for
    /// runs crossing item boundaries), with crash-retry per spec §4.4/§7.
    async fn run_batch(self: &Arc<Self>, item_index: usize, offset_in_item: f64, want: u64) -> Result<()> {
        let runs = plan_batch(
            item_index,
            offset_in_item,
            want,
            self.config.segment_duration_secs,
            self.loop_flag,
            &self.items,
        );

        let start_segment = self.next_segment_number.load(Ordering::SeqCst);
        let mut produced = 0u64;

        for run in runs {
            if run.discontinuity {
                self.watcher.mark_discontinuity();
            }

            let attempt_result = self.run_single_encoder_with_retry(&run, start_segment + produced).await;
            match attempt_result {
                Ok(n) => produced += n,
                Err(e) => {
                    let mut batch = self.current_batch.lock();
                    *batch = Some(Batch {
                        start_segment,
                        end_segment: start_segment + produced,
                        is_complete: false,
                    });
                    return Err(e);
                }
            }
        }

        self.next_segment_number.store(start_segment + produced, Ordering::SeqCst);
        *self.current_batch.lock() = Some(Batch {
            start_segment,
            end_segment: start_segment + produced,
            is_complete: true,
        });
        Ok(())
    }

    async fn run_single_encoder_with_retry(self: &Arc<Self>, run: &PlannedRun, start_number: u64) -> Result<u64> {
        let mut attempt = 0u32;
        loop {
            let item = &self.items[run.item_index];
            let args = EncoderArgs {
                channel_id: self.config.channel_id.clone(),
                inputs: vec![item.media_path.clone()],
                output_dir: self.segment_dir(),
                segment_filename_pattern: self.config.segment_filename_pattern.clone(),
                segment_duration_secs: self.config.segment_duration_secs,
                hardware_accel: self.config.hardware_accel,
                preset: self.config.encoding_preset,
                fps: self.config.fps,
                start_number,
                start_offset_secs: run.offset_in_item,
                segment_count: run.segment_count,
            };

            let spawn_result = self.encoder.spawn(args).await;
            let mut handle = match spawn_result {
                Ok(h) => h,
                Err(e) => {
                    attempt += 1;
                    if attempt > MAX_CONSECUTIVE_FAILURES {
                        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                        return Err(e);
                    }
                    self.backoff_sleep(attempt).await;
                    continue;
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    handle.kill().await;
                    return Err(ChannelCastError::Encoder("controller stopped mid-batch".into()));
                }
                result = handle.wait() => {
                    match result {
                        Ok(()) => {
                            self.consecutive_failures.store(0, Ordering::SeqCst);
                            return Ok(run.segment_count);
                        }
                        Err(e) => {
                            warn!(channel = self.config.channel_id, error = %e, attempt, "Encoder exited abnormally");
                            attempt += 1;
                            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                            if failures as u32 >= MAX_CONSECUTIVE_FAILURES {
                                *self.state.lock() = State::Stopping;
                                return Err(ChannelCastError::ChannelUnavailable(self.config.channel_id.clone()));
                            }
                            self.watcher.mark_discontinuity();
                            self.backoff_sleep(attempt).await;
                        }
                    }
                }
            }
        }
    }

    async fn backoff_sleep(&self, attempt: u32) {
        let backoff = RETRY_BACKOFF_START
            .checked_mul(1u32 << attempt.min(8))
            .unwrap_or(RETRY_BACKOFF_MAX)
            .min(RETRY_BACKOFF_MAX);
        tokio::time::sleep(backoff).await;
    }

    /// Look-ahead trigger loop: fires every ~1s, starts the next batch when
    /// the furthest client is within `trigger_threshold` of the batch end,
    /// and swaps once the current batch completes and clients have moved
    /// past it.
    async fn trigger_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(TRIGGER_TICK);
        let mut next_batch_inflight = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            self.sweep_stale_clients();

            let furthest = self.furthest_client_position();
            let batch_snapshot = self.current_batch.lock().clone();

            let Some(batch) = batch_snapshot else { continue };
            let remaining = batch.end_segment.saturating_sub(furthest);

            if batch.is_complete && !next_batch_inflight && remaining <= self.config.trigger_threshold {
                next_batch_inflight = true;
                *self.state.lock() = State::Running(RunningSubState::PreGen);
                let want = self.config.batch_size;
                let pos = match self.position_after(batch.end_segment) {
                    Some(p) => p,
                    None => {
                        debug!(channel = self.config.channel_id, "Playlist exhausted, no further batches");
                        next_batch_inflight = false;
                        continue;
                    }
                };
                if let Err(e) = self.run_batch(pos.0, pos.1, want).await {
                    error!(channel = self.config.channel_id, error = %e, "Batch run failed");
                }
                next_batch_inflight = false;
                *self.state.lock() = State::Running(RunningSubState::Encoding);
            }
        }
    }

    /// Resolve the timeline position that continues immediately after
    /// `end_segment` segments have been produced from the channel's start.
    fn position_after(&self, end_segment: u64) -> Option<(usize, f64)> {
        let elapsed = end_segment as f64 * self.config.segment_duration_secs;
        let target_instant = self.channel_start + chrono::Duration::milliseconds((elapsed * 1000.0) as i64);
        let pos = timeline::resolve_position(self.channel_start, target_instant, self.loop_flag, &self.items).ok()?;
        if pos.past_end {
            return None;
        }
        Some((pos.item_index, pos.offset_in_item))
    }

    fn furthest_client_position(&self) -> u64 {
        self.clients.lock().values().map(|c| c.furthest_segment_number).max().unwrap_or(0)
    }

    fn sweep_stale_clients(&self) {
        let mut clients = self.clients.lock();
        let now = Instant::now();
        clients.retain(|_, pos| now.duration_since(pos.last_seen) < CLIENT_TTL);
    }

    /// Register a viewer, cancelling any pending grace-period teardown.
    pub fn register_client(&self, session_id: &str) {
        self.grace_generation.fetch_add(1, Ordering::SeqCst);
        let mut clients = self.clients.lock();
        clients.entry(session_id.to_string()).or_insert_with(|| ClientPosition {
            furthest_segment_number: 0,
            last_seen: Instant::now(),
            quality: None,
        });
        let mut state = self.state.lock();
        if *state == State::Draining {
            *state = State::Running(RunningSubState::Encoding);
        }
    }

    pub fn report_position(&self, session_id: &str, segment_number: u64, quality: Option<String>) {
        let mut clients = self.clients.lock();
        if let Some(pos) = clients.get_mut(session_id) {
            pos.furthest_segment_number = pos.furthest_segment_number.max(segment_number);
            pos.last_seen = Instant::now();
            if quality.is_some() {
                pos.quality = quality;
            }
        }
    }

    /// Unregister a viewer; if none remain, arm the grace-period timer.
    pub fn unregister_client(self: &Arc<Self>, session_id: &str) {
        let became_empty = {
            let mut clients = self.clients.lock();
            clients.remove(session_id);
            clients.is_empty()
        };
        if !became_empty {
            return;
        }

        let generation = self.grace_generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.lock() = State::Draining;

        let this = self.clone();
        let grace = self.config.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if this.grace_generation.load(Ordering::SeqCst) != generation {
                return; // superseded by a new client or another unregister
            }
            if !this.clients.lock().is_empty() {
                return;
            }
            info!(channel = this.config.channel_id, "Grace period expired, tearing down");
            this.stop().await;
        });
    }

    pub fn health_snapshot(&self) -> crate::playlist::PlaylistHealth {
        self.playlist.health_check(Duration::from_secs_f64(self.config.segment_duration_secs * 3.0))
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Idempotent graceful teardown: cancel tasks, stop the watcher, close
    /// the playlist, and delete the segment directory.
    pub async fn stop(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = State::Stopping;
        self.cancel.cancel();

        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for h in handles {
            let _ = h.await;
        }

        self.watcher.stop().await;
        if let Err(e) = self.playlist.close() {
            warn!(channel = self.config.channel_id, error = %e, "Failed to close playlist on teardown");
        }

        let dir = self.segment_dir();
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            debug!(channel = self.config.channel_id, path = %dir.display(), error = %e, "Failed to remove segment dir");
        }

        *self.state.lock() = State::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(durations: &[f64]) -> Vec<PlaylistItem> {
        durations
            .iter()
            .enumerate()
            .map(|(i, d)| PlaylistItem::new(format!("item-{i}.mp4"), *d))
            .collect()
    }

    #[test]
    fn single_item_batch_stays_within_item() {
        let its = items(&[100.0, 100.0]);
        let runs = plan_batch(0, 0.0, 4, 2.0, true, &its);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].item_index, 0);
        assert_eq!(runs[0].segment_count, 4);
        assert!(!runs[0].discontinuity);
    }

    #[test]
    fn batch_splits_across_item_boundary() {
        // item 0 has only 5s left -> 2 segments of 2s before the boundary.
        let its = items(&[5.0, 100.0]);
        let runs = plan_batch(0, 0.0, 4, 2.0, true, &its);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].item_index, 0);
        assert_eq!(runs[0].segment_count, 2);
        assert!(!runs[0].discontinuity);
        assert_eq!(runs[1].item_index, 1);
        assert_eq!(runs[1].segment_count, 2);
        assert!(runs[1].discontinuity);
    }

    #[test]
    fn batch_truncates_when_not_looping_and_exhausted() {
        let its = items(&[4.0]);
        let runs = plan_batch(0, 0.0, 10, 2.0, false, &its);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].segment_count, 2);
    }
}
