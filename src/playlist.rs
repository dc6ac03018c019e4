//! HLS media playlist generation — sliding-window `.m3u8` writer with manual
//! media-sequence tracking, discontinuity markers, and atomic writes.
//!
//! One [`PlaylistManager`] is owned by exactly one channel [`Controller`]
//! (see `controller.rs`) for as long as that controller is alive. Unlike the
//! teacher's `hls::generate_live_playlist` — a pure function over an
//! already-scanned [`SegmentIndex`] snapshot — this is a stateful,
//! single-writer machine: segments are appended one at a time as the Segment
//! Watcher observes them, and the sliding window is pruned incrementally
//! rather than recomputed from a full directory listing on every read.

use std::fmt::Write as FmtWrite;
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{ChannelCastError, Result};

/// Never compare durations for equality; anything within this epsilon is
/// considered the same duration.
pub const DURATION_EPSILON_SECS: f64 = 0.001;

/// A single HLS media segment, as seen by the Playlist Manager.
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    pub uri: String,
    pub duration_secs: f64,
    pub program_date_time: Option<DateTime<Utc>>,
    pub discontinuity: bool,
}

impl SegmentMeta {
    pub fn new(uri: impl Into<String>, duration_secs: f64) -> Self {
        Self {
            uri: uri.into(),
            duration_secs,
            program_date_time: None,
            discontinuity: false,
        }
    }

    pub fn with_program_date_time(mut self, pdt: DateTime<Utc>) -> Self {
        self.program_date_time = Some(pdt);
        self
    }
}

/// Health snapshot returned by [`PlaylistManager::health_check`].
#[derive(Debug, Clone)]
pub struct PlaylistHealth {
    pub healthy: bool,
    pub since_last_write: Option<Duration>,
}

struct MediaPlaylistState {
    segments: std::collections::VecDeque<SegmentMeta>,
    window_size: usize,
    media_sequence: u64,
    total_segments_added: u64,
    max_duration_seen: f64,
    pending_discontinuity: bool,
    last_successful_write: Option<Instant>,
    closed: bool,
}

/// Single-writer, many-reader sliding-window HLS media playlist.
///
/// All mutators take the write lock; all getters take the read lock.
/// [`PlaylistManager::write`] releases the lock before doing file I/O and
/// reacquires only to stamp `last_successful_write`, so readers never block
/// behind an fsync.
pub struct PlaylistManager {
    output_path: PathBuf,
    target_duration_secs: f64,
    state: RwLock<MediaPlaylistState>,
}

impl PlaylistManager {
    pub fn new(output_path: impl Into<PathBuf>, window_size: usize, initial_target_duration: f64) -> Result<Self> {
        let output_path = output_path.into();
        if output_path.as_os_str().is_empty() {
            return Err(ChannelCastError::InvalidSegment("empty output_path".into()));
        }
        if initial_target_duration <= 0.0 {
            return Err(ChannelCastError::InvalidSegment(
                "initial_target_duration must be > 0".into(),
            ));
        }
        Ok(Self {
            output_path,
            target_duration_secs: initial_target_duration,
            state: RwLock::new(MediaPlaylistState {
                segments: std::collections::VecDeque::new(),
                window_size,
                media_sequence: 0,
                total_segments_added: 0,
                max_duration_seen: 0.0,
                pending_discontinuity: false,
                last_successful_write: None,
                closed: false,
            }),
        })
    }

    /// Append a segment. Returns URIs pruned from the front of the window
    /// (oldest first) so the caller can unlink the corresponding files.
    pub fn add_segment(&self, mut seg: SegmentMeta) -> Result<Vec<String>> {
        if seg.uri.is_empty() {
            return Err(ChannelCastError::InvalidSegment("empty uri".into()));
        }
        if seg.duration_secs <= 0.0 {
            return Err(ChannelCastError::InvalidSegment(format!(
                "non-positive duration for segment '{}'",
                seg.uri
            )));
        }

        let mut state = self.state.write();
        state.max_duration_seen = state.max_duration_seen.max(seg.duration_secs);
        state.total_segments_added += 1;

        if state.pending_discontinuity {
            seg.discontinuity = true;
            state.pending_discontinuity = false;
        }

        let mut pruned = Vec::new();
        if state.window_size > 0 && state.segments.len() >= state.window_size {
            let to_prune = state.segments.len() - state.window_size + 1;
            for _ in 0..to_prune {
                if let Some(old) = state.segments.pop_front() {
                    pruned.push(old.uri);
                }
            }
            state.media_sequence += to_prune as u64;
        }

        state.segments.push_back(seg);
        Ok(pruned)
    }

    /// Force the next appended segment to carry `#EXT-X-DISCONTINUITY`.
    pub fn set_discontinuity_next(&self) {
        self.state.write().pending_discontinuity = true;
    }

    /// Render and atomically persist the current playlist state.
    pub fn write(&self) -> Result<()> {
        let body = {
            let state = self.state.read();
            if state.closed {
                return Err(ChannelCastError::PlaylistIo(format!(
                    "{}: playlist manager is closed",
                    self.output_path.display()
                )));
            }
            render(&state, self.target_duration_secs)
        };

        atomic_write(&self.output_path, &body).map_err(|e| {
            ChannelCastError::PlaylistIo(format!("{}: {e}", self.output_path.display()))
        })?;

        self.state.write().last_successful_write = Some(Instant::now());
        Ok(())
    }

    /// Final write plus shutdown bookkeeping. Idempotent: calling `close`
    /// again is a no-op rather than an error, so a controller that races a
    /// shutdown with a final flush never sees a spurious failure.
    pub fn close(&self) -> Result<()> {
        if self.state.read().closed {
            return Ok(());
        }
        self.write()?;
        self.state.write().closed = true;
        debug!(path = %self.output_path.display(), "Playlist manager closed");
        Ok(())
    }

    pub fn current_segments(&self) -> Vec<String> {
        self.state.read().segments.iter().map(|s| s.uri.clone()).collect()
    }

    pub fn media_sequence(&self) -> u64 {
        self.state.read().media_sequence
    }

    pub fn segment_count(&self) -> usize {
        self.state.read().segments.len()
    }

    pub fn max_duration(&self) -> f64 {
        self.state.read().max_duration_seen
    }

    pub fn window_size(&self) -> usize {
        self.state.read().window_size
    }

    pub fn last_successful_write(&self) -> Option<Instant> {
        self.state.read().last_successful_write
    }

    pub fn health_check(&self, stale_threshold: Duration) -> PlaylistHealth {
        match self.last_successful_write() {
            Some(last) => {
                let since = last.elapsed();
                PlaylistHealth {
                    healthy: since <= stale_threshold,
                    since_last_write: Some(since),
                }
            }
            None => PlaylistHealth {
                healthy: false,
                since_last_write: None,
            },
        }
    }
}

/// A narrow trait the Segment Watcher consumes, so tests can inject a fake
/// sink instead of a real [`PlaylistManager`].
pub trait PlaylistSink: Send + Sync {
    fn add_segment(&self, seg: SegmentMeta) -> Result<Vec<String>>;
    fn set_discontinuity_next(&self);
    fn write(&self) -> Result<()>;
    fn current_segments(&self) -> Vec<String>;
}

impl PlaylistSink for PlaylistManager {
    fn add_segment(&self, seg: SegmentMeta) -> Result<Vec<String>> {
        PlaylistManager::add_segment(self, seg)
    }
    fn set_discontinuity_next(&self) {
        PlaylistManager::set_discontinuity_next(self)
    }
    fn write(&self) -> Result<()> {
        PlaylistManager::write(self)
    }
    fn current_segments(&self) -> Vec<String> {
        PlaylistManager::current_segments(self)
    }
}

fn render(state: &MediaPlaylistState, configured_target_duration: f64) -> String {
    let target_duration = state.max_duration_seen.max(configured_target_duration).ceil() as u64;

    let mut m3u8 = String::with_capacity(128 + state.segments.len() * 96);
    writeln!(m3u8, "#EXTM3U").unwrap();
    writeln!(m3u8, "#EXT-X-VERSION:3").unwrap();
    writeln!(m3u8, "#EXT-X-MEDIA-SEQUENCE:{}", state.media_sequence).unwrap();
    writeln!(m3u8, "#EXT-X-TARGETDURATION:{}", target_duration).unwrap();

    for seg in &state.segments {
        if seg.discontinuity {
            writeln!(m3u8, "#EXT-X-DISCONTINUITY").unwrap();
        }
        if let Some(pdt) = seg.program_date_time {
            writeln!(
                m3u8,
                "#EXT-X-PROGRAM-DATE-TIME:{}",
                pdt.format("%Y-%m-%dT%H:%M:%SZ")
            )
            .unwrap();
        }
        writeln!(m3u8, "#EXTINF:{:.3},", seg.duration_secs).unwrap();
        writeln!(m3u8, "{}", seg.uri).unwrap();
    }

    if state.window_size == 0 {
        writeln!(m3u8, "#EXT-X-ENDLIST").unwrap();
    }

    m3u8
}

/// Write `body` to `path` via a tempfile in the same directory, fsync, then
/// rename. Any error along the way leaves the previous file untouched.
fn atomic_write(path: &Path, body: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(body.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mgr(window: usize) -> (tempfile::TempDir, PlaylistManager) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playlist.m3u8");
        let m = PlaylistManager::new(path, window, 2.0).unwrap();
        (dir, m)
    }

    #[test]
    fn rejects_invalid_segment() {
        let (_d, m) = mgr(6);
        assert!(m.add_segment(SegmentMeta::new("", 2.0)).is_err());
        assert!(m.add_segment(SegmentMeta::new("seg-0.ts", 0.0)).is_err());
    }

    #[test]
    fn sliding_window_prunes_oldest_first() {
        let (_d, m) = mgr(6);
        let mut all_pruned = Vec::new();
        for i in 0..10u32 {
            let pruned = m
                .add_segment(SegmentMeta::new(format!("seg-{i:03}.ts"), 2.0))
                .unwrap();
            all_pruned.extend(pruned);
        }
        assert_eq!(m.segment_count(), 6);
        assert_eq!(m.media_sequence(), 4);
        assert_eq!(
            all_pruned,
            vec!["seg-000.ts", "seg-001.ts", "seg-002.ts", "seg-003.ts"]
        );
    }

    #[test]
    fn invariant_media_sequence_plus_len_equals_total_added() {
        let (_d, m) = mgr(6);
        for i in 0..25u32 {
            m.add_segment(SegmentMeta::new(format!("seg-{i:03}.ts"), 2.0)).unwrap();
            assert_eq!(m.media_sequence() + m.segment_count() as u64, i as u64 + 1);
            assert!(m.segment_count() <= 6);
        }
    }

    #[test]
    fn discontinuity_flag_applies_once() {
        let (_d, m) = mgr(0);
        m.set_discontinuity_next();
        m.add_segment(SegmentMeta::new("seg-000.ts", 2.0)).unwrap();
        m.write().unwrap();
        let body = std::fs::read_to_string(&m.output_path).unwrap();
        assert_eq!(body.matches("#EXT-X-DISCONTINUITY").count(), 1);

        m.add_segment(SegmentMeta::new("seg-001.ts", 2.0)).unwrap();
        m.write().unwrap();
        let body = std::fs::read_to_string(&m.output_path).unwrap();
        assert_eq!(body.matches("#EXT-X-DISCONTINUITY").count(), 1);
    }

    #[test]
    fn vod_mode_emits_endlist_and_never_prunes() {
        let (_d, m) = mgr(0);
        for i in 0..20u32 {
            m.add_segment(SegmentMeta::new(format!("seg-{i:03}.ts"), 2.0)).unwrap();
        }
        assert_eq!(m.segment_count(), 20);
        assert_eq!(m.media_sequence(), 0);
        m.write().unwrap();
        let body = std::fs::read_to_string(&m.output_path).unwrap();
        assert!(body.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn write_round_trip_tags_match_accessors() {
        let (_d, m) = mgr(6);
        for i in 0..4u32 {
            m.add_segment(SegmentMeta::new(format!("seg-{i:03}.ts"), 1.5)).unwrap();
        }
        m.write().unwrap();
        let body = std::fs::read_to_string(&m.output_path).unwrap();
        assert!(body.contains(&format!("#EXT-X-MEDIA-SEQUENCE:{}", m.media_sequence())));
        assert!(body.contains(&format!("#EXT-X-TARGETDURATION:{}", m.max_duration().ceil() as u64)));
        let extinf_count = body.matches("#EXTINF:").count();
        assert_eq!(extinf_count, m.segment_count());
    }

    #[test]
    fn close_is_idempotent() {
        let (_d, m) = mgr(6);
        m.add_segment(SegmentMeta::new("seg-000.ts", 2.0)).unwrap();
        m.close().unwrap();
        m.close().unwrap();
        assert!(m.write().is_err());
    }

    #[test]
    fn health_check_reports_unhealthy_before_first_write() {
        let (_d, m) = mgr(6);
        let health = m.health_check(Duration::from_secs(10));
        assert!(!health.healthy);
        assert!(health.since_last_write.is_none());
    }

    #[test]
    fn health_check_reports_healthy_after_recent_write() {
        let (_d, m) = mgr(6);
        m.add_segment(SegmentMeta::new("seg-000.ts", 2.0)).unwrap();
        m.write().unwrap();
        let health = m.health_check(Duration::from_secs(10));
        assert!(health.healthy);
    }
}
