//! Segment watcher — observes a channel's segment directory for newly
//! written `.ts` files, appends them to a [`PlaylistSink`], detects
//! timestamp regressions across batch boundaries, and prunes stale files
//! once they fall outside the sliding window.
//!
//! Two cooperating tasks per controller, following the same shape as the
//! teacher's single-consumer channel tasks (`ingestion.rs`'s per-camera
//! worker, `global_writer.rs`'s single writer loop): one observes the
//! filesystem and debounces new files into `AddSegment` calls, the other
//! periodically sweeps the directory for files that have aged out of both
//! the playlist and the safety buffer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::playlist::{PlaylistSink, SegmentMeta};

const DEBOUNCE_TICK: Duration = Duration::from_millis(500);
const SETTLE_FLOOR: Duration = Duration::from_millis(100);

/// Configuration for one [`Watcher`] instance, one per active channel.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub segment_dir: PathBuf,
    pub window_size: usize,
    pub safety_buffer: usize,
    pub prune_interval: Duration,
    pub segment_duration: Duration,
    pub poll_interval: Duration,
}

struct RegressionTracker {
    last_pdt: Option<DateTime<Utc>>,
    last_notify: Option<Instant>,
}

/// Watches one channel's segment directory and drives its [`PlaylistSink`].
pub struct Watcher {
    config: WatcherConfig,
    sink: Arc<dyn PlaylistSink>,
    cancel: CancellationToken,
    tracker: Arc<Mutex<RegressionTracker>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Watcher {
    pub fn new(config: WatcherConfig, sink: Arc<dyn PlaylistSink>) -> Self {
        Self {
            config,
            sink,
            cancel: CancellationToken::new(),
            tracker: Arc::new(Mutex::new(RegressionTracker {
                last_pdt: None,
                last_notify: None,
            })),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Launch the observer and pruner tasks. Safe to call once; subsequent
    /// calls are ignored.
    pub fn start(self: &Arc<Self>) {
        if !self.tasks.lock().is_empty() {
            return;
        }
        let observer = tokio::spawn(Self::run_observer(self.clone()));
        let pruner = tokio::spawn(Self::run_pruner(self.clone()));
        *self.tasks.lock() = vec![observer, pruner];
    }

    /// Idempotent: cancels both tasks and waits (best-effort) for them to
    /// exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for h in handles {
            let _ = h.await;
        }
    }

    /// Force a discontinuity at the next observed segment; used by the
    /// orchestrator at batch-boundary restarts.
    pub fn mark_discontinuity(&self) {
        self.sink.set_discontinuity_next();
        let mut tracker = self.tracker.lock();
        tracker.last_pdt = None;
        tracker.last_notify = None;
    }

    async fn run_observer(self: Arc<Self>) {
        let (tx, mut rx) = mpsc::channel::<PathBuf>(256);
        let use_native = spawn_native_watch(&self.config.segment_dir, tx.clone()).is_ok();
        if !use_native {
            warn!(
                dir = %self.config.segment_dir.display(),
                "Native file watch unavailable, falling back to polling"
            );
            tokio::spawn(poll_directory(
                self.config.segment_dir.clone(),
                self.config.poll_interval,
                tx,
                self.cancel.clone(),
            ));
        }

        let mut pending: HashMap<String, Instant> = HashMap::new();
        let mut ticker = tokio::time::interval(DEBOUNCE_TICK);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.sweep_pending(&mut pending);
                }
                maybe_path = rx.recv() => {
                    match maybe_path {
                        Some(path) => {
                            if path.extension().and_then(|e| e.to_str()) == Some("ts") {
                                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                                    pending.entry(name.to_string()).or_insert_with(Instant::now);
                                }
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }

    fn sweep_pending(&self, pending: &mut HashMap<String, Instant>) {
        let mut ready = Vec::new();
        pending.retain(|name, first_seen| {
            if first_seen.elapsed() < SETTLE_FLOOR {
                return true;
            }
            let path = self.config.segment_dir.join(name);
            match path.metadata() {
                Ok(meta) => {
                    ready.push((name.clone(), meta.modified().unwrap_or(SystemTime::now())));
                    false
                }
                Err(_) => false, // file vanished before settling; drop silently
            }
        });
        ready.sort_by_key(|(name, _)| name.clone());
        for (name, mtime) in ready {
            self.notify_new_segment(&name, mtime);
        }
    }

    fn notify_new_segment(&self, filename: &str, mtime: SystemTime) {
        let pdt: DateTime<Utc> = mtime.into();

        let mut meta = SegmentMeta::new(filename, self.config.segment_duration.as_secs_f64())
            .with_program_date_time(pdt);

        {
            let mut tracker = self.tracker.lock();
            if let Some(prev) = tracker.last_pdt {
                if pdt < prev {
                    warn!(segment = filename, prev = %prev, now = %pdt, "Timestamp regression detected");
                    self.sink.set_discontinuity_next();
                }
                let cadence = tracker.last_notify.map(|t| t.elapsed());
                if let Some(cadence) = cadence {
                    let limit = self.config.segment_duration * 2;
                    if cadence > limit {
                        warn!(segment = filename, ?cadence, ?limit, "Segment cadence exceeded threshold");
                    }
                }
            }
            tracker.last_pdt = Some(pdt);
            tracker.last_notify = Some(Instant::now());
        }

        meta.discontinuity = false; // AddSegment ORs in pending_discontinuity itself
        if let Err(e) = self.sink.add_segment(meta) {
            error!(segment = filename, error = %e, "Failed to add segment to playlist");
            return;
        }
        if let Err(e) = self.sink.write() {
            error!(error = %e, "Failed to write playlist");
        }
    }

    async fn run_pruner(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.prune_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => self.prune_once(),
            }
        }
    }

    fn prune_once(&self) {
        let entries = match std::fs::read_dir(&self.config.segment_dir) {
            Ok(rd) => rd,
            Err(e) => {
                warn!(error = %e, "Failed to list segment dir for pruning");
                return;
            }
        };

        let mut files: Vec<(String, SystemTime)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ts") {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((name.to_string(), mtime));
        }

        let current = self.sink.current_segments();
        files.retain(|(name, _)| !current.contains(name));
        files.sort_by_key(|(_, mtime)| *mtime);

        let limit = self.config.window_size + self.config.safety_buffer;
        if files.len() <= limit {
            return;
        }

        let surplus = files.len() - limit;
        for (name, _) in files.into_iter().take(surplus) {
            // Re-check membership immediately before unlinking.
            if self.sink.current_segments().contains(&name) {
                continue;
            }
            let path = self.config.segment_dir.join(&name);
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(path = %path.display(), error = %e, "Failed to prune stale segment");
            }
        }
    }
}

fn spawn_native_watch(dir: &Path, tx: mpsc::Sender<PathBuf>) -> notify::Result<()> {
    let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            if matches!(
                event.kind,
                notify::EventKind::Create(_) | notify::EventKind::Modify(_)
            ) {
                for path in event.paths {
                    let _ = tx.try_send(path);
                }
            }
        }
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    // Leak the watcher onto a background task's stack by boxing it into a
    // task that simply parks; dropping it would stop delivery.
    std::mem::forget(watcher);
    Ok(())
}

async fn poll_directory(
    dir: PathBuf,
    interval: Duration,
    tx: mpsc::Sender<PathBuf>,
    cancel: CancellationToken,
) {
    let mut seen: std::collections::HashSet<PathBuf> = std::collections::HashSet::new();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let Ok(rd) = std::fs::read_dir(&dir) else { continue };
                for entry in rd.flatten() {
                    let path = entry.path();
                    if seen.insert(path.clone()) {
                        let _ = tx.send(path).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSink {
        segments: Mutex<Vec<SegmentMeta>>,
        discontinuity_calls: AtomicUsize,
    }

    impl FakeSink {
        fn new() -> Self {
            Self {
                segments: Mutex::new(Vec::new()),
                discontinuity_calls: AtomicUsize::new(0),
            }
        }
    }

    impl PlaylistSink for FakeSink {
        fn add_segment(&self, seg: SegmentMeta) -> Result<Vec<String>> {
            self.segments.lock().push(seg);
            Ok(Vec::new())
        }
        fn set_discontinuity_next(&self) {
            self.discontinuity_calls.fetch_add(1, Ordering::SeqCst);
        }
        fn write(&self) -> Result<()> {
            Ok(())
        }
        fn current_segments(&self) -> Vec<String> {
            self.segments.lock().iter().map(|s| s.uri.clone()).collect()
        }
    }

    fn watcher_with(sink: Arc<FakeSink>) -> Watcher {
        Watcher::new(
            WatcherConfig {
                segment_dir: std::env::temp_dir(),
                window_size: 6,
                safety_buffer: 2,
                prune_interval: Duration::from_secs(5),
                segment_duration: Duration::from_secs(2),
                poll_interval: Duration::from_millis(200),
            },
            sink,
        )
    }

    #[test]
    fn detects_timestamp_regression() {
        let sink = Arc::new(FakeSink::new());
        let w = watcher_with(sink.clone());

        let t0 = SystemTime::now();
        let t1 = t0 + Duration::from_secs(5);
        let t2 = t0 + Duration::from_secs(2); // regresses vs t1

        w.notify_new_segment("seg-000.ts", t0);
        w.notify_new_segment("seg-001.ts", t1);
        w.notify_new_segment("seg-002.ts", t2);

        assert_eq!(sink.discontinuity_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mark_discontinuity_resets_tracker_and_flags_sink() {
        let sink = Arc::new(FakeSink::new());
        let w = watcher_with(sink.clone());
        w.notify_new_segment("seg-000.ts", SystemTime::now());
        w.mark_discontinuity();
        assert!(w.tracker.lock().last_pdt.is_none());
        assert_eq!(sink.discontinuity_calls.load(Ordering::SeqCst), 1);
    }
}
