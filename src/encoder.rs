//! Encoder abstraction — spawns the transcoding process for one batch and
//! exposes a narrow handle the [`crate::controller::Controller`] can await
//! or kill.
//!
//! Mirrors the teacher's `camera::supervised_connect` shape (an external
//! process/stream the controller supervises and restarts on failure) but
//! swaps a GStreamer pipeline for an `ffmpeg` child process, matched against
//! a `trait Encoder` seam so the controller's batch-swap logic can be tested
//! against a fake that never actually shells out.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{ChannelCastError, Result};

/// Hardware acceleration backend selected in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareAccel {
    None,
    Auto,
    Nvenc,
    Qsv,
    Vaapi,
    Videotoolbox,
}

impl Default for HardwareAccel {
    fn default() -> Self {
        HardwareAccel::None
    }
}

/// Encoding speed/quality preset, passed straight through to `-preset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingPreset {
    Ultrafast,
    Veryfast,
    Fast,
    Medium,
    Slow,
}

impl Default for EncodingPreset {
    fn default() -> Self {
        EncodingPreset::Veryfast
    }
}

/// Everything the encoder needs to transcode one batch of source items into
/// one run of `.ts` segments plus a manifest it appends to.
#[derive(Debug, Clone)]
pub struct EncoderArgs {
    pub channel_id: String,
    /// Source media files, in playback order, to concatenate for this batch.
    pub inputs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    /// Filename pattern passed to ffmpeg's segment muxer, e.g. `seg-%05d.ts`.
    pub segment_filename_pattern: String,
    pub segment_duration_secs: f64,
    pub hardware_accel: HardwareAccel,
    pub preset: EncodingPreset,
    pub fps: Option<u32>,
    /// First sequence number ffmpeg's `-segment_start_number` should use, so
    /// consecutive batches never reuse a filename the watcher already saw.
    pub start_number: u64,
    /// Seek offset into the source item, in seconds — resolves a viewer's
    /// wall-clock position to the correct frame when a run starts mid-item.
    pub start_offset_secs: f64,
    /// Exact number of `.ts` segments this run must produce.
    pub segment_count: u64,
}

/// A running encoder process for one batch.
#[async_trait]
pub trait EncoderHandle: Send {
    /// Wait for the process to exit. Returns `Ok(())` on a clean (status 0)
    /// exit, `Err` otherwise.
    async fn wait(&mut self) -> Result<()>;

    /// Terminate the process immediately. Safe to call after `wait` has
    /// already completed.
    async fn kill(&mut self);
}

/// Spawns encoder processes for a batch. Implemented by [`FfmpegEncoder`] in
/// production and by fakes in tests.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn spawn(&self, args: EncoderArgs) -> Result<Box<dyn EncoderHandle>>;
}

/// Default [`Encoder`] implementation, shelling out to a system `ffmpeg`.
pub struct FfmpegEncoder {
    binary: PathBuf,
}

impl FfmpegEncoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn spawn(&self, args: EncoderArgs) -> Result<Box<dyn EncoderHandle>> {
        let concat_list = build_concat_list(&args.inputs);
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-y")
            .arg("-f")
            .arg("concat")
            .arg("-safe")
            .arg("0")
            .arg("-protocol_whitelist")
            .arg("file,pipe");

        apply_hwaccel(&mut cmd, args.hardware_accel);

        if args.start_offset_secs > 0.0 {
            cmd.arg("-ss").arg(format!("{:.3}", args.start_offset_secs));
        }
        cmd.arg("-i").arg("pipe:0");

        if let Some(fps) = args.fps {
            cmd.arg("-r").arg(fps.to_string());
        }

        let run_duration_secs = args.segment_count as f64 * args.segment_duration_secs;

        cmd.arg("-c:v")
            .arg(codec_for(args.hardware_accel))
            .arg("-preset")
            .arg(preset_str(args.preset))
            .arg("-c:a")
            .arg("aac")
            .arg("-t")
            .arg(format!("{:.3}", run_duration_secs))
            .arg("-f")
            .arg("segment")
            .arg("-segment_time")
            .arg(format!("{:.3}", args.segment_duration_secs))
            .arg("-segment_start_number")
            .arg(args.start_number.to_string())
            .arg("-reset_timestamps")
            .arg("1")
            .arg(args.output_dir.join(&args.segment_filename_pattern));

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(channel = args.channel_id, ?cmd, "Spawning encoder process");

        let mut child = cmd
            .spawn()
            .map_err(|e| ChannelCastError::Encoder(format!("failed to spawn ffmpeg: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin
                .write_all(concat_list.as_bytes())
                .await
                .map_err(|e| ChannelCastError::Encoder(format!("failed to write concat list: {e}")))?;
        }

        Ok(Box::new(ChildHandle {
            channel_id: args.channel_id,
            child,
        }))
    }
}

struct ChildHandle {
    channel_id: String,
    child: Child,
}

#[async_trait]
impl EncoderHandle for ChildHandle {
    async fn wait(&mut self) -> Result<()> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ChannelCastError::Encoder(format!("encoder wait failed: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(ChannelCastError::Encoder(format!(
                "channel '{}' encoder exited with {status}",
                self.channel_id
            )))
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(channel = self.channel_id, error = %e, "Failed to kill encoder process");
        }
    }
}

fn build_concat_list(inputs: &[PathBuf]) -> String {
    let mut out = String::new();
    for path in inputs {
        out.push_str("file '");
        out.push_str(&path.to_string_lossy().replace('\'', "'\\''"));
        out.push_str("'\n");
    }
    out
}

fn apply_hwaccel(cmd: &mut Command, accel: HardwareAccel) {
    match accel {
        HardwareAccel::None => {}
        HardwareAccel::Auto => {
            cmd.arg("-hwaccel").arg("auto");
        }
        HardwareAccel::Vaapi => {
            cmd.arg("-hwaccel").arg("vaapi").arg("-hwaccel_output_format").arg("vaapi");
        }
        HardwareAccel::Nvenc => {
            cmd.arg("-hwaccel").arg("cuda");
        }
        HardwareAccel::Qsv => {
            cmd.arg("-hwaccel").arg("qsv").arg("-hwaccel_output_format").arg("qsv");
        }
        HardwareAccel::Videotoolbox => {
            cmd.arg("-hwaccel").arg("videotoolbox");
        }
    }
}

fn codec_for(accel: HardwareAccel) -> &'static str {
    match accel {
        // "auto" only picks a hwaccel decode path; software-encode the
        // output since we can't know which hardware encoder is present.
        HardwareAccel::None | HardwareAccel::Auto => "libx264",
        HardwareAccel::Vaapi => "h264_vaapi",
        HardwareAccel::Nvenc => "h264_nvenc",
        HardwareAccel::Qsv => "h264_qsv",
        HardwareAccel::Videotoolbox => "h264_videotoolbox",
    }
}

fn preset_str(preset: EncodingPreset) -> &'static str {
    match preset {
        EncodingPreset::Ultrafast => "ultrafast",
        EncodingPreset::Veryfast => "veryfast",
        EncodingPreset::Fast => "fast",
        EncodingPreset::Medium => "medium",
        EncodingPreset::Slow => "slow",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_list_escapes_single_quotes() {
        let inputs = vec![PathBuf::from("/media/foo's clip.mp4")];
        let list = build_concat_list(&inputs);
        assert!(list.contains("foo'\\''s clip.mp4"));
    }

    #[test]
    fn codec_matches_hwaccel_backend() {
        assert_eq!(codec_for(HardwareAccel::None), "libx264");
        assert_eq!(codec_for(HardwareAccel::Auto), "libx264");
        assert_eq!(codec_for(HardwareAccel::Vaapi), "h264_vaapi");
        assert_eq!(codec_for(HardwareAccel::Nvenc), "h264_nvenc");
        assert_eq!(codec_for(HardwareAccel::Qsv), "h264_qsv");
    }

    #[test]
    fn default_preset_is_veryfast() {
        assert_eq!(EncodingPreset::default(), EncodingPreset::Veryfast);
    }
}
