//! VideoEncoder - Frame Sequence to Video
//!
//! ## Responsibilities
//!
//! - Turn an ffmpeg concat script (ordered frames + durations) into an MP4
//! - Bound encoder runtime; kill the child process on timeout
//!
//! The encoder is a trait so the clip catalog can be exercised without an
//! ffmpeg binary.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Video encoder boundary
#[async_trait]
pub trait VideoEncoder: Send + Sync {
    /// Encode the frames listed in `concat_script` into `output`
    async fn encode(&self, concat_script: &Path, output: &Path) -> Result<()>;
}

/// ffmpeg encoder settings
#[derive(Debug, Clone)]
pub struct FfmpegConfig {
    /// ffmpeg binary
    pub binary: String,
    /// Video codec (libx264, h264_nvmpi, ...)
    pub codec: String,
    /// Maximum runtime per clip
    pub timeout: Duration,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            codec: "libx264".to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Encoder backed by an ffmpeg child process
pub struct FfmpegEncoder {
    config: FfmpegConfig,
}

impl FfmpegEncoder {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }

    /// Command line arguments for one encode
    fn args(&self, concat_script: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            concat_script.display().to_string(),
            "-c:v".to_string(),
            self.config.codec.clone(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-f".to_string(),
            "mp4".to_string(),
            output.display().to_string(),
        ]
    }

    /// Check that the encoder binary runs; returns its version line
    pub async fn check(&self) -> Result<String> {
        let output = Command::new(&self.config.binary)
            .arg("-version")
            .output()
            .await
            .map_err(|e| Error::Encoder(format!("{} not found: {}", self.config.binary, e)))?;

        if !output.status.success() {
            return Err(Error::Encoder(format!(
                "{} version check failed",
                self.config.binary
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        Ok(version.lines().next().unwrap_or("unknown").to_string())
    }
}

#[async_trait]
impl VideoEncoder for FfmpegEncoder {
    async fn encode(&self, concat_script: &Path, output: &Path) -> Result<()> {
        // kill_on_drop: a timed-out child is killed when the future is dropped
        let child = Command::new(&self.config.binary)
            .args(self.args(concat_script, output))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Encoder(format!("spawn failed: {}", e)))?;

        tracing::debug!(
            script = %concat_script.display(),
            output = %output.display(),
            codec = %self.config.codec,
            "Encoder started"
        );

        match tokio::time::timeout(self.config.timeout, child.wait_with_output()).await {
            Ok(Ok(result)) if result.status.success() => Ok(()),
            Ok(Ok(result)) => {
                let stderr = String::from_utf8_lossy(&result.stderr);
                Err(Error::Encoder(format!(
                    "exited with {}: {}",
                    result.status,
                    stderr.trim()
                )))
            }
            Ok(Err(e)) => Err(Error::Encoder(format!("execution failed: {}", e))),
            Err(_) => {
                tracing::warn!(
                    timeout_sec = self.config.timeout.as_secs(),
                    output = %output.display(),
                    "Encoder timeout, process killed"
                );
                Err(Error::Encoder(format!(
                    "timeout ({}s)",
                    self.config.timeout.as_secs()
                )))
            }
        }
    }
}
