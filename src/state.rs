//! Application state
//!
//! Holds all shared components and state

use crate::classifier::{Classifier, DetectionFilter};
use crate::clip_catalog::ClipCatalog;
use crate::clip_locks::ClipLocks;
use crate::clip_materializer::ClipMaterializer;
use crate::detection_window::WindowConfig;
use crate::frame_buffer::FrameBuffer;
use crate::frame_source::DEFAULT_RECONNECT_DELAY;
use crate::recording_orchestrator::{CameraConfig, RecorderConfig, RecordingOrchestrator};
use crate::video_encoder::{FfmpegConfig, VideoEncoder};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Root of all clip storage
    pub recordings_dir: PathBuf,
    /// Detection service base URL
    pub classifier_url: String,
    /// Label that counts as a detection
    pub target_label: String,
    pub min_confidence: f32,
    /// Detection polls per second
    pub detect_fps: f64,
    /// Padding added before the first and after the last detection (secs)
    pub record_padding_secs: i64,
    /// Frame buffer retention horizon (secs)
    pub retention_secs: i64,
    pub evict_interval_ms: u64,
    pub prune_interval_secs: u64,
    /// Close open windows once detections stop for `record_padding_secs`
    pub idle_flush: bool,
    pub encoder_bin: String,
    pub encoder_codec: String,
    pub encoder_timeout_secs: u64,
    /// Cameras registered and started at boot
    pub cameras: Vec<CameraConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOST")
                .unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            recordings_dir: std::env::var("RECORDINGS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./recordings")),
            classifier_url: std::env::var("CLASSIFIER_URL")
                .unwrap_or_else(|_| "http://localhost:5000".to_string()),
            target_label: std::env::var("TARGET_LABEL")
                .unwrap_or_else(|_| "person".to_string()),
            min_confidence: env_parse("MIN_CONFIDENCE", 0.5),
            detect_fps: env_parse("DETECT_FPS", 1.0),
            record_padding_secs: env_parse("RECORD_PADDING_SECS", 5),
            retention_secs: env_parse("RETENTION_SECS", 30),
            evict_interval_ms: env_parse("EVICT_INTERVAL_MS", 1000),
            prune_interval_secs: env_parse("PRUNE_INTERVAL_SECS", 60),
            idle_flush: env_parse("IDLE_FLUSH", true),
            encoder_bin: std::env::var("ENCODER_BIN")
                .unwrap_or_else(|_| "ffmpeg".to_string()),
            encoder_codec: std::env::var("ENCODER_CODEC")
                .unwrap_or_else(|_| "libx264".to_string()),
            encoder_timeout_secs: env_parse("ENCODER_TIMEOUT_SECS", 300),
            cameras: std::env::var("CAMERAS")
                .map(|v| parse_cameras(&v))
                .unwrap_or_default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Parse `name=url,name=url`; a bare `name` registers a push-only camera
pub fn parse_cameras(value: &str) -> Vec<CameraConfig> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((name, url)) => CameraConfig {
                name: name.trim().to_string(),
                cam_url: Some(url.trim().to_string()).filter(|u| !u.is_empty()),
            },
            None => CameraConfig {
                name: entry.to_string(),
                cam_url: None,
            },
        })
        .collect()
}

impl AppConfig {
    pub fn padding(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.record_padding_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs)
    }

    /// Poll period for `detect_fps`; 1 s when the rate is unusable, never below 1 ms
    pub fn detect_interval(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.detect_fps)
            .unwrap_or(Duration::from_secs(1))
            .max(Duration::from_millis(1))
    }

    pub fn encoder_config(&self) -> FfmpegConfig {
        FfmpegConfig {
            binary: self.encoder_bin.clone(),
            codec: self.encoder_codec.clone(),
            timeout: Duration::from_secs(self.encoder_timeout_secs),
        }
    }

    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            window: WindowConfig {
                padding: self.padding(),
                retention: self.retention(),
                idle_flush: self.idle_flush,
            },
            filter: DetectionFilter {
                target_label: self.target_label.clone(),
                min_confidence: self.min_confidence,
            },
            detect_interval: self.detect_interval(),
            evict_interval: Duration::from_millis(self.evict_interval_ms.max(1)),
            prune_interval: Duration::from_secs(self.prune_interval_secs.max(1)),
            materialize_delay: self.padding().to_std().unwrap_or_default(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// FrameBuffer (recent frames per camera)
    pub frame_buffer: Arc<FrameBuffer>,
    /// ClipMaterializer (buffer -> raw clip dir)
    pub materializer: Arc<ClipMaterializer>,
    /// ClipCatalog (listing, lazy encode)
    pub catalog: Arc<ClipCatalog>,
    /// RecordingOrchestrator (camera registry, detection polling)
    pub orchestrator: Arc<RecordingOrchestrator>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    /// Wire all components for `config`
    pub fn new(
        config: AppConfig,
        classifier: Arc<dyn Classifier>,
        encoder: Arc<dyn VideoEncoder>,
    ) -> Self {
        let frame_buffer = Arc::new(FrameBuffer::new(config.retention()));
        let materializer = Arc::new(ClipMaterializer::new(
            config.recordings_dir.clone(),
            frame_buffer.clone(),
        ));
        // a reader waits at most one full encode (plus slack) for a conversion in progress
        let lock_timeout = Duration::from_secs(config.encoder_timeout_secs.saturating_add(30));
        let catalog = Arc::new(
            ClipCatalog::new(config.recordings_dir.clone(), encoder)
                .with_locks(ClipLocks::with_timeout(lock_timeout)),
        );
        let orchestrator = Arc::new(RecordingOrchestrator::new(
            frame_buffer.clone(),
            classifier,
            materializer.clone(),
            catalog.clone(),
            config.recordings_dir.clone(),
            config.recorder_config(),
        ));

        Self {
            config,
            frame_buffer,
            materializer,
            catalog,
            orchestrator,
            started_at: chrono::Utc::now(),
        }
    }
}
