//! RecordingOrchestrator - Camera Registry and Detection Polling
//!
//! ## Responsibilities
//!
//! - Own per-camera state (detection window, recording session), created on
//!   registration and dropped on removal
//! - Poll the latest buffered frame through the classifier and feed the
//!   camera's DetectionWindow
//! - Schedule materialization of flushed windows
//! - Drive eviction and empty-clip prune ticks
//!
//! Each camera has exactly one poll task while recording, and the window is
//! only touched from that task (or a direct `poll_once` call), which keeps a
//! single active window per camera. Stopping a camera cancels its ticks and
//! stream; scheduled materializations finish on their own.
//!
//! A frame is classified once. While no newer frame arrives the window clock
//! keeps running from the last frame's capture time by the elapsed monotonic
//! time, so a stalled stream still closes its window before the buffer
//! evicts the frames.

use crate::classifier::{Classifier, DetectionFilter};
use crate::clip_catalog::ClipCatalog;
use crate::clip_materializer::ClipMaterializer;
use crate::detection_window::{ClipRequest, DetectionWindow, WindowConfig, WindowState};
use crate::error::{Error, Result};
use crate::frame_buffer::FrameBuffer;
use crate::frame_source::MjpegSource;
use crate::scheduler::{self, ScheduledTask};
use crate::storage::{self, CameraDir};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Camera registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraConfig {
    pub name: String,
    /// MJPEG base URL; `None` for cameras fed through the push endpoint
    #[serde(default)]
    pub cam_url: Option<String>,
}

/// Camera summary for the API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraInfo {
    pub name: String,
    pub cam_url: Option<String>,
    pub recording: bool,
    pub window_open: bool,
    pub buffered_frames: usize,
}

/// Orchestrator timing and detection settings
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub window: WindowConfig,
    pub filter: DetectionFilter,
    /// Detection poll period (1 / detect fps)
    pub detect_interval: Duration,
    pub evict_interval: Duration,
    pub prune_interval: Duration,
    /// Delay between a window flush and its materialization
    pub materialize_delay: Duration,
    pub reconnect_delay: Duration,
}

struct RecordingSession {
    token: CancellationToken,
    tasks: Vec<ScheduledTask>,
    source: Option<JoinHandle<()>>,
}

/// Detection state of one camera
struct CameraPoll {
    window: DetectionWindow,
    /// Capture time of the last classified frame and when it was classified
    last_frame: Option<(DateTime<Utc>, Instant)>,
}

impl CameraPoll {
    /// Window clock for a poll that found no newer frame than `last_frame`
    fn stalled_now(&self, latest: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let (seen_at, classified) = self.last_frame?;
        if latest > seen_at {
            return None;
        }
        let elapsed = chrono::Duration::from_std(classified.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        Some(seen_at.checked_add_signed(elapsed).unwrap_or(seen_at))
    }
}

struct CameraEntry {
    config: CameraConfig,
    poll: Arc<Mutex<CameraPoll>>,
    session: Option<RecordingSession>,
}

/// RecordingOrchestrator instance
pub struct RecordingOrchestrator {
    cameras: RwLock<HashMap<String, CameraEntry>>,
    frame_buffer: Arc<FrameBuffer>,
    classifier: Arc<dyn Classifier>,
    materializer: Arc<ClipMaterializer>,
    catalog: Arc<ClipCatalog>,
    recordings_root: PathBuf,
    config: RecorderConfig,
}

impl RecordingOrchestrator {
    pub fn new(
        frame_buffer: Arc<FrameBuffer>,
        classifier: Arc<dyn Classifier>,
        materializer: Arc<ClipMaterializer>,
        catalog: Arc<ClipCatalog>,
        recordings_root: PathBuf,
        config: RecorderConfig,
    ) -> Self {
        Self {
            cameras: RwLock::new(HashMap::new()),
            frame_buffer,
            classifier,
            materializer,
            catalog,
            recordings_root,
            config,
        }
    }

    /// Register a camera and create its recordings directory
    pub async fn register(&self, config: CameraConfig) -> Result<CameraInfo> {
        storage::validate_component("camera", &config.name)?;

        let mut cameras = self.cameras.write().await;
        if cameras.contains_key(&config.name) {
            return Err(Error::Conflict(format!("camera {} already exists", config.name)));
        }

        let camera_dir = CameraDir::new(&self.recordings_root, &config.name)?;
        tokio::fs::create_dir_all(camera_dir.path()).await?;
        self.frame_buffer.register(&config.name).await;

        let window = DetectionWindow::new(config.name.clone(), self.config.window);
        let info = CameraInfo {
            name: config.name.clone(),
            cam_url: config.cam_url.clone(),
            recording: false,
            window_open: false,
            buffered_frames: 0,
        };

        tracing::info!(camera_id = %config.name, cam_url = ?config.cam_url, "Camera registered");

        cameras.insert(
            config.name.clone(),
            CameraEntry {
                config,
                poll: Arc::new(Mutex::new(CameraPoll {
                    window,
                    last_frame: None,
                })),
                session: None,
            },
        );

        Ok(info)
    }

    /// All registered cameras
    pub async fn list(&self) -> Vec<CameraInfo> {
        let snapshot: Vec<(CameraConfig, bool, Arc<Mutex<CameraPoll>>)> = {
            let cameras = self.cameras.read().await;
            cameras
                .values()
                .map(|e| (e.config.clone(), e.session.is_some(), e.poll.clone()))
                .collect()
        };

        let mut infos = Vec::with_capacity(snapshot.len());
        for (config, recording, poll) in snapshot {
            let state = poll.lock().await.window.state();
            let window_open = matches!(state, WindowState::Active { .. });
            let buffered_frames = self.frame_buffer.len(&config.name).await.unwrap_or(0);
            infos.push(CameraInfo {
                name: config.name,
                cam_url: config.cam_url,
                recording,
                window_open,
                buffered_frames,
            });
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub async fn get(&self, camera_id: &str) -> Result<CameraInfo> {
        self.list()
            .await
            .into_iter()
            .find(|c| c.name == camera_id)
            .ok_or_else(|| Error::NotFound(format!("camera {}", camera_id)))
    }

    pub async fn is_recording(&self, camera_id: &str) -> Result<bool> {
        let cameras = self.cameras.read().await;
        let entry = cameras
            .get(camera_id)
            .ok_or_else(|| Error::NotFound(format!("camera {}", camera_id)))?;
        Ok(entry.session.is_some())
    }

    /// Start stream ingest, detection polling, eviction and prune ticks.
    /// Starting a recording camera is a no-op.
    pub async fn start(self: &Arc<Self>, camera_id: &str) -> Result<()> {
        let mut cameras = self.cameras.write().await;
        let entry = cameras
            .get_mut(camera_id)
            .ok_or_else(|| Error::NotFound(format!("camera {}", camera_id)))?;

        if entry.session.is_some() {
            tracing::debug!(camera_id = %camera_id, "Camera already recording");
            return Ok(());
        }

        let token = CancellationToken::new();

        let source = match entry.config.cam_url.as_deref() {
            Some(cam_url) => Some(
                MjpegSource::new(camera_id, cam_url, self.frame_buffer.clone())?
                    .with_reconnect_delay(self.config.reconnect_delay)
                    .spawn(token.child_token()),
            ),
            None => None,
        };

        let mut tasks = Vec::with_capacity(3);

        let orchestrator = self.clone();
        let id = camera_id.to_string();
        tasks.push(scheduler::spawn_repeating(
            format!("detect {}", camera_id),
            self.config.detect_interval,
            &token,
            move || {
                let orchestrator = orchestrator.clone();
                let id = id.clone();
                async move {
                    if let Err(e) = orchestrator.poll_once(&id).await {
                        tracing::warn!(camera_id = %id, error = %e, "Detection poll failed");
                    }
                }
            },
        ));

        let frame_buffer = self.frame_buffer.clone();
        let id = camera_id.to_string();
        tasks.push(scheduler::spawn_repeating(
            format!("evict {}", camera_id),
            self.config.evict_interval,
            &token,
            move || {
                let frame_buffer = frame_buffer.clone();
                let id = id.clone();
                async move {
                    if let Err(e) = frame_buffer.evict_expired(&id, Utc::now()).await {
                        tracing::warn!(camera_id = %id, error = %e, "Frame eviction failed");
                    }
                }
            },
        ));

        let catalog = self.catalog.clone();
        let id = camera_id.to_string();
        let prune_horizon = self.frame_buffer.retention() + self.config.window.padding;
        tasks.push(scheduler::spawn_repeating(
            format!("prune {}", camera_id),
            self.config.prune_interval,
            &token,
            move || {
                let catalog = catalog.clone();
                let id = id.clone();
                async move {
                    if let Err(e) = catalog.prune_stale(&id, Utc::now() - prune_horizon).await {
                        tracing::warn!(camera_id = %id, error = %e, "Clip prune failed");
                    }
                }
            },
        ));

        entry.session = Some(RecordingSession {
            token,
            tasks,
            source,
        });

        tracing::info!(
            camera_id = %camera_id,
            detect_interval_ms = self.config.detect_interval.as_millis() as u64,
            "Recording started"
        );
        Ok(())
    }

    /// Stop all ticks of a camera. Returns whether it was recording.
    pub async fn stop(&self, camera_id: &str) -> Result<bool> {
        let session = {
            let mut cameras = self.cameras.write().await;
            let entry = cameras
                .get_mut(camera_id)
                .ok_or_else(|| Error::NotFound(format!("camera {}", camera_id)))?;
            entry.session.take()
        };

        let Some(session) = session else {
            return Ok(false);
        };

        session.token.cancel();
        for task in session.tasks {
            task.join().await;
        }
        if let Some(source) = session.source {
            if let Err(e) = source.await {
                tracing::warn!(camera_id = %camera_id, error = %e, "Stream source ended abnormally");
            }
        }

        tracing::info!(camera_id = %camera_id, "Recording stopped");
        Ok(true)
    }

    /// Stop and forget a camera. Recorded clips stay on disk.
    pub async fn remove(&self, camera_id: &str) -> Result<()> {
        self.stop(camera_id).await?;
        self.cameras.write().await.remove(camera_id);
        self.frame_buffer.remove(camera_id).await;
        tracing::info!(camera_id = %camera_id, "Camera removed");
        Ok(())
    }

    /// Stop every camera
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.cameras.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                tracing::warn!(camera_id = %id, error = %e, "Failed to stop camera");
            }
        }
    }

    /// Frame producer entry point
    pub async fn push_frame(
        &self,
        camera_id: &str,
        captured_at: DateTime<Utc>,
        data: Bytes,
    ) -> Result<()> {
        self.frame_buffer.put(camera_id, captured_at, data).await
    }

    /// One detection cycle: classify the latest frame and advance the window.
    ///
    /// A frame already classified is not sent again; the window is ticked with
    /// the stalled clock instead. A classifier failure leaves the window
    /// untouched. Returns the clip requests flushed by this cycle (already
    /// scheduled for materialization).
    pub async fn poll_once(&self, camera_id: &str) -> Result<Vec<ClipRequest>> {
        let poll = {
            let cameras = self.cameras.read().await;
            cameras
                .get(camera_id)
                .map(|e| e.poll.clone())
                .ok_or_else(|| Error::NotFound(format!("camera {}", camera_id)))?
        };

        let Some(frame) = self.frame_buffer.latest(camera_id).await? else {
            tracing::debug!(camera_id = %camera_id, "No frames in buffer");
            return Ok(Vec::new());
        };

        {
            let mut poll = poll.lock().await;
            if let Some(now) = poll.stalled_now(frame.captured_at) {
                tracing::trace!(camera_id = %camera_id, now = %now, "No new frame since last poll");
                let request = poll.window.on_tick(now);
                drop(poll);
                return Ok(self.schedule_requests(camera_id, request));
            }
        }

        let detections = self.classifier.classify(&frame.data).await?;
        let detected = self.config.filter.matches(&detections);

        let request = {
            let mut poll = poll.lock().await;
            poll.last_frame = Some((frame.captured_at, Instant::now()));
            if detected {
                tracing::debug!(
                    camera_id = %camera_id,
                    captured_at = %frame.captured_at,
                    label = %self.config.filter.target_label,
                    "Subject detected"
                );
                poll.window.on_detection(frame.captured_at)
            } else {
                poll.window.on_tick(frame.captured_at)
            }
        };

        Ok(self.schedule_requests(camera_id, request))
    }

    fn schedule_requests(
        &self,
        camera_id: &str,
        request: Option<ClipRequest>,
    ) -> Vec<ClipRequest> {
        let requests: Vec<ClipRequest> = request.into_iter().collect();
        for request in &requests {
            tracing::info!(
                camera_id = %camera_id,
                clip = %request.key(),
                delay_ms = self.config.materialize_delay.as_millis() as u64,
                "Clip scheduled"
            );
            self.materializer
                .schedule(request.clone(), self.config.materialize_delay);
        }
        requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Detection;
    use crate::video_encoder::VideoEncoder;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Detects a person in frames whose bytes are `person`; fails on `error`
    #[derive(Default)]
    struct ScriptedClassifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Classifier for ScriptedClassifier {
        async fn classify(&self, image: &[u8]) -> Result<Vec<Detection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match image {
                b"error" => Err(Error::Classifier("unreachable".into())),
                b"person" => Ok(vec![Detection {
                    label: "person".into(),
                    confidence: 0.9,
                    bbox: None,
                }]),
                _ => Ok(Vec::new()),
            }
        }
    }

    struct NoopEncoder;

    #[async_trait]
    impl VideoEncoder for NoopEncoder {
        async fn encode(&self, _script: &Path, output: &Path) -> Result<()> {
            tokio::fs::write(output, b"video").await?;
            Ok(())
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn setup(idle_flush: bool) -> (TempDir, Arc<RecordingOrchestrator>, Arc<ScriptedClassifier>) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let frame_buffer = Arc::new(FrameBuffer::new(chrono::Duration::seconds(30)));
        let classifier = Arc::new(ScriptedClassifier::default());
        let materializer = Arc::new(ClipMaterializer::new(root.clone(), frame_buffer.clone()));
        let catalog = Arc::new(ClipCatalog::new(root.clone(), Arc::new(NoopEncoder)));

        let config = RecorderConfig {
            window: WindowConfig {
                padding: chrono::Duration::seconds(5),
                retention: chrono::Duration::seconds(30),
                idle_flush,
            },
            filter: DetectionFilter::default(),
            detect_interval: Duration::from_secs(1),
            evict_interval: Duration::from_secs(1),
            prune_interval: Duration::from_secs(60),
            materialize_delay: Duration::ZERO,
            reconnect_delay: Duration::from_secs(5),
        };

        let orchestrator = Arc::new(RecordingOrchestrator::new(
            frame_buffer,
            classifier.clone(),
            materializer,
            catalog,
            root,
            config,
        ));
        (dir, orchestrator, classifier)
    }

    async fn push(orchestrator: &RecordingOrchestrator, secs: i64, body: &'static [u8]) {
        orchestrator
            .push_frame("room", at(secs), Bytes::from_static(body))
            .await
            .unwrap();
    }

    fn room_camera() -> CameraConfig {
        CameraConfig {
            name: "room".to_string(),
            cam_url: None,
        }
    }

    async fn wait_for(path: &Path) {
        for _ in 0..100 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{} never appeared", path.display());
    }

    #[tokio::test]
    async fn test_register_list_remove() {
        let (dir, orchestrator, _) = setup(false);
        orchestrator.register(room_camera()).await.unwrap();
        assert!(dir.path().join("room").is_dir());

        let duplicate = orchestrator.register(room_camera()).await;
        assert!(matches!(duplicate, Err(Error::Conflict(_))));

        let invalid = orchestrator
            .register(CameraConfig {
                name: "../x".into(),
                cam_url: None,
            })
            .await;
        assert!(matches!(invalid, Err(Error::Validation(_))));

        let cameras = orchestrator.list().await;
        assert_eq!(cameras.len(), 1);
        assert!(!cameras[0].recording);

        orchestrator.remove("room").await.unwrap();
        assert!(orchestrator.list().await.is_empty());
        assert!(matches!(orchestrator.get("room").await, Err(Error::NotFound(_))));
        // clips stay on disk
        assert!(dir.path().join("room").is_dir());
    }

    #[tokio::test]
    async fn test_detection_burst_materializes_one_clip() {
        let (dir, orchestrator, _) = setup(false);
        orchestrator.register(room_camera()).await.unwrap();

        for secs in [0, 1, 2, 3] {
            push(&orchestrator, secs, b"person").await;
            assert!(orchestrator.poll_once("room").await.unwrap().is_empty());
        }
        push(&orchestrator, 4, b"empty").await;

        // far detection flushes [0-5, 3+5]
        push(&orchestrator, 20, b"person").await;
        let requests = orchestrator.poll_once("room").await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!((requests[0].start, requests[0].end), (at(-5), at(8)));

        let clip_dir = dir.path().join("room").join(requests[0].key());
        wait_for(&clip_dir.join(format!("{}.jpg", at(4).timestamp_millis()))).await;
        let frames = std::fs::read_dir(&clip_dir).unwrap().count();
        assert_eq!(frames, 5);
    }

    #[tokio::test]
    async fn test_idle_flush_on_quiet_poll() {
        let (_dir, orchestrator, _) = setup(true);
        orchestrator.register(room_camera()).await.unwrap();

        push(&orchestrator, 0, b"person").await;
        orchestrator.poll_once("room").await.unwrap();
        push(&orchestrator, 4, b"empty").await;
        assert!(orchestrator.poll_once("room").await.unwrap().is_empty());
        assert!(orchestrator.get("room").await.unwrap().window_open);

        push(&orchestrator, 6, b"empty").await;
        let requests = orchestrator.poll_once("room").await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(!orchestrator.get("room").await.unwrap().window_open);
    }

    #[tokio::test]
    async fn test_classifier_failure_leaves_window_untouched() {
        let (_dir, orchestrator, classifier) = setup(true);
        orchestrator.register(room_camera()).await.unwrap();

        push(&orchestrator, 0, b"person").await;
        orchestrator.poll_once("room").await.unwrap();

        push(&orchestrator, 60, b"error").await;
        let result = orchestrator.poll_once("room").await;
        assert!(matches!(result, Err(Error::Classifier(_))));
        assert!(orchestrator.get("room").await.unwrap().window_open);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_poll_without_frames() {
        let (_dir, orchestrator, classifier) = setup(false);
        orchestrator.register(room_camera()).await.unwrap();
        assert!(orchestrator.poll_once("room").await.unwrap().is_empty());
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            orchestrator.poll_once("garage").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_ticks() {
        let (_dir, orchestrator, classifier) = setup(false);
        orchestrator.register(room_camera()).await.unwrap();
        // wall-clock timestamp so the evict tick keeps it
        orchestrator
            .push_frame("room", Utc::now(), Bytes::from_static(b"empty"))
            .await
            .unwrap();

        orchestrator.start("room").await.unwrap();
        orchestrator.start("room").await.unwrap();
        assert!(orchestrator.is_recording("room").await.unwrap());

        // the same frame is classified once however many polls run
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);

        orchestrator
            .push_frame(
                "room",
                Utc::now() + chrono::Duration::seconds(1),
                Bytes::from_static(b"empty"),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 2);

        assert!(orchestrator.stop("room").await.unwrap());
        assert!(!orchestrator.is_recording("room").await.unwrap());
        assert!(!orchestrator.stop("room").await.unwrap());

        let after_stop = classifier.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(classifier.calls.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_stream_closes_window() {
        let (_dir, orchestrator, classifier) = setup(true);
        orchestrator.register(room_camera()).await.unwrap();

        push(&orchestrator, 0, b"person").await;
        assert!(orchestrator.poll_once("room").await.unwrap().is_empty());
        assert!(orchestrator.get("room").await.unwrap().window_open);

        // no new frames: the window clock follows elapsed time
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(orchestrator.poll_once("room").await.unwrap().is_empty());
        assert!(orchestrator.get("room").await.unwrap().window_open);

        tokio::time::advance(Duration::from_secs(3)).await;
        let requests = orchestrator.poll_once("room").await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!((requests[0].start, requests[0].end), (at(-5), at(5)));
        assert!(!orchestrator.get("room").await.unwrap().window_open);

        // flushed well inside the 30 s retention horizon, classified once
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    }
}
