//! ClipMaterializer - Recording Window to Raw Clip
//!
//! ## Responsibilities
//!
//! - Copy buffered frames inside a decided window into a clip directory
//! - Idempotent on the clip key: an existing raw directory or encoded video
//!   means the clip is already materialized
//! - Run off the ingest/detection path as a delayed background task
//!
//! Frames are copied, never moved; later buffer eviction does not touch a
//! materialized clip. Frames evicted before the copy simply shrink the clip.
//! The copy goes to `{key}.tmp/` and is renamed to `{key}/` once complete, so
//! readers never see a clip with only part of its frames.

use crate::detection_window::ClipRequest;
use crate::error::Result;
use crate::frame_buffer::{Frame, FrameBuffer};
use crate::scheduler;
use crate::storage::CameraDir;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::task::JoinHandle;

/// Result of a materialize call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializeOutcome {
    /// New clip directory written with `frames` frames
    Created { path: PathBuf, frames: usize },
    /// Clip key already present; nothing written
    AlreadyExists,
}

/// ClipMaterializer service
pub struct ClipMaterializer {
    recordings_root: PathBuf,
    frame_buffer: Arc<FrameBuffer>,
}

impl ClipMaterializer {
    pub fn new(recordings_root: PathBuf, frame_buffer: Arc<FrameBuffer>) -> Self {
        Self {
            recordings_root,
            frame_buffer,
        }
    }

    /// Persist the frames of `request` as a raw clip
    pub async fn materialize(&self, request: &ClipRequest) -> Result<MaterializeOutcome> {
        let camera_dir = CameraDir::new(&self.recordings_root, &request.camera_id)?;
        let key = request.key();
        let clip_dir = camera_dir.raw_dir(&key);

        if is_materialized(&camera_dir, &key).await? {
            tracing::debug!(camera_id = %request.camera_id, clip = %key, "Clip already materialized");
            return Ok(MaterializeOutcome::AlreadyExists);
        }

        fs::create_dir_all(camera_dir.path()).await?;
        // frames are copied into a staging dir that listing and reads ignore,
        // then renamed into place; create_dir on it guards against duplicates
        let staging = camera_dir.staging_dir(&key);
        match fs::create_dir(&staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::debug!(
                    camera_id = %request.camera_id,
                    clip = %key,
                    "Clip being materialized concurrently"
                );
                return Ok(MaterializeOutcome::AlreadyExists);
            }
            Err(e) => return Err(e.into()),
        }

        // a concurrent call may have renamed its copy into place meanwhile
        if is_materialized(&camera_dir, &key).await? {
            discard_staging(&staging).await;
            return Ok(MaterializeOutcome::AlreadyExists);
        }

        let frames = match self.copy_frames(request, &staging).await {
            Ok(frames) => frames,
            Err(e) => {
                discard_staging(&staging).await;
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&staging, &clip_dir).await {
            discard_staging(&staging).await;
            return Err(e.into());
        }

        if frames.is_empty() {
            tracing::warn!(
                camera_id = %request.camera_id,
                clip = %key,
                "Clip materialized without frames (already evicted)"
            );
        } else {
            tracing::info!(
                camera_id = %request.camera_id,
                clip = %key,
                frames = frames.len(),
                "Clip materialized"
            );
        }

        Ok(MaterializeOutcome::Created {
            path: clip_dir,
            frames: frames.len(),
        })
    }

    async fn copy_frames(&self, request: &ClipRequest, staging: &Path) -> Result<Vec<Frame>> {
        let frames = self
            .frame_buffer
            .range_between(&request.camera_id, request.start, request.end)
            .await?;

        for frame in &frames {
            fs::write(staging.join(frame.file_name()), &frame.data).await?;
        }
        Ok(frames)
    }

    /// Materialize `request` after `delay` in a detached task, so trailing
    /// frames reach the buffer before the copy runs.
    pub fn schedule(self: &Arc<Self>, request: ClipRequest, delay: Duration) -> JoinHandle<()> {
        let materializer = self.clone();
        let name = format!("materialize {}/{}", request.camera_id, request.key());

        scheduler::spawn_delayed(name, delay, async move {
            if let Err(e) = materializer.materialize(&request).await {
                tracing::error!(
                    camera_id = %request.camera_id,
                    clip = %request.key(),
                    error = %e,
                    "Clip materialization failed"
                );
            }
        })
    }
}

async fn is_materialized(camera_dir: &CameraDir, key: &str) -> Result<bool> {
    Ok(fs::try_exists(camera_dir.raw_dir(key)).await?
        || fs::try_exists(camera_dir.video(key)).await?)
}

async fn discard_staging(staging: &Path) {
    if let Err(e) = fs::remove_dir_all(staging).await {
        if e.kind() != ErrorKind::NotFound {
            tracing::warn!(path = %staging.display(), error = %e, "Failed to remove staging dir");
        }
    }
}
