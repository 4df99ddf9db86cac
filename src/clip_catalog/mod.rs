//! ClipCatalog - Clip Listing and Lazy Encode-on-Read
//!
//! ## Responsibilities
//!
//! - List a camera's clips, newest first
//! - Self-heal: drop a raw directory left behind next to its encoded video
//! - Convert a raw image sequence into a video on first read (thumbnail,
//!   concat script, encoder run), at most once per clip
//! - Sweep empty raw clips whose frames were evicted before materialization,
//!   and staging copies that never completed
//!
//! Conversion is a pure function of the stored frames, so the encoded video
//! replaces the raw directory for good. An encoder failure leaves the raw
//! directory in place and the next read retries.

use crate::clip_locks::ClipLocks;
use crate::error::{Error, Result};
use crate::storage::{self, CameraDir};
use crate::video_encoder::VideoEncoder;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

/// One frame file inside a raw clip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFrame {
    pub captured_at_ms: i64,
    pub path: PathBuf,
}

/// A persisted clip
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredClip {
    /// Raw frames, ordered by capture time
    ImageSequence { dir: PathBuf, frames: Vec<StoredFrame> },
    /// Encoded video file
    EncodedVideo { file: PathBuf },
}

/// Clip metadata returned by `list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClipEntry {
    pub name: String,
    pub start: i64,
    pub end: i64,
    pub encoded: bool,
    /// Playback URL (range capable)
    pub src: String,
    /// Thumbnail URL
    pub img: String,
}

/// Frame used as clip thumbnail: rank floor(n/2) in capture order
pub fn select_thumbnail(frames: &[StoredFrame]) -> Option<&StoredFrame> {
    frames.get(frames.len() / 2)
}

/// ffmpeg concat script for an ordered frame list.
///
/// The first frame is listed bare; each following frame is preceded by the
/// display duration derived from its capture delta to the previous frame.
pub fn build_concat_script(frames: &[StoredFrame]) -> String {
    let mut script = String::new();
    let mut prev: Option<i64> = None;

    for frame in frames {
        if let Some(prev_ms) = prev {
            let secs = (frame.captured_at_ms - prev_ms) as f64 / 1000.0;
            script.push_str(&format!("duration {:.3}\n", secs));
        }
        let path = frame.path.display().to_string().replace('\'', "'\\''");
        script.push_str(&format!("file '{}'\n", path));
        prev = Some(frame.captured_at_ms);
    }

    script
}

/// Public URL prefix of the recordings routes
const URL_PREFIX: &str = "/recordings";

/// ClipCatalog service
pub struct ClipCatalog {
    recordings_root: PathBuf,
    encoder: Arc<dyn VideoEncoder>,
    locks: ClipLocks,
}

impl ClipCatalog {
    pub fn new(recordings_root: PathBuf, encoder: Arc<dyn VideoEncoder>) -> Self {
        Self {
            recordings_root,
            encoder,
            locks: ClipLocks::new(),
        }
    }

    /// Replace the conversion locks (e.g. to match the encoder timeout)
    pub fn with_locks(mut self, locks: ClipLocks) -> Self {
        self.locks = locks;
        self
    }

    /// List clips for a camera, newest first
    pub async fn list(&self, camera_id: &str) -> Result<Vec<ClipEntry>> {
        let camera_dir = self.existing_camera_dir(camera_id).await?;

        let mut raw: HashSet<String> = HashSet::new();
        let mut videos: HashSet<String> = HashSet::new();

        let mut entries = fs::read_dir(camera_dir.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type().await?;

            if file_type.is_dir() {
                if storage::parse_key(&name).is_some() {
                    raw.insert(name);
                }
            } else if let Some(key) = name.strip_suffix(".mp4") {
                if storage::parse_key(key).is_some() {
                    videos.insert(key.to_string());
                }
            }
            // staging dirs, thumbnails, concat scripts and partial encodes are skipped
        }

        for key in raw.intersection(&videos) {
            let stale = camera_dir.raw_dir(key);
            tracing::warn!(
                camera_id = %camera_id,
                clip = %key,
                "Removing raw clip left behind by a previous conversion"
            );
            remove_dir_if_present(&stale).await?;
        }

        let mut clips: Vec<ClipEntry> = videos
            .iter()
            .map(|key| self.entry(camera_id, key, true))
            .chain(
                raw.difference(&videos)
                    .map(|key| self.entry(camera_id, key, false)),
            )
            .collect();

        clips.sort_by(|a, b| b.start.cmp(&a.start).then(b.end.cmp(&a.end)));
        Ok(clips)
    }

    /// Inspect a clip without converting it
    pub async fn resolve(&self, camera_id: &str, name: &str) -> Result<StoredClip> {
        let camera_dir = self.existing_camera_dir(camera_id).await?;
        let key = storage::key_from_name(name)?;

        let video = camera_dir.video(key);
        if fs::try_exists(&video).await? {
            return Ok(StoredClip::EncodedVideo { file: video });
        }

        let dir = camera_dir.raw_dir(key);
        if fs::try_exists(&dir).await? {
            let frames = read_frames(&dir).await?;
            return Ok(StoredClip::ImageSequence { dir, frames });
        }

        Err(Error::NotFound(format!("clip {}/{}", camera_id, name)))
    }

    /// Resolve a clip to its video file, encoding it first if needed
    pub async fn get(&self, camera_id: &str, name: &str) -> Result<PathBuf> {
        if let StoredClip::EncodedVideo { file } = self.resolve(camera_id, name).await? {
            return Ok(file);
        }

        let key = storage::key_from_name(name)?;
        let lock_key = format!("{}/{}", camera_id, key);
        let lease = self
            .locks
            .acquire(&lock_key)
            .await
            .map_err(|e| Error::Conflict(format!("clip {}: {}", lock_key, e)))?;

        // another reader may have finished the conversion while we waited
        let result = match self.resolve(camera_id, name).await? {
            StoredClip::EncodedVideo { file } => Ok(file),
            StoredClip::ImageSequence { dir, frames } => {
                let camera_dir = CameraDir::new(&self.recordings_root, camera_id)?;
                self.convert(&camera_dir, key, &dir, &frames).await
            }
        };

        drop(lease);
        self.locks.prune().await;
        result
    }

    /// Thumbnail image of a clip. Raw clips fall back to their middle frame.
    pub async fn thumbnail(&self, camera_id: &str, name: &str) -> Result<PathBuf> {
        let camera_dir = self.existing_camera_dir(camera_id).await?;
        let key = storage::key_from_name(name.strip_suffix(".jpg").unwrap_or(name))?;

        let thumbnail = camera_dir.thumbnail(key);
        if fs::try_exists(&thumbnail).await? {
            return Ok(thumbnail);
        }

        if let Ok(StoredClip::ImageSequence { frames, .. }) = self.resolve(camera_id, key).await {
            if let Some(frame) = select_thumbnail(&frames) {
                return Ok(frame.path.clone());
            }
        }

        Err(Error::NotFound(format!("thumbnail {}/{}", camera_id, name)))
    }

    /// Delete empty raw clips that ended before `older_than`
    pub async fn prune_stale(&self, camera_id: &str, older_than: DateTime<Utc>) -> Result<usize> {
        let camera_dir = CameraDir::new(&self.recordings_root, camera_id)?;
        if !fs::try_exists(camera_dir.path()).await? {
            return Ok(0);
        }

        let cutoff_ms = older_than.timestamp_millis();
        let mut removed = 0;

        let mut entries = fs::read_dir(camera_dir.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let (key, staging) = match name.strip_suffix(&format!(".{}", storage::STAGING_EXT)) {
                Some(key) => (key, true),
                None => (name.as_str(), false),
            };
            let Some((_, end)) = storage::parse_key(key) else {
                continue;
            };
            if end >= cutoff_ms || !entry.file_type().await?.is_dir() {
                continue;
            }

            // an old staging dir is a copy that never completed
            if staging {
                remove_dir_if_present(&entry.path()).await?;
                removed += 1;
                continue;
            }

            let mut contents = fs::read_dir(entry.path()).await?;
            if contents.next_entry().await?.is_none() {
                match fs::remove_dir(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if removed > 0 {
            tracing::info!(camera_id = %camera_id, removed = removed, "Pruned empty clips");
        }
        Ok(removed)
    }

    async fn convert(
        &self,
        camera_dir: &CameraDir,
        key: &str,
        raw_dir: &Path,
        frames: &[StoredFrame],
    ) -> Result<PathBuf> {
        let Some(thumbnail) = select_thumbnail(frames) else {
            return Err(Error::NotFound(format!("clip {} has no frames", key)));
        };
        fs::copy(&thumbnail.path, camera_dir.thumbnail(key)).await?;

        let script_path = camera_dir.script(key);
        fs::write(&script_path, build_concat_script(frames)).await?;

        let partial = camera_dir.partial_video(key);
        let started = std::time::Instant::now();

        if let Err(e) = self.encoder.encode(&script_path, &partial).await {
            if let Err(remove_err) = fs::remove_file(&partial).await {
                if remove_err.kind() != ErrorKind::NotFound {
                    tracing::warn!(clip = %key, error = %remove_err, "Failed to remove partial video");
                }
            }
            tracing::error!(
                clip = %key,
                frames = frames.len(),
                error = %e,
                "Clip encoding failed, raw frames kept for retry"
            );
            return Err(e);
        }

        let video = camera_dir.video(key);
        fs::rename(&partial, &video).await?;
        remove_dir_if_present(raw_dir).await?;
        if let Err(e) = fs::remove_file(&script_path).await {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(clip = %key, error = %e, "Failed to remove concat script");
            }
        }

        tracing::info!(
            clip = %key,
            frames = frames.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Clip encoded"
        );

        Ok(video)
    }

    async fn existing_camera_dir(&self, camera_id: &str) -> Result<CameraDir> {
        let camera_dir = CameraDir::new(&self.recordings_root, camera_id)?;
        if !fs::try_exists(camera_dir.path()).await? {
            return Err(Error::NotFound(format!("camera {}", camera_id)));
        }
        Ok(camera_dir)
    }

    fn entry(&self, camera_id: &str, key: &str, encoded: bool) -> ClipEntry {
        let (start, end) = storage::parse_key(key).unwrap_or_default();
        let name = if encoded {
            format!("{}.mp4", key)
        } else {
            key.to_string()
        };
        ClipEntry {
            src: format!("{}/stream/{}/{}", URL_PREFIX, camera_id, name),
            img: format!("{}/thumbnail/{}/{}.jpg", URL_PREFIX, camera_id, key),
            name,
            start,
            end,
            encoded,
        }
    }
}

/// Frame files of a raw clip, ordered by capture time
async fn read_frames(dir: &Path) -> Result<Vec<StoredFrame>> {
    let mut by_time: HashMap<i64, PathBuf> = HashMap::new();

    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let captured_at_ms = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<i64>().ok());
        if let Some(ms) = captured_at_ms {
            by_time.insert(ms, path);
        }
    }

    let mut frames: Vec<StoredFrame> = by_time
        .into_iter()
        .map(|(captured_at_ms, path)| StoredFrame {
            captured_at_ms,
            path,
        })
        .collect();
    frames.sort_by_key(|f| f.captured_at_ms);
    Ok(frames)
}

async fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
