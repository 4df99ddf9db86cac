//! FrameBuffer - Time-Bounded Per-Camera Frame Store
//!
//! ## Responsibilities
//!
//! - Hold recent frames per camera, strictly ordered by capture time
//! - Provide latest frame for detection polling
//! - Provide snapshot ranges for clip materialization
//! - Evict frames older than the retention horizon
//!
//! Capacity is bounded by time only. Frames are keyed by capture time at
//! millisecond precision; a second write at the same instant replaces the
//! first.

use crate::error::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A single captured frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Capture timestamp (millisecond precision)
    pub captured_at: DateTime<Utc>,
    /// Encoded image (JPEG bytes)
    pub data: Bytes,
}

impl Frame {
    /// File name used when the frame is stored inside a clip
    pub fn file_name(&self) -> String {
        format!("{}.jpg", self.captured_at.timestamp_millis())
    }
}

type CameraFrames = Arc<RwLock<BTreeMap<DateTime<Utc>, Bytes>>>;

/// FrameBuffer service
pub struct FrameBuffer {
    /// camera_id -> ordered frames
    cameras: RwLock<HashMap<String, CameraFrames>>,
    /// Retention horizon
    retention: Duration,
}

impl FrameBuffer {
    /// Create new FrameBuffer with the given retention horizon
    pub fn new(retention: Duration) -> Self {
        Self {
            cameras: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Register a camera. Registering twice keeps existing frames.
    pub async fn register(&self, camera_id: &str) {
        let mut cameras = self.cameras.write().await;
        cameras
            .entry(camera_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(BTreeMap::new())));
    }

    /// Drop a camera and all of its frames
    pub async fn remove(&self, camera_id: &str) -> bool {
        self.cameras.write().await.remove(camera_id).is_some()
    }

    /// Store a frame (last write wins on equal timestamps)
    pub async fn put(
        &self,
        camera_id: &str,
        captured_at: DateTime<Utc>,
        data: Bytes,
    ) -> Result<()> {
        let frames = self.frames_for(camera_id).await?;
        let captured_at = captured_at.trunc_subsecs(3);
        let size = data.len();

        let replaced = frames.write().await.insert(captured_at, data).is_some();

        tracing::trace!(
            camera_id = %camera_id,
            captured_at = %captured_at,
            size = size,
            replaced = replaced,
            "Buffered frame"
        );

        Ok(())
    }

    /// Most recent frame, if any
    pub async fn latest(&self, camera_id: &str) -> Result<Option<Frame>> {
        let frames = self.frames_for(camera_id).await?;
        let frames = frames.read().await;
        Ok(frames.iter().next_back().map(|(t, data)| Frame {
            captured_at: *t,
            data: data.clone(),
        }))
    }

    /// Frames with `start < captured_at < end`, ascending.
    ///
    /// The returned vector is a snapshot; later writes and evictions do not
    /// affect it.
    pub async fn range_between(
        &self,
        camera_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Frame>> {
        let frames = self.frames_for(camera_id).await?;
        if start >= end {
            return Ok(Vec::new());
        }

        let frames = frames.read().await;
        Ok(frames
            .range((Bound::Excluded(start), Bound::Excluded(end)))
            .map(|(t, data)| Frame {
                captured_at: *t,
                data: data.clone(),
            })
            .collect())
    }

    /// Remove every frame with `captured_at < cutoff`. Returns removed count.
    pub async fn evict_older_than(&self, camera_id: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let frames = self.frames_for(camera_id).await?;
        let mut frames = frames.write().await;

        let kept = frames.split_off(&cutoff);
        let removed = frames.len();
        *frames = kept;

        if removed > 0 {
            tracing::trace!(
                camera_id = %camera_id,
                cutoff = %cutoff,
                removed = removed,
                "Evicted frames"
            );
        }

        Ok(removed)
    }

    /// Evict frames that fell out of the retention horizon relative to `now`
    pub async fn evict_expired(&self, camera_id: &str, now: DateTime<Utc>) -> Result<usize> {
        self.evict_older_than(camera_id, now - self.retention).await
    }

    /// Number of buffered frames for a camera
    pub async fn len(&self, camera_id: &str) -> Result<usize> {
        let frames = self.frames_for(camera_id).await?;
        let len = frames.read().await.len();
        Ok(len)
    }

    /// Buffer statistics
    pub async fn stats(&self) -> BufferStats {
        let cameras: Vec<CameraFrames> = self.cameras.read().await.values().cloned().collect();

        let mut stats = BufferStats {
            camera_count: cameras.len(),
            ..Default::default()
        };
        for frames in cameras {
            let frames = frames.read().await;
            stats.frame_count += frames.len();
            stats.total_bytes += frames.values().map(|d| d.len()).sum::<usize>();
        }
        stats
    }

    async fn frames_for(&self, camera_id: &str) -> Result<CameraFrames> {
        self.cameras
            .read()
            .await
            .get(camera_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("camera {}", camera_id)))
    }
}

/// Buffer statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BufferStats {
    pub camera_count: usize,
    pub frame_count: usize,
    pub total_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    async fn buffer_with(camera_id: &str, times: &[i64]) -> FrameBuffer {
        let buffer = FrameBuffer::new(Duration::seconds(30));
        buffer.register(camera_id).await;
        for t in times {
            buffer
                .put(camera_id, at(*t), Bytes::from(format!("frame-{}", t)))
                .await
                .unwrap();
        }
        buffer
    }

    #[tokio::test]
    async fn test_put_last_write_wins() {
        let buffer = buffer_with("room", &[1_000]).await;
        buffer
            .put("room", at(1_000), Bytes::from_static(b"second"))
            .await
            .unwrap();

        assert_eq!(buffer.len("room").await.unwrap(), 1);
        let latest = buffer.latest("room").await.unwrap().unwrap();
        assert_eq!(latest.data, Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn test_latest_is_most_recent_capture() {
        let buffer = buffer_with("room", &[3_000, 1_000, 2_000]).await;
        let latest = buffer.latest("room").await.unwrap().unwrap();
        assert_eq!(latest.captured_at, at(3_000));
        assert_eq!(latest.file_name(), "3000.jpg");
    }

    #[tokio::test]
    async fn test_latest_empty() {
        let buffer = buffer_with("room", &[]).await;
        assert!(buffer.latest("room").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_range_between_is_exclusive_and_ordered() {
        let buffer = buffer_with("room", &[4_000, 1_000, 2_000, 3_000, 5_000]).await;
        let frames = buffer.range_between("room", at(1_000), at(5_000)).await.unwrap();
        let times: Vec<_> = frames.iter().map(|f| f.captured_at).collect();
        assert_eq!(times, vec![at(2_000), at(3_000), at(4_000)]);
    }

    #[tokio::test]
    async fn test_range_between_empty_window() {
        let buffer = buffer_with("room", &[1_000, 2_000]).await;
        assert!(buffer.range_between("room", at(2_000), at(2_000)).await.unwrap().is_empty());
        assert!(buffer.range_between("room", at(3_000), at(1_000)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_range_snapshot_survives_eviction() {
        let buffer = buffer_with("room", &[1_000, 2_000, 3_000]).await;
        let snapshot = buffer.range_between("room", at(0), at(10_000)).await.unwrap();
        buffer.evict_older_than("room", at(10_000)).await.unwrap();

        assert_eq!(snapshot.len(), 3);
        assert_eq!(buffer.len("room").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_evict_expired_removes_only_old_frames() {
        let buffer = buffer_with("room", &[0, 9_999, 10_000, 10_001, 40_000]).await;
        // retention 30s, now 40s -> cutoff 10s
        let removed = buffer.evict_expired("room", at(40_000)).await.unwrap();
        assert_eq!(removed, 2);

        let remaining: Vec<_> = buffer
            .range_between("room", at(-1), at(50_000))
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.captured_at)
            .collect();
        assert_eq!(remaining, vec![at(10_000), at(10_001), at(40_000)]);

        // Idempotent
        assert_eq!(buffer.evict_expired("room", at(40_000)).await.unwrap(), 0);
        assert_eq!(buffer.len("room").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unregistered_camera() {
        let buffer = FrameBuffer::new(Duration::seconds(30));
        let result = buffer.put("ghost", at(0), Bytes::new()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_submillisecond_writes_collapse() {
        let buffer = buffer_with("room", &[]).await;
        let t = at(1_000);
        buffer.put("room", t, Bytes::from_static(b"a")).await.unwrap();
        buffer
            .put("room", t + Duration::microseconds(400), Bytes::from_static(b"b"))
            .await
            .unwrap();
        assert_eq!(buffer.len("room").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stats_and_remove() {
        let buffer = buffer_with("room", &[1_000, 2_000]).await;
        buffer.register("door").await;

        let stats = buffer.stats().await;
        assert_eq!(stats.camera_count, 2);
        assert_eq!(stats.frame_count, 2);
        assert_eq!(stats.total_bytes, "frame-1000".len() + "frame-2000".len());

        assert!(buffer.remove("room").await);
        assert!(matches!(buffer.latest("room").await, Err(Error::NotFound(_))));
    }
}
