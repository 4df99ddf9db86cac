//! FrameSource - MJPEG Stream Ingest
//!
//! ## Responsibilities
//!
//! - Pull a camera's MJPEG stream over HTTP
//! - Split the byte stream into JPEG frames (SOI `FFD8` .. EOI `FFD9`)
//! - Push each frame into the FrameBuffer stamped with its arrival time
//! - Reconnect after a delay when the stream breaks

use crate::error::{Error, Result};
use crate::frame_buffer::FrameBuffer;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Default reconnect delay after a broken stream
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Upper bound for a single frame; larger garbage is discarded
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Incremental JPEG splitter for multipart MJPEG bodies
#[derive(Debug, Default)]
pub struct MjpegSplitter {
    buf: Vec<u8>,
    /// Offset where the EOI search resumes
    scan_from: usize,
    in_frame: bool,
}

impl MjpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every frame completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            if !self.in_frame {
                match find(&self.buf, &SOI, 0) {
                    Some(start) => {
                        self.buf.drain(..start);
                        self.in_frame = true;
                        self.scan_from = SOI.len();
                    }
                    None => {
                        // keep a trailing 0xFF, it may begin a marker
                        let keep = usize::from(self.buf.last() == Some(&0xFF));
                        let len = self.buf.len();
                        self.buf.drain(..len - keep);
                        break;
                    }
                }
            }

            match find(&self.buf, &EOI, self.scan_from) {
                Some(end) => {
                    let frame: Vec<u8> = self.buf.drain(..end + EOI.len()).collect();
                    frames.push(Bytes::from(frame));
                    self.in_frame = false;
                    self.scan_from = 0;
                }
                None => {
                    if self.buf.len() > MAX_FRAME_BYTES {
                        tracing::warn!(size = self.buf.len(), "Discarding oversized MJPEG frame");
                        self.buf.clear();
                        self.in_frame = false;
                        self.scan_from = 0;
                    } else {
                        // next search may start one byte early to catch a split marker
                        self.scan_from = self.buf.len().saturating_sub(1).max(SOI.len());
                    }
                    break;
                }
            }
        }

        frames
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    if haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// `{cam_url}?action=stream` unless the URL already carries a query
pub fn stream_url(cam_url: &str) -> String {
    if cam_url.contains('?') {
        cam_url.to_string()
    } else {
        format!("{}?action=stream", cam_url)
    }
}

/// MJPEG HTTP source feeding one camera's buffer
pub struct MjpegSource {
    client: reqwest::Client,
    camera_id: String,
    url: String,
    frame_buffer: Arc<FrameBuffer>,
    reconnect_delay: Duration,
}

impl MjpegSource {
    pub fn new(
        camera_id: impl Into<String>,
        cam_url: &str,
        frame_buffer: Arc<FrameBuffer>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("stream client: {}", e)))?;

        Ok(Self {
            client,
            camera_id: camera_id.into(),
            url: stream_url(cam_url),
            frame_buffer,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        })
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Run until `token` is cancelled, reconnecting on errors
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(camera_id = %self.camera_id, url = %self.url, "Recording stream");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = self.run_once() => {
                        match result {
                            Ok(()) => tracing::warn!(camera_id = %self.camera_id, "Stream ended"),
                            Err(e) => tracing::warn!(camera_id = %self.camera_id, error = %e, "Stream broken"),
                        }
                    }
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.reconnect_delay) => {
                        tracing::info!(camera_id = %self.camera_id, "Reconnecting stream");
                    }
                }
            }

            tracing::info!(camera_id = %self.camera_id, "Stream source stopped");
        })
    }

    async fn run_once(&self) -> Result<()> {
        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Stream(format!("{} returned {}", self.url, resp.status())));
        }

        let mut splitter = MjpegSplitter::new();
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for frame in splitter.push(&chunk) {
                self.frame_buffer.put(&self.camera_id, Utc::now(), frame).await?;
            }
        }

        Ok(())
    }
}
