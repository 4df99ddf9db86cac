//! camclip - Detection-Triggered Camera Clip Recorder
//!
//! ## Architecture
//!
//! 1. FrameBuffer - Recent frames per camera, evicted by age
//! 2. FrameSource - MJPEG stream ingest into the buffer
//! 3. Classifier - Subject detection adapter
//! 4. DetectionWindow - Debounces detections into clip boundaries
//! 5. RecordingOrchestrator - Camera registry and detection polling
//! 6. ClipMaterializer - Copies a clip's frames out of the buffer
//! 7. ClipCatalog - Lists clips, encodes raw clips on first read
//! 8. VideoEncoder - Image sequence to video (ffmpeg)
//! 9. RangeStreamer - Byte-range file delivery
//! 10. WebAPI - REST API endpoints
//!
//! Frames flow camera -> FrameBuffer -> Classifier -> DetectionWindow ->
//! ClipMaterializer -> disk, and clips are read back through ClipCatalog
//! and RangeStreamer.

pub mod classifier;
pub mod clip_catalog;
pub mod clip_locks;
pub mod clip_materializer;
pub mod detection_window;
pub mod frame_buffer;
pub mod frame_source;
pub mod range_streamer;
pub mod recording_orchestrator;
pub mod scheduler;
pub mod storage;
pub mod video_encoder;
pub mod web_api;
pub mod models;
pub mod error;
pub mod state;

pub use error::{Error, Result};
pub use state::AppState;
