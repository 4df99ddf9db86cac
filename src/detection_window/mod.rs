//! DetectionWindow - Per-Camera Detection Debounce
//!
//! ## Responsibilities
//!
//! - Merge closely spaced detections into one recording window
//! - Decide clip boundaries (window +/- padding)
//! - Cap a window's span at half the retention horizon so its padded
//!   frames are still buffered when the clip is materialized
//!
//! ## State machine
//!
//! ```text
//! Idle --detection(t)--> Active(t, t)
//! Active(f, l) --detection(t), t-l > padding or t-f > retention/2--> emit, Active(t, t)
//! Active(f, l) --detection(t)--> Active(f, max(l, t))
//! Active(f, l) --tick(now), now-l > padding--> emit, Idle      (idle flush)
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Clip boundaries decided by a flushed window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClipRequest {
    pub camera_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ClipRequest {
    /// Artifact key `"{start_ms}-{end_ms}"`
    pub fn key(&self) -> String {
        clip_key(self.start, self.end)
    }
}

/// Artifact key for a window
pub fn clip_key(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!("{}-{}", start.timestamp_millis(), end.timestamp_millis())
}

/// Window state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Idle,
    Active {
        first_seen: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    },
}

/// Debounce parameters
#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    /// Padding added before/after a window; also the debounce gap
    pub padding: Duration,
    /// Frame retention horizon of the buffer feeding the clip
    pub retention: Duration,
    /// Close a window on ticks once no detection arrived for `padding`
    pub idle_flush: bool,
}

/// Per-camera debounce state machine
#[derive(Debug)]
pub struct DetectionWindow {
    camera_id: String,
    config: WindowConfig,
    state: WindowState,
}

impl DetectionWindow {
    pub fn new(camera_id: impl Into<String>, config: WindowConfig) -> Self {
        Self {
            camera_id: camera_id.into(),
            config,
            state: WindowState::Idle,
        }
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    /// Feed a detection observed at `t`
    pub fn on_detection(&mut self, t: DateTime<Utc>) -> Option<ClipRequest> {
        match self.state {
            WindowState::Idle => {
                tracing::debug!(camera_id = %self.camera_id, at = %t, "Detection window opened");
                self.state = WindowState::Active {
                    first_seen: t,
                    last_seen: t,
                };
                None
            }
            WindowState::Active {
                first_seen,
                last_seen,
            } => {
                let gap_exceeded = t - last_seen > self.config.padding;
                let span_exceeded = t - first_seen > self.config.retention / 2;

                if gap_exceeded || span_exceeded {
                    let request = self.flush(first_seen, last_seen);
                    tracing::debug!(
                        camera_id = %self.camera_id,
                        gap_exceeded = gap_exceeded,
                        span_exceeded = span_exceeded,
                        "Detection window flushed, new window opened"
                    );
                    self.state = WindowState::Active {
                        first_seen: t,
                        last_seen: t,
                    };
                    Some(request)
                } else {
                    self.state = WindowState::Active {
                        first_seen,
                        last_seen: last_seen.max(t),
                    };
                    None
                }
            }
        }
    }

    /// Poll cycle without a detection. Flushes a window that went quiet
    /// for longer than `padding` when idle flush is enabled.
    pub fn on_tick(&mut self, now: DateTime<Utc>) -> Option<ClipRequest> {
        if !self.config.idle_flush {
            return None;
        }

        match self.state {
            WindowState::Active {
                first_seen,
                last_seen,
            } if now - last_seen > self.config.padding => {
                let request = self.flush(first_seen, last_seen);
                self.state = WindowState::Idle;
                tracing::debug!(camera_id = %self.camera_id, "Detection window closed (idle)");
                Some(request)
            }
            _ => None,
        }
    }

    fn flush(&self, first_seen: DateTime<Utc>, last_seen: DateTime<Utc>) -> ClipRequest {
        ClipRequest {
            camera_id: self.camera_id.clone(),
            start: first_seen - self.config.padding,
            end: last_seen + self.config.padding,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn window(idle_flush: bool) -> DetectionWindow {
        DetectionWindow::new(
            "room",
            WindowConfig {
                padding: Duration::seconds(5),
                retention: Duration::seconds(30),
                idle_flush,
            },
        )
    }

    fn feed(window: &mut DetectionWindow, times: &[i64]) -> Vec<ClipRequest> {
        times
            .iter()
            .filter_map(|t| window.on_detection(at(*t)))
            .collect()
    }

    #[test]
    fn test_first_detection_opens_window() {
        let mut w = window(false);
        assert!(w.on_detection(at(0)).is_none());
        assert_eq!(
            w.state(),
            WindowState::Active {
                first_seen: at(0),
                last_seen: at(0)
            }
        );
    }

    #[test]
    fn test_close_detections_merge_into_one_clip() {
        let mut w = window(false);
        // every gap <= padding, total span <= retention/2
        let emitted = feed(&mut w, &[0, 5, 9, 12, 15]);
        assert!(emitted.is_empty());

        // a far detection flushes the merged window
        let emitted = feed(&mut w, &[100]);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].start, at(-5));
        assert_eq!(emitted[0].end, at(20));
        assert_eq!(emitted[0].camera_id, "room");
    }

    #[test]
    fn test_gap_equal_to_padding_does_not_split() {
        let mut w = window(false);
        assert!(feed(&mut w, &[0, 5, 10]).is_empty());
    }

    #[test]
    fn test_gap_greater_than_padding_splits() {
        let mut w = window(false);
        let emitted = feed(&mut w, &[0, 2, 8]);
        assert_eq!(emitted.len(), 1);
        assert_eq!((emitted[0].start, emitted[0].end), (at(-5), at(7)));
        assert_eq!(
            w.state(),
            WindowState::Active {
                first_seen: at(8),
                last_seen: at(8)
            }
        );
    }

    #[test]
    fn test_long_window_is_force_flushed() {
        let mut w = window(false);
        // gaps of 4s never exceed padding, but span passes retention/2 = 15s
        let emitted = feed(&mut w, &[0, 4, 8, 12, 16]);
        assert_eq!(emitted.len(), 1);
        assert_eq!((emitted[0].start, emitted[0].end), (at(-5), at(17)));
        assert_eq!(
            w.state(),
            WindowState::Active {
                first_seen: at(16),
                last_seen: at(16)
            }
        );
    }

    #[test]
    fn test_out_of_order_detection_keeps_last_seen_monotonic() {
        let mut w = window(false);
        feed(&mut w, &[0, 4, 2]);
        assert_eq!(
            w.state(),
            WindowState::Active {
                first_seen: at(0),
                last_seen: at(4)
            }
        );
    }

    #[test]
    fn test_tick_without_idle_flush_never_closes() {
        let mut w = window(false);
        feed(&mut w, &[0]);
        assert!(w.on_tick(at(1_000)).is_none());
        assert!(matches!(w.state(), WindowState::Active { .. }));
    }

    #[test]
    fn test_idle_flush_closes_quiet_window() {
        let mut w = window(true);
        feed(&mut w, &[0, 3]);

        assert!(w.on_tick(at(8)).is_none());
        let request = w.on_tick(at(9)).unwrap();
        assert_eq!((request.start, request.end), (at(-5), at(8)));
        assert_eq!(w.state(), WindowState::Idle);

        // idle window stays idle
        assert!(w.on_tick(at(100)).is_none());
    }

    #[test]
    fn test_clip_key_uses_milliseconds() {
        let request = ClipRequest {
            camera_id: "room".into(),
            start: DateTime::from_timestamp_millis(100).unwrap(),
            end: DateTime::from_timestamp_millis(200).unwrap(),
        };
        assert_eq!(request.key(), "100-200");
    }
}
