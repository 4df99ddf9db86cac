//! Clip storage layout
//!
//! ```text
//! {root}/{camera}/{start}-{end}/{t_ms}.jpg   raw clip (image sequence)
//! {root}/{camera}/{start}-{end}.mp4          encoded clip
//! {root}/{camera}/{start}-{end}.jpg          thumbnail
//! {root}/{camera}/{start}-{end}.txt          concat script (scratch)
//! {root}/{camera}/{start}-{end}.mp4.part     encoder output in progress (scratch)
//! {root}/{camera}/{start}-{end}.tmp/         raw clip being copied (scratch)
//! ```

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

pub const VIDEO_EXT: &str = "mp4";
pub const THUMBNAIL_EXT: &str = "jpg";
pub const SCRIPT_EXT: &str = "txt";
pub const PARTIAL_EXT: &str = "part";
pub const STAGING_EXT: &str = "tmp";

/// Reject names that could escape the recordings root
pub fn validate_component(kind: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid {} name: {:?}", kind, name)))
    }
}

/// `(start_ms, end_ms)` parsed from a `"{start}-{end}"` key
pub fn parse_key(key: &str) -> Option<(i64, i64)> {
    let (start, end) = key.split_once('-')?;
    let start = start.parse::<i64>().ok()?;
    let end = end.parse::<i64>().ok()?;
    (start <= end).then_some((start, end))
}

/// Strip a trailing `.mp4` from a clip name, yielding its key
pub fn key_from_name(name: &str) -> Result<&str> {
    let key = name.strip_suffix(".mp4").unwrap_or(name);
    if parse_key(key).is_some() {
        Ok(key)
    } else {
        Err(Error::Validation(format!("invalid clip name: {:?}", name)))
    }
}

/// Paths of one camera's recordings directory
#[derive(Debug, Clone)]
pub struct CameraDir {
    root: PathBuf,
}

impl CameraDir {
    pub fn new(recordings_root: &Path, camera_id: &str) -> Result<Self> {
        validate_component("camera", camera_id)?;
        Ok(Self {
            root: recordings_root.join(camera_id),
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub fn video(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}", key, VIDEO_EXT))
    }

    /// Raw clip directory while its frames are still being copied
    pub fn staging_dir(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}", key, STAGING_EXT))
    }

    pub fn partial_video(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}.{}", key, VIDEO_EXT, PARTIAL_EXT))
    }

    pub fn thumbnail(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}", key, THUMBNAIL_EXT))
    }

    pub fn script(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}", key, SCRIPT_EXT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("100-200"), Some((100, 200)));
        assert_eq!(parse_key("1700000000000-1700000010000"), Some((1_700_000_000_000, 1_700_000_010_000)));
        assert_eq!(parse_key("200-100"), None);
        assert_eq!(parse_key("abc-200"), None);
        assert_eq!(parse_key("100"), None);
    }

    #[test]
    fn test_key_from_name() {
        assert_eq!(key_from_name("100-200").unwrap(), "100-200");
        assert_eq!(key_from_name("100-200.mp4").unwrap(), "100-200");
        assert!(key_from_name("100-200.jpg").is_err());
        assert!(key_from_name("../etc").is_err());
    }

    #[test]
    fn test_validate_component() {
        assert!(validate_component("camera", "room").is_ok());
        assert!(validate_component("camera", "").is_err());
        assert!(validate_component("camera", "..").is_err());
        assert!(validate_component("camera", "a/b").is_err());
    }

    #[test]
    fn test_camera_dir_layout() {
        let dir = CameraDir::new(Path::new("/rec"), "room").unwrap();
        assert_eq!(dir.raw_dir("1-2"), PathBuf::from("/rec/room/1-2"));
        assert_eq!(dir.video("1-2"), PathBuf::from("/rec/room/1-2.mp4"));
        assert_eq!(dir.partial_video("1-2"), PathBuf::from("/rec/room/1-2.mp4.part"));
        assert_eq!(dir.thumbnail("1-2"), PathBuf::from("/rec/room/1-2.jpg"));
        assert_eq!(dir.script("1-2"), PathBuf::from("/rec/room/1-2.txt"));
        assert_eq!(dir.staging_dir("1-2"), PathBuf::from("/rec/room/1-2.tmp"));
        assert!(CameraDir::new(Path::new("/rec"), "../x").is_err());
    }
}
