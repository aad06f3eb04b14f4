use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Media extensions picked up by both the sync loop and the bootstrap scan
pub const MEDIA_EXTENSIONS: [&str; 3] = ["mp4", "mkv", "avi"];

/// Whether a filename carries one of the recognized media extensions
pub fn is_media_file(filename: impl AsRef<Path>) -> bool {
    filename
        .as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            MEDIA_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// Whether a remote-supplied name can be used as a single path component
pub fn is_safe_path_component(component: &str) -> bool {
    !component.is_empty()
        && component != "."
        && component != ".."
        && !component.contains(['/', '\\', '\0'])
}

/// Dedup key: a filename is only unique per camera
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordingKey {
    pub camera_id: String,
    pub filename: String,
}

impl RecordingKey {
    pub fn new(camera_id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            filename: filename.into(),
        }
    }
}

impl fmt::Display for RecordingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.camera_id, self.filename)
    }
}

/// A media file known to the manager
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    /// Name assigned by the recorder (unique per camera)
    pub filename: String,
    /// Source camera
    pub camera_id: String,
    /// Current canonical location; points into the permanent tree once promoted
    pub local_path: PathBuf,
    /// When the file was fetched, or its mtime for files found at bootstrap
    pub downloaded_at: NaiveDateTime,
    /// Best-effort estimate of when the content was recorded
    pub recording_time: NaiveDateTime,
    /// Set once by promotion, never cleared
    pub is_permanent: bool,
}

impl Recording {
    pub fn key(&self) -> RecordingKey {
        RecordingKey::new(self.camera_id.clone(), self.filename.clone())
    }

    /// Age relative to `now`, measured from `downloaded_at`
    pub fn age(&self, now: NaiveDateTime) -> Duration {
        now.signed_duration_since(self.downloaded_at)
    }
}

/// Outstanding event for a camera; at most one per camera, last write wins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEventWindow {
    pub event_time: NaiveDateTime,
}

/// Pre/post event buffers applied to correlation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBuffers {
    pub pre_seconds: u64,
    pub post_seconds: u64,
}

impl EventBuffers {
    pub fn new(pre_seconds: u64, post_seconds: u64) -> Self {
        Self {
            pre_seconds,
            post_seconds,
        }
    }

    /// Window around `event_time` covered by these buffers
    pub fn window(&self, event_time: NaiveDateTime) -> EventWindow {
        EventWindow {
            start: event_time
                .checked_sub_signed(seconds(self.pre_seconds))
                .unwrap_or(NaiveDateTime::MIN),
            end: event_time
                .checked_add_signed(seconds(self.post_seconds))
                .unwrap_or(NaiveDateTime::MAX),
        }
    }
}

impl Default for EventBuffers {
    fn default() -> Self {
        Self::new(60, 60)
    }
}

/// Inclusive `[event_time - pre, event_time + post]` interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl EventWindow {
    pub fn contains(&self, time: NaiveDateTime) -> bool {
        self.start <= time && time <= self.end
    }

    /// Whether `now` is past the end of the window
    pub fn has_elapsed(&self, now: NaiveDateTime) -> bool {
        now > self.end
    }
}

/// Seconds as a chrono duration, saturating instead of overflowing
pub(crate) fn seconds(secs: u64) -> Duration {
    const MAX_SECS: u64 = (i64::MAX / 1_000) as u64;
    Duration::seconds(secs.min(MAX_SECS) as i64)
}
