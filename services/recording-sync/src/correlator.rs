//! Event correlation: decides which recordings belong to an event.
//!
//! An event opens a pending window for its camera. Recordings already in
//! the index are checked right away; recordings downloaded later are
//! checked by [`EventCorrelator::on_recording_discovered`] until the window
//! has elapsed.

use crate::clock::Clock;
use crate::index::RecordingIndex;
use crate::promoter::{Promoter, Promotion};
use crate::recording::{seconds, EventBuffers, PendingEventWindow, Recording};
use chrono::NaiveDateTime;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Result of handling an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventOutcome {
    pub camera_id: String,
    pub event_time: NaiveDateTime,
    /// Recordings promoted immediately
    pub promoted: usize,
}

/// Correlates events with recordings and triggers promotion
pub struct EventCorrelator {
    index: Arc<RecordingIndex>,
    promoter: Arc<Promoter>,
    clock: Arc<dyn Clock>,
    buffers: RwLock<EventBuffers>,
    /// Recordings downloaded within this span before an event are promoted
    /// even when their recording time misses the window. Heuristic; may
    /// over-match. `None` disables it.
    recent_fallback: Option<chrono::Duration>,
}

impl EventCorrelator {
    pub fn new(
        index: Arc<RecordingIndex>,
        promoter: Arc<Promoter>,
        clock: Arc<dyn Clock>,
        buffers: EventBuffers,
        recent_fallback_secs: u64,
    ) -> Self {
        Self {
            index,
            promoter,
            clock,
            buffers: RwLock::new(buffers),
            recent_fallback: (recent_fallback_secs > 0).then(|| seconds(recent_fallback_secs)),
        }
    }

    pub fn buffers(&self) -> EventBuffers {
        *self.buffers.read()
    }

    /// Replace the buffers used by all later correlation decisions
    pub fn set_buffers(&self, buffers: EventBuffers) {
        *self.buffers.write() = buffers;
        info!(
            pre_seconds = buffers.pre_seconds,
            post_seconds = buffers.post_seconds,
            "Event buffers updated"
        );
    }

    /// Handle an event for `camera_id` happening now.
    ///
    /// Replaces the camera's pending window and promotes every known temp
    /// recording inside it, plus recently downloaded ones when the fallback
    /// is enabled.
    #[instrument(skip(self))]
    pub async fn trigger_event(&self, camera_id: &str) -> EventOutcome {
        let event_time = self.clock.now();
        self.index
            .set_pending(camera_id, PendingEventWindow { event_time });
        metrics::counter!("recording_sync.events.triggered").increment(1);
        info!(camera_id, event_time = %event_time.format("%H:%M:%S"), "Event marked");

        let window = self.buffers().window(event_time);
        let recent_since = self
            .recent_fallback
            .and_then(|span| event_time.checked_sub_signed(span));

        let candidates = self.index.temp_recordings_matching(camera_id, |rec| {
            window.contains(rec.recording_time)
                || recent_since.is_some_and(|since| rec.downloaded_at >= since)
        });

        let mut promoted = 0;
        for key in &candidates {
            if let Promotion::Promoted(_) = self.promoter.promote(key, event_time).await {
                promoted += 1;
            }
        }

        if promoted > 0 {
            info!(camera_id, promoted, "Marked recordings as permanent");
        } else {
            let available: Vec<String> = self
                .index
                .temp_recordings_matching(camera_id, |_| true)
                .into_iter()
                .take(5)
                .map(|key| key.filename)
                .collect();
            if !available.is_empty() {
                debug!(camera_id, ?available, "No recordings matched the event window");
            }
        }

        EventOutcome {
            camera_id: camera_id.to_string(),
            event_time,
            promoted,
        }
    }

    /// Check a freshly downloaded recording against its camera's pending
    /// window and promote it if it falls inside.
    ///
    /// The window is discarded once `now` is past its end.
    pub async fn on_recording_discovered(&self, recording: &Recording) -> Option<Promotion> {
        let pending = self.index.pending(&recording.camera_id)?;
        let window = self.buffers().window(pending.event_time);

        let outcome = if window.contains(recording.recording_time) {
            Some(self.promoter.promote(&recording.key(), pending.event_time).await)
        } else {
            None
        };

        if window.has_elapsed(self.clock.now())
            && self.index.clear_pending_if(&recording.camera_id, pending)
        {
            debug!(camera_id = %recording.camera_id, "Pending event window closed");
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::recording::RecordingKey;
    use chrono::{Duration, NaiveDate};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    struct Fixture {
        _dir: TempDir,
        temp: PathBuf,
        perm: PathBuf,
        index: Arc<RecordingIndex>,
        clock: Arc<ManualClock>,
        correlator: EventCorrelator,
    }

    fn fixture(now: NaiveDateTime, fallback_secs: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("temp");
        let perm = dir.path().join("perm");
        let index = Arc::new(RecordingIndex::new());
        let clock = Arc::new(ManualClock::new(now));
        let promoter = Arc::new(Promoter::new(
            index.clone(),
            perm.clone(),
            std::time::Duration::from_secs(5),
        ));
        let correlator = EventCorrelator::new(
            index.clone(),
            promoter,
            clock.clone(),
            EventBuffers::new(60, 60),
            fallback_secs,
        );
        Fixture {
            _dir: dir,
            temp,
            perm,
            index,
            clock,
            correlator,
        }
    }

    fn add_temp(
        fx: &Fixture,
        filename: &str,
        recording_time: NaiveDateTime,
        downloaded_at: NaiveDateTime,
    ) -> Recording {
        let path = fx.temp.join("cam1").join(filename);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"video").unwrap();
        let rec = Recording {
            filename: filename.to_string(),
            camera_id: "cam1".to_string(),
            local_path: path,
            downloaded_at,
            recording_time,
            is_permanent: false,
        };
        fx.index.register(rec.clone());
        rec
    }

    fn is_permanent(fx: &Fixture, filename: &str) -> bool {
        fx.index
            .get(&RecordingKey::new("cam1", filename))
            .unwrap()
            .is_permanent
    }

    #[tokio::test]
    async fn test_event_promotes_recording_inside_window() {
        let event_time = at(14, 30, 45);
        let fx = fixture(event_time, 0);
        add_temp(&fx, "2024-01-15T14-30-22.mp4", at(14, 30, 22), at(14, 0, 0));

        let outcome = fx.correlator.trigger_event("cam1").await;

        assert_eq!(outcome.promoted, 1);
        assert_eq!(outcome.event_time, event_time);
        assert!(fx
            .perm
            .join("cam1")
            .join("20240115_143045")
            .join("2024-01-15T14-30-22.mp4")
            .exists());
        assert!(fx.temp.join("cam1").join("2024-01-15T14-30-22.mp4").exists());
        assert_eq!(fx.index.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_recording_outside_window_not_promoted_without_fallback() {
        let event_time = at(14, 30, 45);
        let fx = fixture(event_time, 0);
        add_temp(&fx, "inside.mp4", event_time - Duration::seconds(30), at(14, 30, 0));
        add_temp(&fx, "outside.mp4", event_time - Duration::seconds(90), at(14, 30, 0));

        let outcome = fx.correlator.trigger_event("cam1").await;

        assert_eq!(outcome.promoted, 1);
        assert!(is_permanent(&fx, "inside.mp4"));
        assert!(!is_permanent(&fx, "outside.mp4"));
    }

    #[tokio::test]
    async fn test_recent_download_fallback_promotes_outside_window() {
        let event_time = at(14, 30, 45);
        let fx = fixture(event_time, 300);
        add_temp(&fx, "recent.mp4", event_time - Duration::seconds(90), event_time - Duration::minutes(4));
        add_temp(&fx, "stale.mp4", event_time - Duration::seconds(90), event_time - Duration::minutes(6));

        let outcome = fx.correlator.trigger_event("cam1").await;

        assert_eq!(outcome.promoted, 1);
        assert!(is_permanent(&fx, "recent.mp4"));
        assert!(!is_permanent(&fx, "stale.mp4"));
    }

    #[tokio::test]
    async fn test_other_cameras_untouched() {
        let event_time = at(14, 30, 45);
        let fx = fixture(event_time, 300);
        add_temp(&fx, "a.mp4", event_time, event_time);

        let outcome = fx.correlator.trigger_event("cam2").await;
        assert_eq!(outcome.promoted, 0);
        assert!(!is_permanent(&fx, "a.mp4"));
    }

    #[tokio::test]
    async fn test_discovered_recording_uses_pending_window() {
        let event_time = at(14, 30, 45);
        let fx = fixture(event_time, 0);
        fx.correlator.trigger_event("cam1").await;

        // Arrives 30s later, recorded 20s after the event
        fx.clock.advance(Duration::seconds(30));
        let rec = add_temp(&fx, "after.mp4", event_time + Duration::seconds(20), fx.clock.now());

        let outcome = fx.correlator.on_recording_discovered(&rec).await;
        assert!(matches!(outcome, Some(Promotion::Promoted(_))));
        // Window still open
        assert_eq!(fx.index.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_pending_window_discarded_after_post_buffer() {
        let event_time = at(14, 30, 45);
        let fx = fixture(event_time, 0);
        fx.correlator.trigger_event("cam1").await;

        fx.clock.advance(Duration::seconds(120));
        let rec = add_temp(&fx, "late.mp4", event_time + Duration::seconds(100), fx.clock.now());

        assert_eq!(fx.correlator.on_recording_discovered(&rec).await, None);
        assert!(!is_permanent(&fx, "late.mp4"));
        assert_eq!(fx.index.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_buffer_changes_apply_to_later_decisions() {
        let event_time = at(14, 30, 45);
        let fx = fixture(event_time, 0);
        add_temp(&fx, "early.mp4", event_time - Duration::seconds(90), at(14, 0, 0));

        fx.correlator.set_buffers(EventBuffers::new(120, 60));
        assert_eq!(fx.correlator.buffers(), EventBuffers::new(120, 60));

        let outcome = fx.correlator.trigger_event("cam1").await;
        assert_eq!(outcome.promoted, 1);
    }

    #[tokio::test]
    async fn test_new_event_replaces_pending_window() {
        let fx = fixture(at(14, 30, 45), 0);
        fx.correlator.trigger_event("cam1").await;
        fx.clock.advance(Duration::seconds(10));
        fx.correlator.trigger_event("cam1").await;

        assert_eq!(fx.index.pending_count(), 1);
        assert_eq!(
            fx.index.pending("cam1").unwrap().event_time,
            at(14, 30, 55)
        );
    }
}
