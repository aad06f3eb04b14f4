use crate::files;
use crate::index::RecordingIndex;
use crate::recording::{Recording, RecordingKey};
use chrono::NaiveDateTime;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

/// Folder name of an event under `permanent_dir/{camera_id}/`
pub const EVENT_FOLDER_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Result of a promotion attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Promotion {
    /// Copied to the permanent tree at the given path
    Promoted(PathBuf),
    /// Already permanent, promotion in flight elsewhere, or unknown key
    Skipped,
    /// Copy failed; state unchanged so a later event or sync may retry
    Failed,
}

/// Copies recordings from temporary to permanent storage exactly once
pub struct Promoter {
    index: Arc<RecordingIndex>,
    permanent_dir: PathBuf,
    file_op_timeout: Duration,
}

impl Promoter {
    pub fn new(index: Arc<RecordingIndex>, permanent_dir: PathBuf, file_op_timeout: Duration) -> Self {
        Self {
            index,
            permanent_dir,
            file_op_timeout,
        }
    }

    /// Permanent location of `recording` for an event at `event_time`
    pub fn destination(&self, recording: &Recording, event_time: NaiveDateTime) -> PathBuf {
        let basename = recording
            .local_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&recording.filename));

        self.permanent_dir
            .join(&recording.camera_id)
            .join(event_time.format(EVENT_FOLDER_FORMAT).to_string())
            .join(basename)
    }

    /// Promote a recording for the event at `event_time`.
    ///
    /// The temp copy stays in place. Concurrent calls for the same key
    /// result in a single copy; the losers return [`Promotion::Skipped`].
    #[instrument(skip(self), fields(recording = %key))]
    pub async fn promote(&self, key: &RecordingKey, event_time: NaiveDateTime) -> Promotion {
        let Some(recording) = self.index.claim_promotion(key) else {
            debug!("Nothing to promote");
            return Promotion::Skipped;
        };

        let destination = self.destination(&recording, event_time);
        let source = recording.local_path.clone();

        let copy = {
            let (src, dst) = (source.clone(), destination.clone());
            files::run_blocking(&destination, self.file_op_timeout, move || {
                files::copy_preserving(&src, &dst)
            })
            .await
        };

        match copy {
            Ok(()) => {
                if self.index.complete_promotion(key, destination.clone()) {
                    info!(
                        camera_id = %recording.camera_id,
                        destination = %destination.display(),
                        "Saved to permanent storage"
                    );
                    metrics::counter!("recording_sync.promotions.succeeded").increment(1);
                    Promotion::Promoted(destination)
                } else {
                    Promotion::Skipped
                }
            }
            Err(e) => {
                self.index.release_promotion(key);
                error!(
                    source = %source.display(),
                    error = %e,
                    "Failed to copy recording to permanent storage"
                );
                metrics::counter!("recording_sync.promotions.failed").increment(1);
                Promotion::Failed
            }
        }
    }
}
