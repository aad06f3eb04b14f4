use crate::clock::Clock;
use crate::files;
use crate::index::RecordingIndex;
use crate::recording::seconds;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Outcome of one cleanup cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub deleted: usize,
    pub failed: usize,
    pub dirs_removed: usize,
}

/// Deletes temp recordings older than the retention period.
///
/// Permanent recordings are never touched.
pub struct Reaper {
    index: Arc<RecordingIndex>,
    clock: Arc<dyn Clock>,
    temp_dir: PathBuf,
    retention: chrono::Duration,
    file_op_timeout: Duration,
}

impl Reaper {
    pub fn new(
        index: Arc<RecordingIndex>,
        clock: Arc<dyn Clock>,
        temp_dir: PathBuf,
        retention: Duration,
        file_op_timeout: Duration,
    ) -> Self {
        Self {
            index,
            clock,
            temp_dir,
            retention: seconds(retention.as_secs()),
            file_op_timeout,
        }
    }

    /// Run cleanup cycles every `interval` until `shutdown` is cancelled
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        info!(
            interval_secs = interval.as_secs(),
            retention_secs = self.retention.num_seconds(),
            "Starting cleanup loop"
        );

        while !shutdown.is_cancelled() {
            self.reap_once().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Cleanup loop stopped");
    }

    /// Delete every expired temp recording and leftover temp copy.
    ///
    /// A recording whose file cannot be deleted is put back in the index
    /// and tried again next cycle.
    #[instrument(skip(self))]
    pub async fn reap_once(&self) -> ReapReport {
        let expired = self.index.take_expired(self.clock.now(), self.retention);
        let mut report = ReapReport::default();

        for recording in expired.recordings {
            if self.delete(&recording.local_path).await {
                report.deleted += 1;
            } else {
                report.failed += 1;
                self.index.restore(recording);
            }
        }

        for orphan in expired.orphans {
            if self.delete(&orphan.path).await {
                report.deleted += 1;
            } else {
                report.failed += 1;
                self.index.restore_orphan(orphan);
            }
        }

        let temp_dir = self.temp_dir.clone();
        match files::run_blocking(&self.temp_dir, self.file_op_timeout, move || {
            files::remove_empty_subdirs(&temp_dir)
        })
        .await
        {
            Ok(removed) => report.dirs_removed = removed,
            Err(e) => error!(error = %e, "Failed to prune empty temp directories"),
        }

        metrics::counter!("recording_sync.reaper.deleted").increment(report.deleted as u64);
        metrics::counter!("recording_sync.reaper.failed").increment(report.failed as u64);

        if report.deleted > 0 || report.failed > 0 {
            info!(
                deleted = report.deleted,
                failed = report.failed,
                dirs_removed = report.dirs_removed,
                "Cleaned up old recordings"
            );
        }

        report
    }

    async fn delete(&self, path: &Path) -> bool {
        let target = path.to_path_buf();
        match files::run_blocking(path, self.file_op_timeout, move || {
            files::remove_file_if_exists(&target)
        })
        .await
        {
            Ok(_) => {
                debug!(path = %path.display(), "Deleted expired recording");
                true
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to delete expired recording");
                false
            }
        }
    }
}
