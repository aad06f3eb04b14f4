use crate::clock::Clock;
use crate::correlator::EventCorrelator;
use crate::files::{self, StorageError};
use crate::index::RecordingIndex;
use crate::promoter::Promotion;
use crate::recorder_client::{CatalogEntry, RecorderClient, RecorderError};
use crate::recording::{is_media_file, is_safe_path_component, Recording, RecordingKey};
use crate::timestamp::resolve_recording_time;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Suffix of a download that has not completed yet
pub const DOWNLOAD_SUFFIX: &str = "part";

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Outcome of one sync cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub cameras: usize,
    pub downloaded: usize,
    pub failed: usize,
    /// Downloads promoted right away because of a pending event
    pub promoted: usize,
}

/// Mirrors the recorder's catalog into `temp_dir/{camera_id}/`
pub struct Syncer {
    client: Arc<dyn RecorderClient>,
    index: Arc<RecordingIndex>,
    correlator: Arc<EventCorrelator>,
    clock: Arc<dyn Clock>,
    temp_dir: PathBuf,
    download_timeout: Duration,
    file_op_timeout: Duration,
}

impl Syncer {
    pub fn new(
        client: Arc<dyn RecorderClient>,
        index: Arc<RecordingIndex>,
        correlator: Arc<EventCorrelator>,
        clock: Arc<dyn Clock>,
        temp_dir: PathBuf,
        download_timeout: Duration,
        file_op_timeout: Duration,
    ) -> Self {
        Self {
            client,
            index,
            correlator,
            clock,
            temp_dir,
            download_timeout,
            file_op_timeout,
        }
    }

    /// Run sync cycles every `interval` until `shutdown` is cancelled
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Starting sync loop");

        while !shutdown.is_cancelled() {
            self.sync_once().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Sync loop stopped");
    }

    /// Run one pass over every camera and download everything not yet known.
    ///
    /// Failures are isolated per camera and per file; nothing here aborts
    /// the cycle.
    #[instrument(skip(self))]
    pub async fn sync_once(&self) -> SyncReport {
        let started = Instant::now();
        let mut report = SyncReport::default();

        let cameras = match self.client.list_cameras().await {
            Ok(cameras) => cameras,
            Err(e) => {
                warn!(error = %e, "Failed to list cameras");
                metrics::counter!("recording_sync.catalog.failed").increment(1);
                return report;
            }
        };

        for camera_id in cameras {
            if !is_safe_path_component(&camera_id) {
                warn!(camera_id = %camera_id, "Skipping camera with unsafe identifier");
                continue;
            }
            report.cameras += 1;
            self.sync_camera(&camera_id, &mut report).await;
        }

        metrics::histogram!("recording_sync.sync.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        if report.downloaded > 0 || report.failed > 0 {
            info!(
                cameras = report.cameras,
                downloaded = report.downloaded,
                failed = report.failed,
                promoted = report.promoted,
                "Sync cycle complete"
            );
        }

        report
    }

    async fn sync_camera(&self, camera_id: &str, report: &mut SyncReport) {
        let entries = match self.client.list_recordings(camera_id).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(camera_id, error = %e, "Failed to list recordings");
                metrics::counter!("recording_sync.catalog.failed").increment(1);
                return;
            }
        };

        for entry in entries {
            if !is_safe_path_component(&entry.filename) || !is_media_file(&entry.filename) {
                debug!(camera_id, filename = %entry.filename, "Ignoring catalog entry");
                continue;
            }
            if self.index.is_known(&RecordingKey::new(camera_id, &entry.filename)) {
                continue;
            }

            match self.download(camera_id, &entry).await {
                Ok(recording) => {
                    report.downloaded += 1;
                    metrics::counter!("recording_sync.downloads.succeeded").increment(1);

                    if !self.index.register(recording.clone()) {
                        continue;
                    }
                    debug!(
                        camera_id,
                        filename = %recording.filename,
                        recording_time = %recording.recording_time,
                        "Downloaded recording"
                    );

                    if let Some(Promotion::Promoted(_)) =
                        self.correlator.on_recording_discovered(&recording).await
                    {
                        report.promoted += 1;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    metrics::counter!("recording_sync.downloads.failed").increment(1);
                    match e {
                        DownloadError::Recorder(e) => {
                            warn!(camera_id, filename = %entry.filename, error = %e, "Failed to download recording")
                        }
                        DownloadError::Storage(e) => {
                            error!(camera_id, filename = %entry.filename, error = %e, "Failed to store downloaded recording")
                        }
                    }
                }
            }
        }
    }

    /// Fetch one catalog entry into the temp tree
    async fn download(&self, camera_id: &str, entry: &CatalogEntry) -> Result<Recording, DownloadError> {
        let camera_dir = self.temp_dir.join(camera_id);
        create_camera_dir(&camera_dir).await?;

        let destination = camera_dir.join(&entry.filename);
        let partial = download_path(&destination);

        let mut fetched = self.fetch(camera_id, &entry.filename, &partial).await;
        if matches!(&fetched, Err(RecorderError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound) {
            // Cleanup pruned the camera directory between creation and write
            debug!(camera_id, filename = %entry.filename, "Camera directory vanished, retrying download");
            self.discard_partial(partial.clone()).await;
            create_camera_dir(&camera_dir).await?;
            fetched = self.fetch(camera_id, &entry.filename, &partial).await;
        }

        if let Err(e) = fetched {
            self.discard_partial(partial).await;
            return Err(e.into());
        }

        let (from, to) = (partial.clone(), destination.clone());
        if let Err(e) = files::run_blocking(&destination, self.file_op_timeout, move || {
            std::fs::rename(&from, &to).map_err(|e| StorageError::io(&to, e))
        })
        .await
        {
            self.discard_partial(partial).await;
            return Err(e.into());
        }

        let now = self.clock.now();
        Ok(Recording {
            filename: entry.filename.clone(),
            camera_id: camera_id.to_string(),
            local_path: destination,
            downloaded_at: now,
            recording_time: resolve_recording_time(&entry.filename, entry.timestamp.as_deref(), now),
            is_permanent: false,
        })
    }

    async fn fetch(&self, camera_id: &str, filename: &str, partial: &Path) -> Result<(), RecorderError> {
        tokio::time::timeout(
            self.download_timeout,
            self.client.fetch_recording(camera_id, filename, partial),
        )
        .await
        .unwrap_or_else(|_| {
            Err(RecorderError::Timeout {
                operation: "download",
                after: self.download_timeout,
            })
        })
    }

    async fn discard_partial(&self, partial: PathBuf) {
        let path = partial.clone();
        if let Err(e) = files::run_blocking(&path, self.file_op_timeout, move || {
            files::remove_file_if_exists(&partial)
        })
        .await
        {
            debug!(path = %path.display(), error = %e, "Could not remove partial download");
        }
    }
}

async fn create_camera_dir(camera_dir: &Path) -> Result<(), StorageError> {
    tokio::fs::create_dir_all(camera_dir)
        .await
        .map_err(|e| StorageError::io(camera_dir, e))
}

/// Path a download is written to before it is renamed into place
pub fn download_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(DOWNLOAD_SUFFIX);
    destination.with_file_name(name)
}
