//! Lifecycle glue: wires the index, syncer, correlator, promoter and reaper
//! together and owns the background loops.

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, CorrelationConfig, StorageConfig};
use crate::correlator::{EventCorrelator, EventOutcome};
use crate::files;
use crate::index::{RecordingIndex, StorageStats};
use crate::promoter::Promoter;
use crate::reaper::Reaper;
use crate::recorder_client::RecorderClient;
use crate::recording::EventBuffers;
use crate::syncer::Syncer;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct Running {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Local recording lifecycle manager
pub struct RecordingManager {
    index: Arc<RecordingIndex>,
    client: Arc<dyn RecorderClient>,
    clock: Arc<dyn Clock>,
    correlator: Arc<EventCorrelator>,
    syncer: Arc<Syncer>,
    reaper: Arc<Reaper>,
    storage: StorageConfig,
    forward_to_recorder: bool,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl RecordingManager {
    /// Build a manager from the service configuration
    pub fn from_config(config: &Config, client: Arc<dyn RecorderClient>) -> Result<Self> {
        RecordingManagerBuilder::new()
            .storage(config.storage.clone())
            .correlation(config.correlation.clone())
            .download_timeout(config.recorder.download_timeout())
            .build(client)
    }

    /// Load what is already on disk, then start the sync and cleanup loops.
    ///
    /// Calling this while already running does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let (index, clock) = (self.index.clone(), self.clock.clone());
        let (temp_dir, permanent_dir) = (self.storage.temp_dir.clone(), self.storage.permanent_dir.clone());
        let report = tokio::task::spawn_blocking(move || {
            index.scan_existing(&temp_dir, &permanent_dir, clock.as_ref())
        })
        .await
        .context("Failed to scan existing recordings")?;

        let shutdown = CancellationToken::new();

        let sync_task = {
            let (syncer, token) = (self.syncer.clone(), shutdown.clone());
            let interval = self.storage.sync_interval();
            tokio::spawn(async move { syncer.run(interval, token).await })
        };
        let reap_task = {
            let (reaper, token) = (self.reaper.clone(), shutdown.clone());
            let interval = self.storage.cleanup_interval();
            tokio::spawn(async move { reaper.run(interval, token).await })
        };

        *running = Some(Running {
            shutdown,
            tasks: vec![sync_task, reap_task],
        });

        info!(
            temp = report.temp,
            permanent = report.permanent,
            temp_dir = %self.storage.temp_dir.display(),
            permanent_dir = %self.storage.permanent_dir.display(),
            "Recording manager started"
        );
        Ok(())
    }

    /// Stop the background loops and wait for them to finish.
    ///
    /// Calling this while stopped does nothing.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.shutdown.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        info!("Recording manager stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Mark an event for `camera_id` now and promote matching recordings.
    ///
    /// When forwarding is enabled the event is also marked on the recorder
    /// in the background; a failure there is only logged.
    pub async fn trigger_event(&self, camera_id: &str) -> EventOutcome {
        let outcome = self.correlator.trigger_event(camera_id).await;

        if self.forward_to_recorder {
            let client = self.client.clone();
            let camera_id = camera_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = client.mark_event(&camera_id, "manual trigger").await {
                    warn!(camera_id = %camera_id, error = %e, "Failed to forward event to recorder");
                }
            });
        }

        outcome
    }

    /// Replace the event buffers; applies to every later decision
    pub fn set_event_buffers(&self, pre_seconds: u64, post_seconds: u64) {
        self.correlator
            .set_buffers(EventBuffers::new(pre_seconds, post_seconds));
    }

    pub fn event_buffers(&self) -> EventBuffers {
        self.correlator.buffers()
    }

    /// Counts and on-disk sizes of tracked recordings.
    ///
    /// Files that vanished count as zero bytes.
    pub async fn get_stats(&self) -> StorageStats {
        let snapshot = self.index.snapshot();
        let mut stats = StorageStats {
            temp_count: snapshot.temp_paths.len(),
            permanent_count: snapshot.permanent_paths.len(),
            pending_event_count: snapshot.pending_event_count,
            orphaned_temp_count: snapshot.orphaned_temp_count,
            ..Default::default()
        };

        let (temp_paths, permanent_paths) = (snapshot.temp_paths, snapshot.permanent_paths);
        let sizes = files::run_blocking(&self.storage.temp_dir, self.storage.file_op_timeout(), move || {
            let total = |paths: &[PathBuf]| paths.iter().map(|p| files::file_size(p)).sum::<u64>();
            Ok((total(&temp_paths), total(&permanent_paths)))
        })
        .await;

        match sizes {
            Ok((temp, permanent)) => {
                stats.temp_size_bytes = temp;
                stats.permanent_size_bytes = permanent;
            }
            Err(e) => warn!(error = %e, "Failed to measure recording sizes"),
        }

        stats
    }

    /// Index shared by every component
    pub fn index(&self) -> &Arc<RecordingIndex> {
        &self.index
    }
}

/// Builder for creating a RecordingManager with custom settings
pub struct RecordingManagerBuilder {
    storage: StorageConfig,
    correlation: CorrelationConfig,
    download_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl RecordingManagerBuilder {
    pub fn new() -> Self {
        Self {
            storage: StorageConfig::default(),
            correlation: CorrelationConfig::default(),
            download_timeout: Duration::from_secs(60),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn correlation(mut self, correlation: CorrelationConfig) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage.temp_dir = dir.into();
        self
    }

    pub fn permanent_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage.permanent_dir = dir.into();
        self
    }

    pub fn retention_secs(mut self, secs: u64) -> Self {
        self.storage.retention_secs = secs;
        self
    }

    pub fn sync_interval_secs(mut self, secs: u64) -> Self {
        self.storage.sync_interval_secs = secs;
        self
    }

    pub fn cleanup_interval_secs(mut self, secs: u64) -> Self {
        self.storage.cleanup_interval_secs = secs;
        self
    }

    pub fn event_buffers(mut self, pre_seconds: u64, post_seconds: u64) -> Self {
        self.correlation.pre_event_secs = pre_seconds;
        self.correlation.post_event_secs = post_seconds;
        self
    }

    /// 0 disables the recent-download fallback
    pub fn recent_fallback_secs(mut self, secs: u64) -> Self {
        self.correlation.recent_fallback_secs = secs;
        self
    }

    pub fn forward_to_recorder(mut self, enabled: bool) -> Self {
        self.correlation.forward_to_recorder = enabled;
        self
    }

    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create both storage directories and assemble the manager
    pub fn build(self, client: Arc<dyn RecorderClient>) -> Result<RecordingManager> {
        let storage = self.storage;
        create_storage_dirs(&storage)?;

        let index = Arc::new(RecordingIndex::new());
        let promoter = Arc::new(Promoter::new(
            index.clone(),
            storage.permanent_dir.clone(),
            storage.file_op_timeout(),
        ));
        let correlator = Arc::new(EventCorrelator::new(
            index.clone(),
            promoter,
            self.clock.clone(),
            EventBuffers::new(self.correlation.pre_event_secs, self.correlation.post_event_secs),
            self.correlation.recent_fallback_secs,
        ));
        let syncer = Arc::new(Syncer::new(
            client.clone(),
            index.clone(),
            correlator.clone(),
            self.clock.clone(),
            storage.temp_dir.clone(),
            self.download_timeout,
            storage.file_op_timeout(),
        ));
        let reaper = Arc::new(Reaper::new(
            index.clone(),
            self.clock.clone(),
            storage.temp_dir.clone(),
            storage.retention(),
            storage.file_op_timeout(),
        ));

        Ok(RecordingManager {
            index,
            client,
            clock: self.clock,
            correlator,
            syncer,
            reaper,
            storage,
            forward_to_recorder: self.correlation.forward_to_recorder,
            running: tokio::sync::Mutex::new(None),
        })
    }
}

fn create_storage_dirs(storage: &StorageConfig) -> Result<()> {
    for dir in [&storage.temp_dir, &storage.permanent_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }
    Ok(())
}

impl Default for RecordingManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
