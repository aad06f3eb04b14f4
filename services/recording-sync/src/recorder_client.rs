//! Client side of the remote recorder.
//!
//! The manager only depends on the [`RecorderClient`] trait; [`ShinobiClient`]
//! implements it against a Shinobi NVR's HTTP API.

use crate::config::RecorderConfig;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

/// Errors that can occur talking to the recorder.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Recorder returned status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Unexpected response body: {0}")]
    Decode(String),

    #[error("Failed writing download: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

/// One entry of a camera's recording catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Name of the file on the recorder, unique per camera
    pub filename: String,
    /// Recording start as reported by the recorder, unparsed
    pub timestamp: Option<String>,
    /// Size in bytes, if reported
    pub size: Option<u64>,
}

/// Operations the manager needs from the remote recorder
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecorderClient: Send + Sync {
    /// Identifiers of every camera known to the recorder
    async fn list_cameras(&self) -> Result<Vec<String>, RecorderError>;

    /// Recordings currently available for a camera
    async fn list_recordings(&self, camera_id: &str) -> Result<Vec<CatalogEntry>, RecorderError>;

    /// Write a recording's bytes to `destination`
    async fn fetch_recording(
        &self,
        camera_id: &str,
        filename: &str,
        destination: &Path,
    ) -> Result<(), RecorderError>;

    /// Mark an event on the recorder's own timeline
    async fn mark_event(&self, camera_id: &str, reason: &str) -> Result<(), RecorderError>;
}

/// Monitor entry of the Shinobi monitor list
#[derive(Debug, Deserialize)]
struct ShinobiMonitor {
    mid: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MonitorList {
    Bare(Vec<ShinobiMonitor>),
    Wrapped { monitors: Vec<ShinobiMonitor> },
}

/// Video entry of the Shinobi video list; older releases use `name`/`start`.
///
/// Field types vary between releases, so they are read loosely and anything
/// that is not a string is ignored.
#[derive(Debug, Deserialize)]
struct ShinobiVideo {
    filename: Option<Value>,
    name: Option<Value>,
    time: Option<Value>,
    timestamp: Option<Value>,
    start: Option<Value>,
    size: Option<Value>,
}

impl ShinobiVideo {
    fn into_entry(self) -> Option<CatalogEntry> {
        let filename = text(self.filename)
            .or_else(|| text(self.name))
            .filter(|name| !name.is_empty())?;
        Some(CatalogEntry {
            filename,
            timestamp: text(self.time)
                .or_else(|| text(self.timestamp))
                .or_else(|| text(self.start)),
            size: self.size.as_ref().and_then(Value::as_u64),
        })
    }
}

fn text(value: Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

/// Entries are decoded one by one so a single malformed entry cannot hide
/// the rest of the list
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VideoList {
    Bare(Vec<Value>),
    Wrapped { videos: Vec<Value> },
}

impl From<MonitorList> for Vec<String> {
    fn from(list: MonitorList) -> Self {
        let monitors = match list {
            MonitorList::Bare(monitors) | MonitorList::Wrapped { monitors } => monitors,
        };
        monitors
            .into_iter()
            .filter_map(|m| m.mid)
            .filter(|mid| !mid.is_empty())
            .collect()
    }
}

impl From<VideoList> for Vec<CatalogEntry> {
    fn from(list: VideoList) -> Self {
        let videos = match list {
            VideoList::Bare(videos) | VideoList::Wrapped { videos } => videos,
        };
        videos
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<ShinobiVideo>(raw) {
                Ok(video) => video.into_entry(),
                Err(e) => {
                    debug!(error = %e, "Skipping malformed video entry");
                    None
                }
            })
            .collect()
    }
}

/// Shinobi NVR HTTP client
pub struct ShinobiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    group_key: String,
    request_timeout: Duration,
    download_timeout: Duration,
}

impl ShinobiClient {
    /// Create a new client from configuration
    pub fn new(config: &RecorderConfig) -> Result<Self, RecorderError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            group_key: config.group_key.clone(),
            request_timeout: config.request_timeout(),
            download_timeout: config.download_timeout(),
        })
    }

    fn monitors_url(&self) -> String {
        format!("{}/{}/monitor/{}", self.base_url, self.api_key, self.group_key)
    }

    fn videos_url(&self, camera_id: &str) -> String {
        format!(
            "{}/{}/videos/{}/{}",
            self.base_url, self.api_key, self.group_key, camera_id
        )
    }

    /// Direct URL of a recording file
    pub fn recording_url(&self, camera_id: &str, filename: &str) -> String {
        format!("{}/{}", self.videos_url(camera_id), filename)
    }

    fn motion_url(&self, camera_id: &str) -> String {
        format!(
            "{}/{}/motion/{}/{}",
            self.base_url, self.api_key, self.group_key, camera_id
        )
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, RecorderError> {
        let response = self
            .http
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| timeout_or_http(e, "catalog request", self.request_timeout))?;

        let response = check_status(response)?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| RecorderError::Decode(e.to_string()))
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RecorderError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(RecorderError::Status {
            status: status.as_u16(),
            url: response.url().to_string(),
        })
    }
}

fn timeout_or_http(error: reqwest::Error, operation: &'static str, after: Duration) -> RecorderError {
    if error.is_timeout() {
        RecorderError::Timeout { operation, after }
    } else {
        RecorderError::Http(error)
    }
}

#[async_trait]
impl RecorderClient for ShinobiClient {
    #[instrument(skip(self))]
    async fn list_cameras(&self) -> Result<Vec<String>, RecorderError> {
        let list: MonitorList = self.get_json(&self.monitors_url()).await?;
        Ok(list.into())
    }

    #[instrument(skip(self))]
    async fn list_recordings(&self, camera_id: &str) -> Result<Vec<CatalogEntry>, RecorderError> {
        let list: VideoList = self.get_json(&self.videos_url(camera_id)).await?;
        Ok(list.into())
    }

    #[instrument(skip(self, destination), fields(destination = %destination.display()))]
    async fn fetch_recording(
        &self,
        camera_id: &str,
        filename: &str,
        destination: &Path,
    ) -> Result<(), RecorderError> {
        let url = self.recording_url(camera_id, filename);
        let response = self
            .http
            .get(&url)
            .timeout(self.download_timeout)
            .send()
            .await
            .map_err(|e| timeout_or_http(e, "download", self.download_timeout))?;
        let response = check_status(response)?;

        let mut file = tokio::fs::File::create(destination).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| timeout_or_http(e, "download", self.download_timeout))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(bytes = written, "Recording downloaded");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_event(&self, camera_id: &str, reason: &str) -> Result<(), RecorderError> {
        let data = serde_json::json!({
            "plug": camera_id,
            "name": "Motion",
            "reason": reason,
            "confidence": 100,
        });

        let response = self
            .http
            .get(self.motion_url(camera_id))
            .query(&[("data", data.to_string())])
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| timeout_or_http(e, "mark event", self.request_timeout))?;

        check_status(response)?;
        Ok(())
    }
}
