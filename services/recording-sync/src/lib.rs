//! Recording Sync Service
//!
//! Local recording lifecycle manager for a Shinobi NVR deployment. The
//! service mirrors each camera's recordings into a short-lived temp tree,
//! copies the ones that fall around an event into a permanent tree grouped
//! by event, and deletes temp copies once they outlive the retention period.
//!
//! ## Features
//!
//! - **Catalog Sync**: Periodic, deduplicated download of every new media
//!   file, isolated per camera and per file
//! - **Event Correlation**: Pre/post event windows, including recordings
//!   that arrive after the event was marked
//! - **Exactly-once Promotion**: Concurrent triggers never copy a recording
//!   twice
//! - **Retention**: Temp recordings expire; permanent ones are never deleted
//! - **Restart Safety**: State is rebuilt from the on-disk layout at start
//!
//! ## Architecture
//!
//! ```text
//! Shinobi NVR                 temp_dir/                 permanent_dir/
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────────┐
//! │ monitors     │           │ {camera}/    │          │ {camera}/        │
//! │ videos       │──────────▶│   {file}     │─────────▶│   {event_time}/  │
//! └──────────────┘  Syncer   └──────────────┘ Promoter │     {file}       │
//!        ▲                          │          ▲       └──────────────────┘
//!        │                          ▼          │
//!        │                   ┌──────────────┐  │
//!        │                   │ Reaper       │  │
//!        │                   └──────────────┘  │
//!        │                                     │
//! ┌──────────────┐           ┌──────────────┐  │
//! │ Control API  │──────────▶│ Event        │──┘
//! │ (axum)       │           │ Correlator   │
//! └──────────────┘           └──────────────┘
//! ```

pub mod api;
pub mod clock;
pub mod config;
pub mod correlator;
pub mod files;
pub mod index;
pub mod manager;
pub mod promoter;
pub mod reaper;
pub mod recorder_client;
pub mod recording;
pub mod syncer;
pub mod timestamp;

pub use api::{AppState, ErrorResponse};
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use correlator::{EventCorrelator, EventOutcome};
pub use index::{RecordingIndex, StorageStats};
pub use manager::{RecordingManager, RecordingManagerBuilder};
pub use promoter::{Promoter, Promotion};
pub use reaper::{ReapReport, Reaper};
pub use recorder_client::{CatalogEntry, RecorderClient, RecorderError, ShinobiClient};
pub use recording::{EventBuffers, Recording, RecordingKey};
pub use syncer::{SyncReport, Syncer};
