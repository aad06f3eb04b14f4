//! In-memory registry of every recording the manager knows about.
//!
//! One mutex guards the recordings, the dedup-key set, the pending event
//! windows, in-flight promotion claims and orphaned temp copies. Callers
//! copy what they need out, release the lock for I/O, and come back to
//! commit; no method here performs I/O while holding the lock.

use crate::clock::Clock;
use crate::recording::{is_media_file, PendingEventWindow, Recording, RecordingKey};
use crate::timestamp::resolve_recording_time;
use chrono::{DateTime, Duration, Local, NaiveDateTime};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Temp copy left behind by a promotion; expires like any temp recording
#[derive(Debug, Clone, PartialEq)]
pub struct TempOrphan {
    pub key: RecordingKey,
    pub path: PathBuf,
    pub downloaded_at: NaiveDateTime,
}

/// Storage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub temp_count: usize,
    pub permanent_count: usize,
    pub temp_size_bytes: u64,
    pub permanent_size_bytes: u64,
    pub pending_event_count: usize,
    pub orphaned_temp_count: usize,
}

/// Counts gathered from the on-disk layout at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub temp: usize,
    pub permanent: usize,
    pub orphans: usize,
}

/// Point-in-time copy of what the stats need; sizes are read afterwards
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    pub temp_paths: Vec<PathBuf>,
    pub permanent_paths: Vec<PathBuf>,
    pub pending_event_count: usize,
    pub orphaned_temp_count: usize,
}

/// Expired entries removed from the index by [`RecordingIndex::take_expired`]
#[derive(Debug, Default)]
pub struct Expired {
    pub recordings: Vec<Recording>,
    pub orphans: Vec<TempOrphan>,
}

#[derive(Debug, Default)]
struct IndexState {
    recordings: HashMap<RecordingKey, Recording>,
    known: HashSet<RecordingKey>,
    pending: HashMap<String, PendingEventWindow>,
    promoting: HashSet<RecordingKey>,
    orphans: Vec<TempOrphan>,
}

/// Shared registry of recordings and pending events
#[derive(Debug, Default)]
pub struct RecordingIndex {
    state: Mutex<IndexState>,
}

impl RecordingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this dedup key has ever been registered
    pub fn is_known(&self, key: &RecordingKey) -> bool {
        self.state.lock().known.contains(key)
    }

    /// Register a new recording. Returns `false` if the key was already known.
    pub fn register(&self, recording: Recording) -> bool {
        let mut state = self.state.lock();
        let key = recording.key();
        if !state.known.insert(key.clone()) {
            return false;
        }
        state.recordings.insert(key, recording);
        true
    }

    pub fn get(&self, key: &RecordingKey) -> Option<Recording> {
        self.state.lock().recordings.get(key).cloned()
    }

    /// Keys of non-permanent recordings for `camera_id` accepted by `filter`
    pub fn temp_recordings_matching<F>(&self, camera_id: &str, filter: F) -> Vec<RecordingKey>
    where
        F: Fn(&Recording) -> bool,
    {
        self.state
            .lock()
            .recordings
            .values()
            .filter(|rec| rec.camera_id == camera_id && !rec.is_permanent)
            .filter(|rec| filter(rec))
            .map(Recording::key)
            .collect()
    }

    /// Claim a recording for promotion.
    ///
    /// Returns the recording only if it exists, is not yet permanent and no
    /// other promotion of it is in flight. A successful claim must be
    /// followed by [`complete_promotion`](Self::complete_promotion) or
    /// [`release_promotion`](Self::release_promotion).
    pub fn claim_promotion(&self, key: &RecordingKey) -> Option<Recording> {
        let mut state = self.state.lock();
        let recording = state.recordings.get(key)?;
        if recording.is_permanent || state.promoting.contains(key) {
            return None;
        }
        let recording = recording.clone();
        state.promoting.insert(key.clone());
        Some(recording)
    }

    /// Commit a claimed promotion: the recording now lives at `permanent_path`
    /// and its previous temp copy becomes an orphan.
    pub fn complete_promotion(&self, key: &RecordingKey, permanent_path: PathBuf) -> bool {
        let mut state = self.state.lock();
        state.promoting.remove(key);

        let Some(recording) = state.recordings.get_mut(key) else {
            return false;
        };
        if recording.is_permanent {
            return false;
        }

        let orphan = TempOrphan {
            key: key.clone(),
            path: std::mem::replace(&mut recording.local_path, permanent_path),
            downloaded_at: recording.downloaded_at,
        };
        recording.is_permanent = true;
        state.orphans.push(orphan);
        true
    }

    /// Drop a promotion claim without changing the recording
    pub fn release_promotion(&self, key: &RecordingKey) {
        self.state.lock().promoting.remove(key);
    }

    /// Record an event window for a camera, replacing any previous one
    pub fn set_pending(&self, camera_id: &str, window: PendingEventWindow) {
        self.state
            .lock()
            .pending
            .insert(camera_id.to_string(), window);
    }

    pub fn pending(&self, camera_id: &str) -> Option<PendingEventWindow> {
        self.state.lock().pending.get(camera_id).copied()
    }

    /// Discard the camera's pending window, but only if it is still `expected`
    pub fn clear_pending_if(&self, camera_id: &str, expected: PendingEventWindow) -> bool {
        let mut state = self.state.lock();
        if state.pending.get(camera_id) == Some(&expected) {
            state.pending.remove(camera_id);
            true
        } else {
            false
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Remove and return every non-permanent recording and orphan whose age
    /// exceeds `horizon`. Recordings with a promotion in flight are kept.
    ///
    /// Dedup keys stay known so expired recordings are not fetched again.
    pub fn take_expired(&self, now: NaiveDateTime, horizon: Duration) -> Expired {
        let mut state = self.state.lock();
        let state = &mut *state;

        let expired_keys: Vec<RecordingKey> = state
            .recordings
            .iter()
            .filter(|(key, rec)| {
                !rec.is_permanent && !state.promoting.contains(*key) && rec.age(now) > horizon
            })
            .map(|(key, _)| key.clone())
            .collect();

        let recordings = expired_keys
            .iter()
            .filter_map(|key| state.recordings.remove(key))
            .collect();

        let (orphans, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.orphans)
            .into_iter()
            .partition(|orphan| now.signed_duration_since(orphan.downloaded_at) > horizon);
        state.orphans = kept;

        Expired {
            recordings,
            orphans,
        }
    }

    /// Put back a recording whose deletion failed
    pub fn restore(&self, recording: Recording) {
        let mut state = self.state.lock();
        let key = recording.key();
        state.known.insert(key.clone());
        state.recordings.entry(key).or_insert(recording);
    }

    /// Put back an orphan whose deletion failed
    pub fn restore_orphan(&self, orphan: TempOrphan) {
        self.state.lock().orphans.push(orphan);
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        let state = self.state.lock();
        let mut snapshot = IndexSnapshot {
            pending_event_count: state.pending.len(),
            orphaned_temp_count: state.orphans.len(),
            ..Default::default()
        };
        for rec in state.recordings.values() {
            if rec.is_permanent {
                snapshot.permanent_paths.push(rec.local_path.clone());
            } else {
                snapshot.temp_paths.push(rec.local_path.clone());
            }
        }
        snapshot
    }

    /// Rebuild state from the on-disk layout.
    ///
    /// Walks `permanent_dir/{camera}/{event}/{file}` first, then
    /// `temp_dir/{camera}/{file}`. A temp file whose key is already known as
    /// permanent is the leftover copy of a promotion and is tracked as an
    /// orphan. Keys already in the index are left alone, so scanning twice
    /// changes nothing.
    pub fn scan_existing(&self, temp_dir: &Path, permanent_dir: &Path, clock: &dyn Clock) -> ScanReport {
        let now = clock.now();
        let mut report = ScanReport::default();

        for camera_dir in subdirectories(permanent_dir) {
            let Some(camera_id) = dir_name(&camera_dir) else {
                continue;
            };
            for event_dir in subdirectories(&camera_dir) {
                for file in media_files(&event_dir) {
                    if let Some(rec) = recording_from_disk(&camera_id, &file, true, now) {
                        if self.register(rec) {
                            report.permanent += 1;
                        }
                    }
                }
            }
        }

        for camera_dir in subdirectories(temp_dir) {
            let Some(camera_id) = dir_name(&camera_dir) else {
                continue;
            };
            for file in media_files(&camera_dir) {
                let Some(rec) = recording_from_disk(&camera_id, &file, false, now) else {
                    continue;
                };
                let key = rec.key();
                let mut state = self.state.lock();
                let promoted_elsewhere = state
                    .recordings
                    .get(&key)
                    .map(|existing| existing.is_permanent && existing.local_path != file);

                match promoted_elsewhere {
                    Some(true) => {
                        if !state.orphans.iter().any(|o| o.path == file) {
                            state.orphans.push(TempOrphan {
                                key,
                                path: file,
                                downloaded_at: rec.downloaded_at,
                            });
                            report.orphans += 1;
                        }
                    }
                    Some(false) => {}
                    None if state.known.contains(&key) => {}
                    None => {
                        state.known.insert(key.clone());
                        state.recordings.insert(key, rec);
                        report.temp += 1;
                    }
                }
            }
        }

        if report != ScanReport::default() {
            info!(
                temp = report.temp,
                permanent = report.permanent,
                orphans = report.orphans,
                "Loaded existing recordings"
            );
        }

        report
    }
}

fn subdirectories(root: &Path) -> Vec<PathBuf> {
    match fs::read_dir(root) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect(),
        Err(e) => {
            debug!(path = %root.display(), error = %e, "Skipping unreadable directory");
            Vec::new()
        }
    }
}

fn media_files(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_media_file(path))
            .collect(),
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "Skipping unreadable directory");
            Vec::new()
        }
    }
}

fn dir_name(path: &Path) -> Option<String> {
    path.file_name()?.to_str().map(str::to_string)
}

fn recording_from_disk(
    camera_id: &str,
    path: &Path,
    is_permanent: bool,
    now: NaiveDateTime,
) -> Option<Recording> {
    let filename = path.file_name()?.to_str()?.to_string();

    let downloaded_at = match fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(modified) => DateTime::<Local>::from(modified).naive_local(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot read modification time, using now");
            now
        }
    };

    Some(Recording {
        recording_time: resolve_recording_time(&filename, None, now),
        filename,
        camera_id: camera_id.to_string(),
        local_path: path.to_path_buf(),
        downloaded_at,
        is_permanent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn recording(camera_id: &str, filename: &str) -> Recording {
        Recording {
            filename: filename.to_string(),
            camera_id: camera_id.to_string(),
            local_path: PathBuf::from(format!("/temp/{}/{}", camera_id, filename)),
            downloaded_at: at(14, 0, 0),
            recording_time: at(14, 0, 0),
            is_permanent: false,
        }
    }

    fn tracked(index: &RecordingIndex) -> usize {
        let snapshot = index.snapshot();
        snapshot.temp_paths.len() + snapshot.permanent_paths.len()
    }

    fn write(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"data").unwrap();
    }

    #[test]
    fn test_register_dedups_by_camera_and_filename() {
        let index = RecordingIndex::new();
        assert!(index.register(recording("cam1", "a.mp4")));
        assert!(!index.register(recording("cam1", "a.mp4")));
        assert!(index.register(recording("cam2", "a.mp4")));
        assert_eq!(tracked(&index), 2);
    }

    #[test]
    fn test_claim_is_exclusive_until_released() {
        let index = RecordingIndex::new();
        let rec = recording("cam1", "a.mp4");
        let key = rec.key();
        index.register(rec);

        assert!(index.claim_promotion(&key).is_some());
        assert!(index.claim_promotion(&key).is_none());

        index.release_promotion(&key);
        assert!(index.claim_promotion(&key).is_some());
    }

    #[test]
    fn test_complete_promotion_is_monotonic() {
        let index = RecordingIndex::new();
        let rec = recording("cam1", "a.mp4");
        let key = rec.key();
        index.register(rec);

        index.claim_promotion(&key).unwrap();
        assert!(index.complete_promotion(&key, PathBuf::from("/perm/cam1/e/a.mp4")));
        assert!(!index.complete_promotion(&key, PathBuf::from("/perm/cam1/f/a.mp4")));

        let promoted = index.get(&key).unwrap();
        assert!(promoted.is_permanent);
        assert_eq!(promoted.local_path, PathBuf::from("/perm/cam1/e/a.mp4"));
        assert!(index.claim_promotion(&key).is_none());
        assert_eq!(index.snapshot().orphaned_temp_count, 1);
    }

    #[test]
    fn test_take_expired_skips_permanent_and_in_flight() {
        let index = RecordingIndex::new();
        let old = recording("cam1", "old.mp4");
        let busy = recording("cam1", "busy.mp4");
        let mut kept = recording("cam1", "kept.mp4");
        kept.is_permanent = true;
        let busy_key = busy.key();
        index.register(old);
        index.register(busy);
        index.register(kept);
        index.claim_promotion(&busy_key).unwrap();

        let expired = index.take_expired(at(16, 0, 0), Duration::hours(1));
        assert_eq!(expired.recordings.len(), 1);
        assert_eq!(expired.recordings[0].filename, "old.mp4");
        assert_eq!(tracked(&index), 2);
        // Removed recordings stay deduplicated
        assert!(index.is_known(&RecordingKey::new("cam1", "old.mp4")));
    }

    #[test]
    fn test_clear_pending_only_when_unchanged() {
        let index = RecordingIndex::new();
        let first = PendingEventWindow { event_time: at(14, 0, 0) };
        let second = PendingEventWindow { event_time: at(14, 5, 0) };

        index.set_pending("cam1", first);
        index.set_pending("cam1", second);
        assert!(!index.clear_pending_if("cam1", first));
        assert_eq!(index.pending_count(), 1);
        assert!(index.clear_pending_if("cam1", second));
        assert_eq!(index.pending_count(), 0);
    }

    #[test]
    fn test_scan_existing_layout() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("temp");
        let perm = dir.path().join("perm");
        write(&temp.join("cam1").join("2024-01-15T14-30-22.mp4"));
        write(&temp.join("cam2").join("2024-01-15_14-31-00.mkv"));
        write(&temp.join("cam2").join("notes.txt"));
        write(&temp.join("cam2").join("partial.mp4.part"));
        write(&perm.join("cam1").join("20240115_120000").join("20240115_115930.avi"));

        let index = RecordingIndex::new();
        let clock = ManualClock::new(at(15, 0, 0));
        let report = index.scan_existing(&temp, &perm, &clock);

        assert_eq!(report, ScanReport { temp: 2, permanent: 1, orphans: 0 });
        let snapshot = index.snapshot();
        assert_eq!(snapshot.temp_paths.len(), 2);
        assert_eq!(snapshot.permanent_paths.len(), 1);

        let rec = index
            .get(&RecordingKey::new("cam1", "2024-01-15T14-30-22.mp4"))
            .unwrap();
        assert_eq!(rec.recording_time, at(14, 30, 22));
        assert!(!rec.is_permanent);
        assert!(index.is_known(&RecordingKey::new("cam1", "20240115_115930.avi")));
    }

    #[test]
    fn test_scan_existing_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("temp");
        let perm = dir.path().join("perm");
        write(&temp.join("cam1").join("a.mp4"));
        write(&perm.join("cam1").join("20240115_120000").join("b.mp4"));

        let index = RecordingIndex::new();
        let clock = ManualClock::new(at(15, 0, 0));
        index.scan_existing(&temp, &perm, &clock);
        let second = index.scan_existing(&temp, &perm, &clock);

        assert_eq!(second, ScanReport::default());
        assert_eq!(tracked(&index), 2);
    }

    #[test]
    fn test_scan_existing_tracks_promoted_temp_copy_as_orphan() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("temp");
        let perm = dir.path().join("perm");
        write(&temp.join("cam1").join("a.mp4"));
        write(&perm.join("cam1").join("20240115_120000").join("a.mp4"));

        let index = RecordingIndex::new();
        let clock = ManualClock::new(at(15, 0, 0));
        let report = index.scan_existing(&temp, &perm, &clock);

        assert_eq!(report, ScanReport { temp: 0, permanent: 1, orphans: 1 });
        assert_eq!(index.snapshot().orphaned_temp_count, 1);
    }

    #[test]
    fn test_scan_missing_directories_is_empty() {
        let dir = TempDir::new().unwrap();
        let index = RecordingIndex::new();
        let clock = ManualClock::new(at(15, 0, 0));
        let report = index.scan_existing(&dir.path().join("nope"), &dir.path().join("nada"), &clock);
        assert_eq!(report, ScanReport::default());
    }
}
