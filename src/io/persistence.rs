//! Durable spot status and parking log
//!
//! `SnapshotFile` keeps the last known status of every spot in one JSON
//! document. Writes go to a sibling temp file that is renamed over the
//! target, so a crash never leaves a half-written snapshot. Applying a
//! status the file already holds is a no-op, which makes redelivery safe.
//!
//! `ParkingLog` appends one JSON line per plate read at entry.

use crate::domain::types::{SpotId, SpotStatus};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotDocument {
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    spots: BTreeMap<SpotId, SpotStatus>,
}

/// On-disk spot status snapshot
pub struct SnapshotFile {
    path: PathBuf,
    spots: BTreeMap<SpotId, SpotStatus>,
}

impl SnapshotFile {
    /// Open the snapshot at `path`; a missing file starts empty
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let spots = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
            let doc: SnapshotDocument = serde_json::from_str(&content)
                .with_context(|| format!("Invalid snapshot: {}", path.display()))?;
            doc.spots
        } else {
            BTreeMap::new()
        };
        info!(path = %path.display(), spots = spots.len(), "snapshot_opened");
        Ok(Self { path, spots })
    }

    /// Statuses as loaded, for seeding the layout's persisted defaults
    pub fn statuses(&self) -> FxHashMap<SpotId, SpotStatus> {
        self.spots.iter().map(|(id, status)| (*id, *status)).collect()
    }

    pub fn get(&self, spot_id: SpotId) -> Option<SpotStatus> {
        self.spots.get(&spot_id).copied()
    }

    /// Record one status. Returns `Ok(false)` when the file already held it.
    pub fn apply(&mut self, spot_id: SpotId, status: SpotStatus) -> std::io::Result<bool> {
        if self.spots.get(&spot_id) == Some(&status) {
            return Ok(false);
        }
        let previous = self.spots.insert(spot_id, status);
        if let Err(e) = self.flush() {
            // Keep memory consistent with disk so a retry writes again
            match previous {
                Some(prev) => self.spots.insert(spot_id, prev),
                None => self.spots.remove(&spot_id),
            };
            return Err(e);
        }
        Ok(true)
    }

    /// Record many statuses with a single write. Returns how many changed.
    pub fn apply_all<I>(&mut self, statuses: I) -> std::io::Result<usize>
    where
        I: IntoIterator<Item = (SpotId, SpotStatus)>,
    {
        let mut changed = 0;
        for (spot_id, status) in statuses {
            if self.spots.insert(spot_id, status) != Some(status) {
                changed += 1;
            }
        }
        if changed > 0 {
            self.flush()?;
        }
        Ok(changed)
    }

    fn flush(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let doc = SnapshotDocument { updated_at: Some(Utc::now()), spots: self.spots.clone() };
        let json = serde_json::to_vec_pretty(&doc)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), spots = self.spots.len(), "snapshot_written");
        Ok(())
    }
}

/// One vehicle entry with its plate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParkingLogEntry {
    pub spot_id: SpotId,
    pub license_plate: String,
    pub entry_time: DateTime<Utc>,
}

/// Append-only JSONL parking log
pub struct ParkingLog {
    path: PathBuf,
}

impl ParkingLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn append(&self, entry: &ParkingLogEntry) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let line = serde_json::to_string(entry)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")?;
        debug!(spot_id = %entry.spot_id, plate = %entry.license_plate, "parking_log_appended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let snapshot = SnapshotFile::open(dir.path().join("none.json")).unwrap();
        assert!(snapshot.statuses().is_empty());
    }

    #[test]
    fn test_apply_is_idempotent_and_durable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("spots.json");

        let mut snapshot = SnapshotFile::open(&path).unwrap();
        assert!(snapshot.apply(SpotId(1), SpotStatus::Occupied).unwrap());
        assert!(!snapshot.apply(SpotId(1), SpotStatus::Occupied).unwrap());
        assert!(snapshot.apply(SpotId(2), SpotStatus::Free).unwrap());
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = SnapshotFile::open(&path).unwrap();
        assert_eq!(reopened.get(SpotId(1)), Some(SpotStatus::Occupied));
        assert_eq!(reopened.get(SpotId(2)), Some(SpotStatus::Free));
        assert_eq!(reopened.statuses().len(), 2);
    }

    #[test]
    fn test_apply_all_writes_once_for_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spots.json");
        let mut snapshot = SnapshotFile::open(&path).unwrap();
        snapshot.apply(SpotId(1), SpotStatus::Free).unwrap();

        let changed = snapshot
            .apply_all([(SpotId(1), SpotStatus::Free), (SpotId(2), SpotStatus::Reserved)])
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(SnapshotFile::open(&path).unwrap().get(SpotId(2)), Some(SpotStatus::Reserved));
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spots.json");
        fs::write(&path, "not json").unwrap();
        assert!(SnapshotFile::open(&path).is_err());
    }

    #[test]
    fn test_parking_log_appends_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let log = ParkingLog::new(&path);
        for (spot, plate) in [(1, "KA01AB1234"), (2, "MH12XY9999")] {
            log.append(&ParkingLogEntry {
                spot_id: SpotId(spot),
                license_plate: plate.to_string(),
                entry_time: Utc::now(),
            })
            .unwrap();
        }

        let content = fs::read_to_string(&path).unwrap();
        let entries: Vec<ParkingLogEntry> =
            content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].license_plate, "MH12XY9999");
    }
}
