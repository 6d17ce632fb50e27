//! Store snapshot file
//!
//! JSON image of cards, links, tokens, devices and the audit log. Challenges
//! and DESFire sessions are deliberately absent.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::card::{AccessLog, Card, CardToken};
use crate::device::Device;
use super::StoreError;

/// Card-to-device authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardLink {
    pub card_id: Uuid,
    pub device_id: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub cards: Vec<Card>,
    #[serde(default)]
    pub links: Vec<CardLink>,
    #[serde(default)]
    pub tokens: Vec<CardToken>,
    #[serde(default)]
    pub logs: Vec<AccessLog>,
    #[serde(default)]
    pub next_log_id: u64,
    #[serde(default)]
    pub devices: Vec<Device>,
}

/// Location of the snapshot on disk
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    storage_dir: PathBuf,
    state_file: PathBuf,
}

/// `SKUD_STORAGE_DIR`, then `~/.skud`, then `/var/lib/skud`
pub fn default_storage_dir() -> PathBuf {
    if let Ok(path) = std::env::var("SKUD_STORAGE_DIR") {
        return PathBuf::from(path);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".skud");
    }
    PathBuf::from("/var/lib/skud")
}

impl SnapshotFile {
    const STATE_FILE: &'static str = "skud_state.json";

    pub fn new(storage_dir: Option<PathBuf>) -> Self {
        let storage_dir = storage_dir.unwrap_or_else(default_storage_dir);
        let state_file = storage_dir.join(Self::STATE_FILE);
        Self { storage_dir, state_file }
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }

    fn ensure_storage_dir(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.storage_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.storage_dir, fs::Permissions::from_mode(0o700));
        }
        Ok(())
    }

    /// Read the snapshot. `None` if there is none yet.
    ///
    /// An unreadable or unparsable file is moved aside to
    /// `skud_state.json.corrupt-<timestamp>` so the next save cannot replace
    /// it. If it cannot be moved the store must not open.
    pub fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        if !self.state_file.exists() {
            info!("No snapshot at {:?}, starting empty", self.state_file);
            return Ok(None);
        }

        let parsed = fs::read_to_string(&self.state_file)
            .map_err(|e| e.to_string())
            .and_then(|content| serde_json::from_str::<Snapshot>(&content).map_err(|e| e.to_string()));

        match parsed {
            Ok(snapshot) => {
                info!("Loaded snapshot from {:?}", self.state_file);
                Ok(Some(snapshot))
            }
            Err(e) => {
                warn!("Failed to load snapshot {:?}: {}", self.state_file, e);
                let aside = self.quarantine()?;
                error!("Unusable snapshot moved to {:?}, starting empty", aside);
                Ok(None)
            }
        }
    }

    fn quarantine(&self) -> Result<PathBuf, StoreError> {
        let mut name = self.state_file.as_os_str().to_owned();
        name.push(format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")));
        let aside = PathBuf::from(name);
        fs::rename(&self.state_file, &aside).map_err(|e| {
            StoreError::Unavailable(format!("cannot move unusable snapshot {:?} aside: {}", self.state_file, e))
        })?;
        Ok(aside)
    }

    /// Write the snapshot through a temporary file and rename
    pub fn save(&self, snapshot: &Snapshot) -> bool {
        if let Err(e) = self.ensure_storage_dir() {
            warn!("Failed to create storage directory: {}", e);
            return false;
        }

        let json = match serde_json::to_string_pretty(snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize snapshot: {}", e);
                return false;
            }
        };

        let tmp = self.state_file.with_extension("json.tmp");
        if let Err(e) = fs::write(&tmp, json) {
            warn!("Failed to write snapshot: {}", e);
            return false;
        }
        // Tokens are bearer secrets
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600));
        }
        if let Err(e) = fs::rename(&tmp, &self.state_file) {
            warn!("Failed to replace snapshot: {}", e);
            return false;
        }
        debug!("Saved snapshot to {:?}", self.state_file);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::CardType;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let file = SnapshotFile::new(Some(temp_dir.path().to_path_buf()));
        assert!(file.load().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let file = SnapshotFile::new(Some(temp_dir.path().join("nested")));

        let card = Card::discovered("04A1B2", CardType::MifareDesfire, Utc::now());
        let snapshot = Snapshot {
            cards: vec![card.clone()],
            next_log_id: 7,
            ..Default::default()
        };
        assert!(file.save(&snapshot));
        assert!(file.path().ends_with("skud_state.json"));

        let loaded = file.load().unwrap().unwrap();
        assert_eq!(loaded.cards, vec![card]);
        assert_eq!(loaded.next_log_id, 7);
    }

    #[test]
    fn test_corrupt_file_moved_aside() {
        let temp_dir = TempDir::new().unwrap();
        let file = SnapshotFile::new(Some(temp_dir.path().to_path_buf()));
        fs::write(file.path(), "{ not json").unwrap();
        assert!(file.load().unwrap().is_none());
        assert!(!file.path().exists());

        let kept: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|p| p.to_string_lossy().contains("skud_state.json.corrupt-"))
            .collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(fs::read_to_string(&kept[0]).unwrap(), "{ not json");
    }

    #[cfg(unix)]
    #[test]
    fn test_snapshot_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let file = SnapshotFile::new(Some(temp_dir.path().to_path_buf()));
        assert!(file.save(&Snapshot::default()));
        let mode = fs::metadata(file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
