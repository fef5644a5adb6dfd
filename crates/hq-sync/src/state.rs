//! The on-disk sync state cache.
//!
//! Lives at `<localDir>/.hq-sync-state.json`. Writes go through a temp file
//! in the same directory followed by an atomic rename, so an external
//! reader sees either the prior full state or the new full state, never a
//! torn write.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::errors::{Result, SyncError};

/// Default state file name under the mirror root.
pub const STATE_FILE_NAME: &str = ".hq-sync-state.json";
/// Ignore-rule file name under the mirror root.
pub const IGNORE_FILE_NAME: &str = ".hqignore";

/// Per-file sync bookkeeping.
///
/// The local file at `relativePath` is in sync iff its remote etag equals
/// the stored `etag`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStateEntry {
    /// Path relative to the mirror root.
    pub relative_path: String,
    /// Remote last-modified, milliseconds since the Unix epoch.
    pub last_modified: i64,
    /// Remote etag at download time.
    pub etag: String,
    /// Body size in bytes.
    pub size: u64,
    /// When the download completed, milliseconds since the Unix epoch.
    pub synced_at: i64,
}

/// The whole state document (version 1).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// Schema version; always 1.
    pub version: u32,
    /// Owning user.
    pub user_id: String,
    /// Remote prefix this mirror tracks.
    pub s3_prefix: String,
    /// Last completed poll, milliseconds since the Unix epoch.
    pub last_poll_at: Option<i64>,
    /// Entries keyed by relative path.
    pub entries: BTreeMap<String, SyncStateEntry>,
}

impl SyncState {
    /// Fresh empty state.
    pub fn new(user_id: impl Into<String>, s3_prefix: impl Into<String>) -> Self {
        Self {
            version: 1,
            user_id: user_id.into(),
            s3_prefix: s3_prefix.into(),
            last_poll_at: None,
            entries: BTreeMap::new(),
        }
    }

    /// Load from disk. A missing file yields fresh state; a corrupt file is
    /// an error (the caller decides whether to reset).
    pub fn load(path: &Path, user_id: &str, s3_prefix: &str) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(user_id, s3_prefix));
        }
        let text = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&text)
            .map_err(|e| SyncError::State(format!("corrupt state file: {e}")))?;
        if state.version != 1 {
            return Err(SyncError::State(format!(
                "unsupported state version {}",
                state.version
            )));
        }
        Ok(state)
    }

    /// Persist atomically: temp file in the target directory, then rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| SyncError::State("state path has no parent".into()))?;
        std::fs::create_dir_all(parent)?;
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::State(format!("serialize state: {e}")))?;
        temp.write_all(text.as_bytes())?;
        temp.flush()?;
        let _ = temp
            .persist(path)
            .map_err(|e| SyncError::State(format!("persist state: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let state = SyncState::load(&dir.path().join(STATE_FILE_NAME), "user1", "user1/hq/")
            .unwrap();
        assert_eq!(state.version, 1);
        assert!(state.entries.is_empty());
        assert!(state.last_poll_at.is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        let mut state = SyncState::new("user1", "user1/hq/");
        let _ = state.entries.insert(
            "new-file.txt".into(),
            SyncStateEntry {
                relative_path: "new-file.txt".into(),
                last_modified: 1_754_000_000_000,
                etag: "abc123".into(),
                size: 18,
                synced_at: 1_754_000_001_000,
            },
        );
        state.last_poll_at = Some(1_754_000_001_000);
        state.save(&path).unwrap();

        let loaded = SyncState::load(&path, "user1", "user1/hq/").unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.entries["new-file.txt"].etag, "abc123");
    }

    #[test]
    fn save_leaves_no_temp_litter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        SyncState::new("u", "p").save(&path).unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![STATE_FILE_NAME.to_string()]);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        std::fs::write(&path, "{half a document").unwrap();
        assert!(SyncState::load(&path, "u", "p").is_err());
    }

    #[test]
    fn wire_schema_uses_camel_case() {
        let state = SyncState::new("user1", "user1/hq/");
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["userId"], "user1");
        assert_eq!(json["s3Prefix"], "user1/hq/");
        assert!(json.get("lastPollAt").is_some());
    }
}
