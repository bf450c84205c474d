// ABOUTME: On-disk session marker used to resume after a crash
// ABOUTME: Best-effort JSON file naming the replication set last touched

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Marker file in the working directory. No transactional guarantees: a
/// crash mid-batch rolls the destination back, and resuming simply re-enters
/// the named replication set.
pub const SESSION_FILE: &str = "current_session.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SessionMarker {
    pub in_progress: bool,
    pub destination_name: String,
}

pub fn default_path() -> PathBuf {
    PathBuf::from(SESSION_FILE)
}

/// Load the marker, defaulting to a cleared one when the file is absent.
pub fn load(path: &Path) -> Result<SessionMarker> {
    if !path.exists() {
        return Ok(SessionMarker::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read session marker from {:?}", path))?;
    let marker = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse session marker from {:?}", path))?;
    Ok(marker)
}

pub fn save(path: &Path, marker: &SessionMarker) -> Result<()> {
    let contents =
        serde_json::to_string_pretty(marker).context("Failed to serialize session marker")?;
    fs::write(path, contents)
        .with_context(|| format!("Failed to write session marker to {:?}", path))?;
    Ok(())
}

pub fn clear(path: &Path) -> Result<()> {
    save(path, &SessionMarker::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_loads_default() {
        let dir = tempdir().unwrap();
        let marker = load(&dir.path().join(SESSION_FILE)).unwrap();
        assert_eq!(marker, SessionMarker::default());
        assert!(!marker.in_progress);
    }

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(SESSION_FILE);

        let marker = SessionMarker {
            in_progress: true,
            destination_name: "main".to_string(),
        };
        save(&path, &marker).unwrap();
        assert_eq!(load(&path).unwrap(), marker);

        clear(&path).unwrap();
        assert_eq!(load(&path).unwrap(), SessionMarker::default());
    }

    #[test]
    fn test_file_uses_pascal_case_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(SESSION_FILE);
        save(
            &path,
            &SessionMarker {
                in_progress: true,
                destination_name: "main".to_string(),
            },
        )
        .unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"InProgress\": true"));
        assert!(raw.contains("\"DestinationName\": \"main\""));
    }
}
