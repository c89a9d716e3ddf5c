use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::Phase;

/// Schema version written to new state files.
pub const STATE_VERSION: u32 = 1;

/// Failure reading or writing the state file.
#[derive(Debug, Error)]
pub enum StateError {
    /// Filesystem failure
    #[error("state file {}: {source}", .path.display())]
    Io {
        /// State file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid state JSON
    #[error("state file {} is corrupt: {source}", .path.display())]
    Parse {
        /// State file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },

    /// The file was written by a newer release
    #[error("state file {} has schema version {found}; this release understands up to {supported}", .path.display())]
    UnsupportedVersion {
        /// State file
        path: PathBuf,
        /// Version in the file
        found: u32,
        /// Highest supported version
        supported: u32,
    },
}

fn default_version() -> u32 {
    STATE_VERSION
}

/// Persisted installation progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallState {
    /// Schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Last phase whose provisioners all verified.
    pub phase: Phase,
    /// Installation path, fixed once dependencies are ready.
    #[serde(default)]
    pub project_path: Option<PathBuf>,
    /// Time of the last commit.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for InstallState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            phase: Phase::NotStarted,
            project_path: None,
            updated_at: None,
        }
    }
}

impl InstallState {
    /// Load state, defaulting to `NotStarted` when no file exists.
    pub fn load_or_default(path: &Path) -> Result<Self, StateError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(StateError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let state: Self = serde_json::from_slice(&bytes).map_err(|source| StateError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if state.version > STATE_VERSION {
            return Err(StateError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: state.version,
                supported: STATE_VERSION,
            });
        }
        Ok(state)
    }

    /// Persist state atomically: write a sibling temp file, then rename over.
    pub fn save_to_path(&self, path: &Path) -> Result<(), StateError> {
        let io = |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io)?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(|source| StateError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).map_err(io)?;
        file.write_all(&json).map_err(io)?;
        file.write_all(b"\n").map_err(io)?;
        file.sync_all().map_err(io)?;
        fs::rename(&tmp, path).map_err(io)?;
        Ok(())
    }

    /// Record `phase` as completed. The stored phase never decreases.
    pub fn commit(&mut self, phase: Phase) {
        self.phase = self.phase.max(phase);
        self.version = STATE_VERSION;
        self.updated_at = Some(Utc::now());
    }

    /// Remove the state file, if present.
    pub fn remove(path: &Path) -> Result<bool, StateError> {
        match fs::remove_file(path) {
            Ok(()) => {
                info!(state = %path.display(), "removed installation state");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StateError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn state_roundtrip_save_and_load() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("state.json");

        let mut state = InstallState::default();
        state.commit(Phase::DependenciesReady);
        state.project_path = Some(PathBuf::from("/srv/shop"));
        state.save_to_path(&file).expect("save state");

        let loaded = InstallState::load_or_default(&file).expect("load state");
        assert_eq!(loaded, state);
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn missing_state_defaults_to_not_started() {
        let dir = tempdir().expect("tempdir");
        let state = InstallState::load_or_default(&dir.path().join("missing.json")).expect("load");
        assert_eq!(state.phase, Phase::NotStarted);
        assert!(state.project_path.is_none());
    }

    #[test]
    fn commit_never_lowers_phase() {
        let mut state = InstallState::default();
        state.commit(Phase::Complete);
        state.commit(Phase::ResourcesProvisioned);
        assert_eq!(state.phase, Phase::Complete);
    }

    #[test]
    fn hand_written_state_is_accepted() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("state.json");
        fs::write(&file, r#"{"phase": "complete"}"#).expect("write");

        let state = InstallState::load_or_default(&file).expect("load");
        assert_eq!(state.phase, Phase::Complete);
        assert_eq!(state.version, STATE_VERSION);
    }

    #[test]
    fn future_schema_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("state.json");
        fs::write(&file, r#"{"version": 99, "phase": "complete"}"#).expect("write");

        let err = InstallState::load_or_default(&file).expect_err("must fail");
        assert!(matches!(err, StateError::UnsupportedVersion { found: 99, .. }));
    }

    #[test]
    fn corrupt_state_is_reported() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("state.json");
        fs::write(&file, "phase = complete").expect("write");

        let err = InstallState::load_or_default(&file).expect_err("must fail");
        assert!(matches!(err, StateError::Parse { .. }));
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("state.json");
        InstallState::default().save_to_path(&file).expect("save");

        assert!(InstallState::remove(&file).expect("remove"));
        assert!(!InstallState::remove(&file).expect("remove again"));
    }
}
