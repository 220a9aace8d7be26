use std::path::Path;

use log::trace;
use matrix_sdk::authentication::matrix;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::BootstrapError;

/// Session data persisted in the store directory.
///
/// Contains the Matrix user session and optional sync token.
/// This is serialized to JSON and persisted to disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct PersistedState {
    /// The Matrix user session: user, device and access token.
    ///
    /// Its device is the one whose encryption keys live in this store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_session: Option<matrix::MatrixSession>,

    /// The latest sync token for resuming sync operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_token: Option<String>,
}

impl PersistedState {
    /// Load the state from disk.
    ///
    /// A missing file is an empty state. A file that cannot be read or parsed
    /// is an error: guessing would risk running a device against the wrong keys.
    pub async fn load(path: &Path) -> Result<PersistedState, BootstrapError> {
        let data = match fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedState::default());
            }
            Err(e) => {
                return Err(BootstrapError::StoreUnavailable(format!(
                    "cannot read {}: {e}",
                    path.display()
                )));
            }
        };

        serde_json::from_str(&data).map_err(|e| {
            BootstrapError::StoreUnavailable(format!("corrupted session file {}: {e}", path.display()))
        })
    }

    /// Writes the state next to `path` then renames it over `path`, so a crash
    /// never leaves a truncated file behind.
    pub async fn save(&self, path: &Path) -> Result<(), BootstrapError> {
        trace!("persist session state to {}", path.display());

        let serialized = serde_json::to_string(self)
            .map_err(|e| BootstrapError::StoreUnavailable(e.to_string()))?;
        let temp_path = path.with_extension("tmp");

        let write_error = |e: std::io::Error| {
            BootstrapError::StoreUnavailable(format!("cannot write {}: {e}", path.display()))
        };
        fs::write(&temp_path, serialized).await.map_err(write_error)?;
        fs::rename(&temp_path, path).await.map_err(write_error)?;

        trace!("session state persisted");
        Ok(())
    }

    pub fn device_id(&self) -> Option<String> {
        self.user_session
            .as_ref()
            .map(|session| session.meta.device_id.to_string())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use matrix_sdk::{SessionMeta, SessionTokens};
    use tempfile::TempDir;

    // Helper function to create a mock MatrixSession
    pub(crate) fn create_mock_matrix_session(device_id: &str) -> matrix::MatrixSession {
        let session_meta = SessionMeta {
            user_id: "@edubot:example.com".try_into().unwrap(),
            device_id: device_id.into(),
        };

        let tokens = SessionTokens {
            access_token: "syt_stored".to_string(),
            refresh_token: None,
        };

        matrix::MatrixSession {
            meta: session_meta,
            tokens,
        }
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let state = PersistedState::load(&temp_dir.path().join("session"))
            .await
            .unwrap();

        assert!(state.user_session.is_none());
        assert!(state.sync_token.is_none());
        assert!(state.device_id().is_none());
    }

    #[tokio::test]
    async fn test_load_invalid_json_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session");
        fs::write(&path, "invalid json").await.unwrap();

        assert!(matches!(
            PersistedState::load(&path).await,
            Err(BootstrapError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session");

        let state = PersistedState {
            user_session: Some(create_mock_matrix_session("EDUBOT")),
            sync_token: Some("s72594_4483_1934".to_string()),
        };
        state.save(&path).await.unwrap();

        assert!(!temp_dir.path().join("session.tmp").exists());

        let loaded = PersistedState::load(&path).await.unwrap();
        assert_eq!(loaded.device_id().as_deref(), Some("EDUBOT"));
        assert_eq!(loaded.sync_token.as_deref(), Some("s72594_4483_1934"));
        assert_eq!(
            loaded.user_session.unwrap().meta.user_id.to_string(),
            "@edubot:example.com"
        );
    }

    #[test]
    fn test_serialization_omits_empty_fields() {
        let serialized = serde_json::to_string(&PersistedState::default()).unwrap();
        assert_eq!(serialized, "{}");

        let state = PersistedState {
            user_session: None,
            sync_token: Some("token".to_string()),
        };
        let serialized = serde_json::to_string(&state).unwrap();
        assert!(!serialized.contains("user_session"));
        assert!(serialized.contains("token"));
    }
}
