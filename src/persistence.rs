/// Persistence of a model's control state.
///
/// Edge data lives in partition files; this module only stores the small
/// control record that ties them together: options, rings, the link
/// counter, resharding progress and the deferred-write backlog.
///
/// # File Format
///
/// `<model_dir>/model.state` holds a zstd frame wrapping a bincode
/// [`ModelState`] snapshot tagged with a format version. Writes go to a
/// temporary file which is then renamed over the old state, so a crash
/// leaves either the previous or the new state on disk, never a mix.
///
/// # Usage
///
/// ```ignore
/// persistence::save(&model_dir, &state).await?;
/// let state = persistence::load(&model_dir).await?;
/// ```
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::error::{ChainError, ChainResult};
use crate::model::ModelState;

const STATE_FILE: &str = "model.state";
const SNAPSHOT_VERSION: u32 = 1;
const ZSTD_LEVEL: i32 = 3;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    state: &'a ModelState,
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    state: ModelState,
}

/// Path of the control-state file inside a model directory.
pub fn state_path(model_dir: &Path) -> PathBuf {
    model_dir.join(STATE_FILE)
}

/// Write `state` atomically.
///
/// # Errors
///
/// Returns `ChainError::StorageIo` if the directory cannot be created or the
/// file cannot be written or renamed.
pub async fn save(model_dir: &Path, state: &ModelState) -> ChainResult<()> {
    fs::create_dir_all(model_dir)
        .await
        .map_err(|e| ChainError::io(model_dir, e))?;

    let snapshot = SnapshotRef {
        version: SNAPSHOT_VERSION,
        state,
    };
    let encoded = bincode::serialize(&snapshot)?;
    let compressed = zstd::encode_all(encoded.as_slice(), ZSTD_LEVEL)
        .map_err(|e| ChainError::Serialization(format!("zstd: {}", e)))?;

    let path = state_path(model_dir);
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, &compressed)
        .await
        .map_err(|e| ChainError::io(&temp_path, e))?;
    fs::rename(&temp_path, &path)
        .await
        .map_err(|e| ChainError::io(&path, e))?;

    debug!(path = %path.display(), bytes = compressed.len(), "Saved model state");
    Ok(())
}

/// Read the control state of an existing model.
///
/// # Errors
///
/// `ChainError::StorageIo` if the file cannot be read and
/// `ChainError::CorruptState` if it cannot be decoded.
pub async fn load(model_dir: &Path) -> ChainResult<ModelState> {
    let path = state_path(model_dir);
    let compressed = fs::read(&path)
        .await
        .map_err(|e| ChainError::io(&path, e))?;

    let corrupt = |reason: String| ChainError::CorruptState {
        path: path.clone(),
        reason,
    };
    let encoded = zstd::decode_all(compressed.as_slice()).map_err(|e| corrupt(e.to_string()))?;
    let snapshot: Snapshot = bincode::deserialize(&encoded).map_err(|e| corrupt(e.to_string()))?;

    if snapshot.version != SNAPSHOT_VERSION {
        return Err(corrupt(format!(
            "unsupported state version {}",
            snapshot.version
        )));
    }
    Ok(snapshot.state)
}

/// Check if a model directory has saved control state.
pub async fn exists(model_dir: &Path) -> bool {
    fs::try_exists(state_path(model_dir)).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ModelOptions;
    use crate::transition::TrainRequest;
    use crate::types::Token;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let mut state = ModelState::new(ModelOptions::with_order(3));
        state.total_link_count = 42;
        state.deferred.push_back(TrainRequest {
            tokens: vec![Token::text("later")],
            tags: vec![],
        });

        assert!(!exists(dir.path()).await);
        save(dir.path(), &state).await.unwrap();
        assert!(exists(dir.path()).await);

        let loaded = load(dir.path()).await.unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let mut state = ModelState::new(ModelOptions::default());
        save(dir.path(), &state).await.unwrap();
        state.total_link_count = 7;
        save(dir.path(), &state).await.unwrap();

        assert!(!state_path(dir.path()).with_extension("tmp").exists());
        assert_eq!(load(dir.path()).await.unwrap().total_link_count, 7);
    }

    #[tokio::test]
    async fn test_garbage_is_corrupt_state() {
        let dir = TempDir::new().unwrap();
        std::fs::write(state_path(dir.path()), b"definitely not zstd").unwrap();

        let result = load(dir.path()).await;
        assert!(matches!(result, Err(ChainError::CorruptState { .. })));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let result = load(dir.path()).await;
        assert!(matches!(result, Err(ChainError::StorageIo { .. })));
    }
}
