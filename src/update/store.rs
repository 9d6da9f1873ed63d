//! Local cache of the last accepted script.

use std::io;
use std::path::{Path, PathBuf};

use crate::error::AgentError;

/// Reads and writes the cached script file.
#[derive(Clone, Debug)]
pub struct ScriptStore {
    path: PathBuf,
}

impl ScriptStore {
    /// Creates a store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the cache location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the cached bytes, or `None` if nothing was cached yet.
    pub async fn load(&self) -> Result<Option<Vec<u8>>, AgentError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.err(e)),
        }
    }

    /// Replaces the cached script.
    ///
    /// Writes a sibling temp file first, then renames it over the old one.
    pub async fn save(&self, bytes: &[u8]) -> Result<(), AgentError> {
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await.map_err(|e| self.err(e))?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, bytes).await.map_err(|e| self.err(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.err(e))
    }

    fn err(&self, source: io::Error) -> AgentError {
        AgentError::Store {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScriptStore::new(dir.path().join("script.lua"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScriptStore::new(dir.path().join("sub").join("script.lua"));
        store.save(b"v1").await.unwrap();
        store.save(b"v2").await.unwrap();
        assert_eq!(store.load().await.unwrap().as_deref(), Some(&b"v2"[..]));
        assert!(!dir.path().join("sub").join("script.lua.tmp").exists());
    }

    #[tokio::test]
    async fn test_unwritable_location_is_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let store = ScriptStore::new(blocker.join("script.lua"));
        let err = store.save(b"x").await.unwrap_err();
        assert_eq!(err.as_label(), "store_failed");
    }
}
