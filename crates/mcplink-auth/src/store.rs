//! Key/value storage backends for OAuth state.
//!
//! The OAuth provider is written against a uniform async key/value contract
//! so the same flow logic works over a file on disk or session-only memory.

use crate::error::{AuthError, AuthResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Uniform async key/value contract backing the OAuth provider.
///
/// Values are opaque strings; the provider decides what is JSON and what is
/// plain text. Writes are last-writer-wins with no locking - keys are
/// namespaced per server, and concurrent writers to the same server are not
/// a supported scenario.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the value for a key, or `None` if absent.
    async fn get(&self, key: &str) -> AuthResult<Option<String>>;

    /// Set the value for a key, creating it if needed.
    async fn set(&self, key: &str, value: String) -> AuthResult<()>;

    /// Delete a key. Returns `true` if the key existed.
    async fn delete(&self, key: &str) -> AuthResult<bool>;

    /// Enumerate all stored keys.
    async fn keys(&self) -> AuthResult<Vec<String>>;
}

/// File-backed store: a single JSON object on disk.
///
/// The file is created with restrictive permissions (0600 on Unix).
/// An unreadable or corrupt file is tolerated as empty with a warning so a
/// damaged entry can never lock the user out of re-authenticating.
pub struct FileStore {
    /// Path to the storage file.
    path: PathBuf,
    /// In-memory cache of the file contents.
    cache: RwLock<Option<HashMap<String, String>>>,
}

impl FileStore {
    /// Create a file store using the default platform path.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be determined.
    pub fn new() -> AuthResult<Self> {
        let path = crate::default_store_path().ok_or(AuthError::NoDataDir)?;
        Ok(Self::with_path(path))
    }

    /// Create a file store with a custom path.
    ///
    /// Useful for testing or custom configurations.
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            cache: RwLock::new(None),
        }
    }

    /// Get the path to the storage file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn all(&self) -> AuthResult<HashMap<String, String>> {
        {
            let cache = self.cache.read().await;
            if let Some(data) = &*cache {
                return Ok(data.clone());
            }
        }

        let data = self.read_all().await?;
        *self.cache.write().await = Some(data.clone());
        Ok(data)
    }

    /// Read all entries from the file.
    async fn read_all(&self) -> AuthResult<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }

        // Parse as raw JSON first, then validate each entry
        let raw: HashMap<String, serde_json::Value> = match serde_json::from_str(&content) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Storage file is corrupt; treating as empty");
                return Ok(HashMap::new());
            }
        };

        let mut result = HashMap::new();
        for (key, value) in raw {
            match value {
                serde_json::Value::String(s) => {
                    result.insert(key, s);
                }
                other => {
                    warn!(key = %key, value = %other, "Skipping non-string storage entry");
                }
            }
        }

        Ok(result)
    }

    /// Write all entries to the file.
    async fn write_all(&self, data: &HashMap<String, String>) -> AuthResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(data)?;
        tokio::fs::write(&self.path, &content).await?;

        // Set restrictive permissions on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.path, perms)
                .await
                .map_err(|e| {
                    AuthError::Permissions(format!(
                        "Failed to set permissions on {:?}: {}",
                        self.path, e
                    ))
                })?;
        }

        debug!(path = ?self.path, entries = data.len(), "Wrote storage file");
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> AuthResult<Option<String>> {
        let all = self.all().await?;
        Ok(all.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> AuthResult<()> {
        let mut all = self.all().await?;
        all.insert(key.to_string(), value);
        self.write_all(&all).await?;
        *self.cache.write().await = Some(all);
        Ok(())
    }

    async fn delete(&self, key: &str) -> AuthResult<bool> {
        let mut all = self.all().await?;
        let existed = all.remove(key).is_some();
        if existed {
            self.write_all(&all).await?;
            *self.cache.write().await = Some(all);
        }
        Ok(existed)
    }

    async fn keys(&self) -> AuthResult<Vec<String>> {
        let all = self.all().await?;
        Ok(all.keys().cloned().collect())
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore").field("path", &self.path).finish()
    }
}

/// Session-only in-memory store.
///
/// Nothing survives the process; useful for tests and for environments that
/// must not persist tokens to disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> AuthResult<Option<String>> {
        Ok(self.map.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> AuthResult<()> {
        self.map.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> AuthResult<bool> {
        Ok(self.map.write().await.remove(key).is_some())
    }

    async fn keys(&self) -> AuthResult<Vec<String>> {
        Ok(self.map.read().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_store() -> (FileStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oauth.json");
        (FileStore::with_path(path), dir)
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let (store, _dir) = file_store();

        store.set("key1", "value1".to_string()).await.unwrap();
        assert_eq!(store.get("key1").await.unwrap(), Some("value1".to_string()));
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (store, _dir) = file_store();
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, _dir) = file_store();

        store.set("key1", "value1".to_string()).await.unwrap();
        assert!(store.delete("key1").await.unwrap());
        assert!(!store.delete("key1").await.unwrap());
        assert_eq!(store.get("key1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_enumeration() {
        let (store, _dir) = file_store();

        store.set("a", "1".to_string()).await.unwrap();
        store.set("b", "2".to_string()).await.unwrap();

        let mut keys = store.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_persistence_across_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oauth.json");

        {
            let store = FileStore::with_path(path.clone());
            store.set("key", "value".to_string()).await.unwrap();
        }

        {
            let store = FileStore::with_path(path);
            assert_eq!(store.get("key").await.unwrap(), Some("value".to_string()));
        }
    }

    #[tokio::test]
    async fn test_corrupt_file_treated_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oauth.json");
        tokio::fs::write(&path, "not json at all {{{").await.unwrap();

        let store = FileStore::with_path(path);
        assert_eq!(store.get("anything").await.unwrap(), None);

        // Writes still work after recovering from corruption
        store.set("key", "value".to_string()).await.unwrap();
        assert_eq!(store.get("key").await.unwrap(), Some("value".to_string()));
    }

    #[tokio::test]
    async fn test_non_string_entry_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oauth.json");
        tokio::fs::write(&path, r#"{"good": "text", "bad": {"nested": 1}}"#)
            .await
            .unwrap();

        let store = FileStore::with_path(path);
        assert_eq!(store.get("good").await.unwrap(), Some("text".to_string()));
        assert_eq!(store.get("bad").await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (store, _dir) = file_store();
        store.set("key", "value".to_string()).await.unwrap();

        let metadata = std::fs::metadata(store.path()).unwrap();
        let mode = metadata.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();

        store.set("key", "value".to_string()).await.unwrap();
        assert_eq!(store.get("key").await.unwrap(), Some("value".to_string()));
        assert!(store.delete("key").await.unwrap());
        assert!(store.keys().await.unwrap().is_empty());
    }
}
