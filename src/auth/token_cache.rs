use crate::error::{Result, TeslaError};
use crate::models::{OwnerApiToken, SsoToken};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One identity's slice of the cache document: the regional SSO base URL it
/// was last authorized against plus both token blobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sso: Option<SsoToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ownerapi: Option<OwnerApiToken>,
}

/// Token cache persisting one JSON document keyed by identity.
///
/// The document is shared external state: other identities' entries are
/// loaded, kept verbatim and written back, and the file is replaced by an
/// atomic rename so a concurrent writer for another identity is never left
/// with a torn file.
pub struct TokenCache {
    cache_file: PathBuf,
}

impl TokenCache {
    pub fn new(cache_file: PathBuf) -> Self {
        Self { cache_file }
    }

    /// Default cache location under the platform cache directory.
    pub fn default_path() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("teslars")
            .join("cache.json")
    }

    pub fn path(&self) -> &Path {
        &self.cache_file
    }

    /// Load the whole cache document. A missing or malformed file is the
    /// steady state for a first run and yields an empty document.
    fn load_document(&self) -> serde_json::Map<String, serde_json::Value> {
        match fs::read_to_string(&self.cache_file) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(serde_json::Value::Object(map)) => map,
                _ => {
                    tracing::warn!("Cache file is not a JSON object, ignoring");
                    serde_json::Map::new()
                }
            },
            Err(_) => serde_json::Map::new(),
        }
    }

    /// Get the cached entry for an identity, or `None` when absent or
    /// unreadable. Never fails on a missing cache.
    pub fn load(&self, identity: &str) -> Option<CacheEntry> {
        let document = self.load_document();
        let value = document.get(identity)?.clone();
        match serde_json::from_value(value) {
            Ok(entry) => {
                tracing::debug!("Loaded cached tokens for {}", identity);
                Some(entry)
            }
            Err(e) => {
                tracing::warn!("Malformed cache entry for {}: {}", identity, e);
                None
            }
        }
    }

    /// Store the entry for one identity, preserving every other key in the
    /// document, and replace the file atomically.
    pub fn store(&self, identity: &str, entry: &CacheEntry) -> Result<()> {
        let mut document = self.load_document();
        document.insert(identity.to_string(), serde_json::to_value(entry)?);
        self.write_document(&document)?;
        tracing::debug!("Updated cache entry for {}", identity);
        Ok(())
    }

    /// Remove the entry for one identity (logout). Other entries survive.
    pub fn remove(&self, identity: &str) -> Result<()> {
        let mut document = self.load_document();
        if document.remove(identity).is_some() {
            self.write_document(&document)?;
            tracing::debug!("Removed cache entry for {}", identity);
        }
        Ok(())
    }

    fn write_document(&self, document: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        if let Some(parent) = self.cache_file.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string(document)?;
        let tmp = self.cache_file.with_extension("json.tmp");
        fs::write(&tmp, json)
            .map_err(|e| TeslaError::Cache(format!("Failed to write cache file: {}", e)))?;
        fs::rename(&tmp, &self.cache_file)
            .map_err(|e| TeslaError::Cache(format!("Failed to replace cache file: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(marker: &str) -> CacheEntry {
        CacheEntry {
            url: Some("https://auth.tesla.com/".to_string()),
            sso: Some(SsoToken {
                access_token: format!("sso-{}", marker),
                refresh_token: Some(format!("refresh-{}", marker)),
                id_token: None,
                token_type: "Bearer".to_string(),
                expires_at: 2_000_000_000,
            }),
            ownerapi: Some(OwnerApiToken {
                access_token: format!("api-{}", marker),
                refresh_token: None,
                token_type: "bearer".to_string(),
                created_at: 1_900_000_000,
                expires_in: 3600,
            }),
        }
    }

    #[test]
    fn test_missing_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(dir.path().join("cache.json"));
        assert!(cache.load("elon@example.com").is_none());
    }

    #[test]
    fn test_malformed_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "not json at all").unwrap();
        let cache = TokenCache::new(path);
        assert!(cache.load("elon@example.com").is_none());
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(dir.path().join("cache.json"));
        cache.store("a@example.com", &sample_entry("a")).unwrap();

        let loaded = cache.load("a@example.com").unwrap();
        assert_eq!(loaded.sso.unwrap().access_token, "sso-a");
        assert_eq!(loaded.ownerapi.unwrap().access_token, "api-a");
        assert_eq!(loaded.url.as_deref(), Some("https://auth.tesla.com/"));
    }

    #[test]
    fn test_store_preserves_other_identities() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(dir.path().join("cache.json"));
        cache.store("a@example.com", &sample_entry("a")).unwrap();
        cache.store("b@example.com", &sample_entry("b")).unwrap();

        let a = cache.load("a@example.com").unwrap();
        let b = cache.load("b@example.com").unwrap();
        assert_eq!(a.sso.unwrap().access_token, "sso-a");
        assert_eq!(b.sso.unwrap().access_token, "sso-b");
    }

    #[test]
    fn test_store_preserves_foreign_keys_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(
            &path,
            r#"{"other@example.com": {"custom": "shape", "url": 42}}"#,
        )
        .unwrap();

        let cache = TokenCache::new(path.clone());
        cache.store("a@example.com", &sample_entry("a")).unwrap();

        let document: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(document["other@example.com"]["custom"], "shape");
        assert_eq!(document["other@example.com"]["url"], 42);
    }

    #[test]
    fn test_remove_only_touches_own_identity() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(dir.path().join("cache.json"));
        cache.store("a@example.com", &sample_entry("a")).unwrap();
        cache.store("b@example.com", &sample_entry("b")).unwrap();

        cache.remove("a@example.com").unwrap();
        assert!(cache.load("a@example.com").is_none());
        assert!(cache.load("b@example.com").is_some());
    }
}
