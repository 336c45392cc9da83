//! Object storage for final artifacts.

use async_trait::async_trait;
use dashmap::DashMap;

/// Stores generated bytes and returns a public URL.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Uploads `bytes` under `key`, replacing any existing object.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> anyhow::Result<String>;
}

/// Builds the artifact key for one generated item.
#[must_use]
pub fn artifact_key(owner_id: &str, pipeline_id: &str, stage: &str, index: usize, extension: &str) -> String {
    format!("{owner_id}/{pipeline_id}/{stage}/{index:03}.{extension}")
}

/// A stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Object bytes.
    pub bytes: Vec<u8>,
    /// MIME type.
    pub content_type: String,
}

/// Artifact store held in memory.
#[derive(Debug)]
pub struct InMemoryArtifactStore {
    base_url: String,
    objects: DashMap<String, StoredObject>,
}

impl Default for InMemoryArtifactStore {
    fn default() -> Self {
        Self::new("memory://artifacts")
    }
}

impl InMemoryArtifactStore {
    /// Creates a store whose URLs start with `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            objects: DashMap::new(),
        }
    }

    /// Reads an object back.
    #[must_use]
    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.get(key).map(|o| o.clone())
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> anyhow::Result<String> {
        self.objects.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(format!("{}/{key}", self.base_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_returns_url_and_overwrites() {
        let store = InMemoryArtifactStore::new("https://cdn.example/");
        let key = artifact_key("u1", "p1", "images", 2, "png");
        assert_eq!(key, "u1/p1/images/002.png");

        let url = store.put(&key, vec![1], "image/png").await.unwrap();
        assert_eq!(url, "https://cdn.example/u1/p1/images/002.png");
        store.put(&key, vec![2, 3], "image/png").await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.object(&key).unwrap().bytes, vec![2, 3]);
    }
}
