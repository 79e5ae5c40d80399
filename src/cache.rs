//! Memo table for per-image descriptions.
//!
//! Flat key-value map, no eviction. Keys are SHA-256 digests of
//! `(image URL, requested room type, target group)` so a user-corrected room
//! type or a different audience produces a fresh description.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::schema::{RoomType, TargetGroup};

/// Cached model output for one photo.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedDescription {
    pub room_type: RoomType,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct DescriptionCache {
    inner: Arc<RwLock<HashMap<String, CachedDescription>>>,
}

impl DescriptionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Composite cache key. `None` room type means "let the model classify".
    pub fn key(url: &str, room_type: Option<RoomType>, group: TargetGroup) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.trim().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(room_type.map(|r| r.as_str()).unwrap_or("auto").as_bytes());
        hasher.update(b"\x1f");
        hasher.update(group.as_str().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<CachedDescription> {
        self.inner.read().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: String, value: CachedDescription) {
        let mut store = self.inner.write().unwrap();
        store.insert(key, value);
        tracing::debug!("DescriptionCache: {} entries", store.len());
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_distinguishes_components() {
        let url = "https://cdn.example.no/a.jpg";
        let auto = DescriptionCache::key(url, None, TargetGroup::Standard);
        let kitchen = DescriptionCache::key(url, Some(RoomType::Kitchen), TargetGroup::Standard);
        let family = DescriptionCache::key(url, None, TargetGroup::Family);

        assert_ne!(auto, kitchen);
        assert_ne!(auto, family);
        assert_eq!(auto, DescriptionCache::key(url, None, TargetGroup::Standard));
        assert_eq!(auto.len(), 64);
    }

    #[test]
    fn test_store_and_retrieve() {
        let cache = DescriptionCache::new();
        assert!(cache.is_empty());

        let key = DescriptionCache::key("u", None, TargetGroup::Investor);
        cache.insert(
            key.clone(),
            CachedDescription {
                room_type: RoomType::Bathroom,
                description: "Flislagt bad.".to_string(),
            },
        );

        let hit = cache.get(&key).unwrap();
        assert_eq!(hit.room_type, RoomType::Bathroom);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn test_clones_share_entries() {
        let cache = DescriptionCache::new();
        let other = cache.clone();
        other.insert(
            "k".to_string(),
            CachedDescription {
                room_type: RoomType::Other,
                description: String::new(),
            },
        );
        assert_eq!(cache.len(), 1);
    }
}
