// SPDX-License-Identifier: GPL-2.0-or-later

use adaptive::Presentation;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

// Caches the n most recently used presentations.
pub struct PresentationCache(Mutex<State>);

struct State {
    items: HashMap<String, CacheItem>,
    age: usize,

    max_size: usize,
}

struct CacheItem {
    age: usize,
    data: Arc<Presentation>,
}

impl PresentationCache {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self(Mutex::new(State {
            items: HashMap::new(),
            age: 0,
            max_size: max_size.max(1),
        }))
    }

    pub(crate) async fn add(&self, key: String, presentation: Arc<Presentation>) {
        self.0.lock().await.add(key, presentation);
    }

    pub(crate) async fn get(&self, key: &str) -> Option<Arc<Presentation>> {
        self.0.lock().await.get(key)
    }
}

impl State {
    fn add(&mut self, key: String, presentation: Arc<Presentation>) {
        // Ignore duplicate keys.
        if self.items.contains_key(&key) {
            return;
        }

        self.age += 1;

        if self.items.len() >= self.max_size {
            // Delete the oldest item.
            let (key, _) = self
                .items
                .iter()
                .min_by_key(|(_, v)| v.age)
                .expect("len > max_size");
            self.items.remove(&key.to_owned());
        }

        self.items.insert(
            key,
            CacheItem {
                age: self.age,
                data: presentation,
            },
        );
    }

    fn get(&mut self, key: &str) -> Option<Arc<Presentation>> {
        let item = self.items.get_mut(key)?;
        self.age += 1;
        item.age = self.age;
        Some(item.data.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use adaptive::StreamType;
    use playready::{DrmType, KeySeed};

    fn empty() -> Arc<Presentation> {
        Arc::new(Presentation {
            content_id: String::new(),
            stream_type: StreamType::Ism,
            drm_type: DrmType::Clear,
            duration: 0,
            max_width: 0,
            max_height: 0,
            video_levels: Vec::new(),
            audio_levels: Vec::new(),
            kid: [0; 16],
            content_key: KeySeed::from_hex(playready::DEMO_KEY_SEED)
                .unwrap()
                .generate_content_key(&[0; 16]),
            protection_header: None,
            movies: Vec::new(),
        })
    }

    #[tokio::test]
    async fn test_presentation_cache() {
        let cache = PresentationCache::new(3);

        // Fill cache.
        cache.add("1".to_owned(), empty()).await;
        cache.add("2".to_owned(), empty()).await;
        cache.add("3".to_owned(), empty()).await;

        // Add item and check that 1 was evicted.
        cache.add("4".to_owned(), empty()).await;
        assert!(cache.get("1").await.is_none());

        // Touch 2 to make it the newest item.
        cache.get("2").await;

        // Add item and check that 3 was evicted instead of 2.
        cache.add("5".to_owned(), empty()).await;
        assert!(cache.get("3").await.is_none());
        assert!(cache.get("2").await.is_some());

        // Duplicate keys are ignored.
        cache.add("5".to_owned(), empty()).await;
        assert!(cache.get("5").await.is_some());
    }
}
