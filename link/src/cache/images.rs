//! Image cache

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::ImagePayload;

/// Images kept when no capacity is configured
pub const DEFAULT_CAPACITY: usize = 20;

/// Image cache entry
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub image: ImagePayload,
    pub metadata: Option<Value>,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Slot {
    entry: CachedImage,
    last_access: u64,
}

/// In-memory LRU cache of downloaded images keyed by filename
#[derive(Debug)]
pub struct ImageCache {
    entries: Mutex<HashMap<String, Slot>>,
    capacity: usize,
    clock: AtomicU64,
}

impl ImageCache {
    /// Create a new image cache. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Get an image, marking it most recently used
    pub fn get(&self, filename: &str) -> Option<CachedImage> {
        let now = self.tick();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let slot = entries.get_mut(filename)?;
        slot.last_access = now;
        Some(slot.entry.clone())
    }

    /// Whether `filename` is cached, without touching recency
    pub fn contains(&self, filename: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(filename)
    }

    /// Insert or replace an image. Returns the filename evicted to make room.
    pub fn insert(&self, image: ImagePayload, metadata: Option<Value>) -> Option<String> {
        let now = self.tick();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        // Evict least recently used if at capacity
        let mut evicted = None;
        if !entries.contains_key(&image.filename) && entries.len() >= self.capacity {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, slot)| slot.last_access)
                .map(|(filename, _)| filename.clone())
            {
                entries.remove(&oldest);
                evicted = Some(oldest);
            }
        }

        let filename = image.filename.clone();
        let entry = CachedImage {
            image,
            metadata,
            cached_at: Utc::now(),
        };
        entries.insert(filename, Slot { entry, last_access: now });
        evicted
    }

    /// Attach metadata to a cached image
    pub fn set_metadata(&self, filename: &str, metadata: Value) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(filename) {
            Some(slot) => {
                slot.entry.metadata = Some(metadata);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, filename: &str) -> Option<CachedImage> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(filename).map(|slot| slot.entry)
    }

    /// Clear the cache
    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ImageCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
