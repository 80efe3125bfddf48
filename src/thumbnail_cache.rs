//! In-memory thumbnail byte cache with a total size budget.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;

use crate::retrievers::http::HttpClient;
use crate::retrievers::{CancelToken, HttpTimeouts, RetrieverError};

pub const DEFAULT_BUDGET_BYTES: usize = 32 * 1024 * 1024;
pub const MAX_THUMBNAIL_BYTES: usize = 4 * 1024 * 1024;
const CACHE_CLIENT_NAME: &str = "ThumbnailCache";

#[derive(Default)]
struct Entries {
    bytes_by_url: HashMap<String, Arc<[u8]>>,
    /// Insertion order, oldest first.
    order: VecDeque<String>,
    total_bytes: usize,
}

impl Entries {
    fn evict_until_fits(&mut self, incoming: usize, budget: usize) {
        while self.total_bytes + incoming > budget {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(bytes) = self.bytes_by_url.remove(&oldest) {
                self.total_bytes = self.total_bytes.saturating_sub(bytes.len());
                debug!("Evicted thumbnail {} ({} bytes)", oldest, bytes.len());
            }
        }
    }
}

pub struct ThumbnailCache {
    http: HttpClient,
    budget_bytes: usize,
    entries: Mutex<Entries>,
}

impl ThumbnailCache {
    pub fn new(timeouts: HttpTimeouts, budget_bytes: usize) -> Self {
        Self {
            http: HttpClient::new(CACHE_CLIENT_NAME, timeouts),
            budget_bytes: budget_bytes.max(1),
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn get(&self, url: &str) -> Option<Arc<[u8]>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bytes_by_url
            .get(url)
            .cloned()
    }

    /// Stores `bytes`, evicting the oldest entries to stay within budget.
    /// Payloads larger than the whole budget are returned but not kept.
    pub fn insert(&self, url: &str, bytes: Vec<u8>) -> Arc<[u8]> {
        let bytes: Arc<[u8]> = bytes.into();
        if bytes.len() > self.budget_bytes {
            return bytes;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.bytes_by_url.get(url) {
            return Arc::clone(existing);
        }
        entries.evict_until_fits(bytes.len(), self.budget_bytes);
        entries.total_bytes += bytes.len();
        entries.order.push_back(url.to_string());
        entries
            .bytes_by_url
            .insert(url.to_string(), Arc::clone(&bytes));
        bytes
    }

    /// Cached bytes for `url`, downloading them on a miss. `Ok(None)` when
    /// cancelled or when the thumbnail exceeds the per-image cap.
    pub fn fetch(
        &self,
        url: &str,
        cancel: &CancelToken,
    ) -> Result<Option<Arc<[u8]>>, RetrieverError> {
        if let Some(bytes) = self.get(url) {
            return Ok(Some(bytes));
        }
        let Some(bytes) = self.http.get_bytes(url, MAX_THUMBNAIL_BYTES, cancel)? else {
            return Ok(None);
        };
        Ok(Some(self.insert(url, bytes)))
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bytes_by_url
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::ThumbnailCache;
    use crate::retrievers::{CancelToken, HttpTimeouts};

    fn cache(budget: usize) -> ThumbnailCache {
        ThumbnailCache::new(HttpTimeouts::default(), budget)
    }

    #[test]
    fn test_oldest_entries_evicted_first() {
        let cache = cache(10);
        cache.insert("a", vec![0; 4]);
        cache.insert("b", vec![1; 4]);
        cache.insert("c", vec![2; 4]);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b").as_deref(), Some(&[1u8; 4][..]));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.total_bytes(), 8);
    }

    #[test]
    fn test_oversized_payload_not_cached() {
        let cache = cache(4);
        let bytes = cache.insert("big", vec![7; 5]);
        assert_eq!(bytes.len(), 5);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_duplicate_insert_keeps_first() {
        let cache = cache(100);
        cache.insert("a", vec![1]);
        let kept = cache.insert("a", vec![2, 2]);
        assert_eq!(&kept[..], &[1]);
        assert_eq!(cache.total_bytes(), 1);
    }

    #[test]
    fn test_fetch_hit_skips_network() {
        let cache = cache(100);
        cache.insert("https://thumbs.invalid/a.jpg", vec![9; 3]);
        let cancel = CancelToken::default();
        cancel.cancel();
        let bytes = cache
            .fetch("https://thumbs.invalid/a.jpg", &cancel)
            .expect("fetch")
            .expect("cached");
        assert_eq!(bytes.len(), 3);
        assert!(cache
            .fetch("https://thumbs.invalid/missing.jpg", &cancel)
            .expect("cancelled fetch")
            .is_none());
    }
}
