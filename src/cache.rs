use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use crate::models::CompletionRequest;

// Cached completion text with timestamp
#[derive(Clone)]
pub struct CacheEntry {
    pub response: String,
    pub created_at: Instant,
}

impl CacheEntry {
    pub fn new(response: String) -> Self {
        Self {
            response,
            created_at: Instant::now(),
        }
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() < ttl
    }
}

// Create a cache key (hash of model + temperature + prompt)
pub fn make_cache_key(req: &CompletionRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(&req.model);
    hasher.update(req.temperature.to_le_bytes());
    hasher.update(&req.prompt);
    format!("{:x}", hasher.finalize())
}
