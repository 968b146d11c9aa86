//! Cache-aside helper for read-heavy JSON views.
//!
//! `CacheStore` fronts a `CacheBackend`. With no backend (TTL of zero) every
//! lookup passes straight through to the loader.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub trait CacheBackend {
    fn get(&mut self, key: &str, now: Instant) -> Option<serde_json::Value>;
    fn put(&mut self, key: &str, value: serde_json::Value, expires_at: Instant);
    fn remove_prefix(&mut self, prefix: &str) -> usize;
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: HashMap<String, (serde_json::Value, Instant)>,
}

impl CacheBackend for MemoryBackend {
    fn get(&mut self, key: &str, now: Instant) -> Option<serde_json::Value> {
        match self.entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Some(value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn put(&mut self, key: &str, value: serde_json::Value, expires_at: Instant) {
        self.entries.insert(key.to_string(), (value, expires_at));
    }

    fn remove_prefix(&mut self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.starts_with(prefix));
        before - self.entries.len()
    }
}

pub struct CacheStore {
    ttl: Duration,
    backend: Option<Box<dyn CacheBackend>>,
}

impl CacheStore {
    pub fn new(ttl: Duration) -> Self {
        if ttl.is_zero() {
            return Self::disabled();
        }
        Self::with_backend(ttl, Box::new(MemoryBackend::default()))
    }

    pub fn with_backend(ttl: Duration, backend: Box<dyn CacheBackend>) -> Self {
        Self {
            ttl,
            backend: Some(backend),
        }
    }

    pub fn disabled() -> Self {
        Self {
            ttl: Duration::ZERO,
            backend: None,
        }
    }

    pub fn get_or_load<E, F>(&mut self, key: &str, loader: F) -> Result<serde_json::Value, E>
    where
        F: FnOnce() -> Result<serde_json::Value, E>,
    {
        self.get_or_load_at(key, Instant::now(), loader)
    }

    pub fn get_or_load_at<E, F>(
        &mut self,
        key: &str,
        now: Instant,
        loader: F,
    ) -> Result<serde_json::Value, E>
    where
        F: FnOnce() -> Result<serde_json::Value, E>,
    {
        let Some(backend) = self.backend.as_mut() else {
            return loader();
        };
        if let Some(hit) = backend.get(key, now) {
            tracing::trace!(key, "cache hit");
            return Ok(hit);
        }
        let value = loader()?;
        backend.put(key, value.clone(), now + self.ttl);
        Ok(value)
    }

    pub fn invalidate_prefix(&mut self, prefix: &str) {
        if let Some(backend) = self.backend.as_mut() {
            let removed = backend.remove_prefix(prefix);
            if removed > 0 {
                tracing::debug!(prefix, removed, "cache invalidated");
            }
        }
    }
}
