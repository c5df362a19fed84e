//! Template cache service
//!
//! Single-entry snapshot cache in front of template loading. The TTL
//! variant guarantees one loader call per TTL window with concurrent
//! callers seeing the same snapshot; the no-op variant always loads.

use crate::error::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub size: usize,
    pub ttl_secs: Option<u64>,
    pub hits: u64,
    pub misses: u64,
}

struct Entry<T> {
    loaded_at: Instant,
    value: Arc<T>,
}

struct TtlState<T> {
    entry: Option<Entry<T>>,
    hits: u64,
    misses: u64,
}

pub enum TemplateCache<T> {
    NoOp,
    Ttl { ttl: Duration, state: Mutex<TtlState<T>> },
}

impl<T> TemplateCache<T> {
    pub fn no_op() -> Self {
        TemplateCache::NoOp
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        TemplateCache::Ttl {
            ttl,
            state: Mutex::new(TtlState { entry: None, hits: 0, misses: 0 }),
        }
    }

    /// Return the cached snapshot or run `loader` once. The lock is held
    /// across the load so concurrent callers share one load.
    pub async fn get_or_load<F, Fut>(&self, loader: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self {
            TemplateCache::NoOp => Ok(Arc::new(loader().await?)),
            TemplateCache::Ttl { ttl, state } => {
                let mut state = state.lock().await;
                if let Some(entry) = &state.entry {
                    if entry.loaded_at.elapsed() < *ttl {
                        state.hits += 1;
                        return Ok(entry.value.clone());
                    }
                }
                state.misses += 1;
                let value = Arc::new(loader().await?);
                state.entry = Some(Entry { loaded_at: Instant::now(), value: value.clone() });
                Ok(value)
            }
        }
    }

    pub async fn invalidate(&self) {
        if let TemplateCache::Ttl { state, .. } = self {
            state.lock().await.entry = None;
        }
    }

    pub async fn get_stats(&self) -> CacheStats {
        match self {
            TemplateCache::NoOp => CacheStats::default(),
            TemplateCache::Ttl { ttl, state } => {
                let state = state.lock().await;
                CacheStats {
                    size: usize::from(state.entry.is_some()),
                    ttl_secs: Some(ttl.as_secs()),
                    hits: state.hits,
                    misses: state.misses,
                }
            }
        }
    }

    /// Advisory: drop the entry if it has expired.
    pub async fn optimize_cache(&self) {
        if let TemplateCache::Ttl { ttl, state } = self {
            let mut state = state.lock().await;
            if let Some(entry) = &state.entry {
                if entry.loaded_at.elapsed() >= *ttl {
                    state.entry = None;
                }
            }
        }
    }
}
