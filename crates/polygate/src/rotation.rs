//! Round-robin rotation state.
//!
//! Two counters live here: the per-alias load-balancing index used by the
//! router to pick a main-pool slot, and per-(provider, alias) model-variant
//! deques rotated on every provider call. A durable backend can supply the
//! alias counter; the in-process counter is the fallback and the semantics
//! are identical: monotonic increment modulo pool size, never skipping a
//! slot.

use crate::error::GatewayError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Durable monotonic counter (e.g. a shared KV store's atomic increment).
#[async_trait]
pub trait RotationBackend: Send + Sync {
    async fn incr(&self, key: &str) -> Result<u64, GatewayError>;
}

pub struct RotationIndex {
    backend: Option<Arc<dyn RotationBackend>>,
    counters: Mutex<HashMap<String, u64>>,
    variants: Mutex<HashMap<(String, String), VecDeque<String>>>,
}

impl RotationIndex {
    pub fn new(backend: Option<Arc<dyn RotationBackend>>) -> Arc<Self> {
        Arc::new(RotationIndex {
            backend,
            counters: Mutex::new(HashMap::new()),
            variants: Mutex::new(HashMap::new()),
        })
    }

    /// Seeds the model-variant deques from configuration
    /// (provider -> alias -> variant list).
    pub fn seed_variants(&self, aliases: &HashMap<String, HashMap<String, Vec<String>>>) {
        let mut variants = self.variants.lock();
        for (provider, table) in aliases {
            for (alias, models) in table {
                variants.insert(
                    (provider.clone(), alias.clone()),
                    models.iter().cloned().collect(),
                );
            }
        }
    }

    /// Returns the current index for `alias` in `[0, pool_size)` and advances
    /// the counter atomically.
    pub async fn get_and_advance(&self, alias: &str, pool_size: usize) -> usize {
        if pool_size <= 1 {
            return 0;
        }
        if let Some(backend) = &self.backend {
            match backend.incr(&format!("rotation:index:{}", alias)).await {
                Ok(value) => {
                    let index = (value as usize) % pool_size;
                    debug!(alias = %alias, index, pool_size, "rotation index (durable)");
                    return index;
                }
                Err(e) => {
                    warn!(alias = %alias, error = %e, "durable rotation failed, falling back to memory");
                }
            }
        }
        let mut counters = self.counters.lock();
        let current = *counters.get(alias).unwrap_or(&0) as usize % pool_size;
        counters.insert(alias.to_string(), (current as u64 + 1) % pool_size as u64);
        debug!(alias = %alias, index = current, pool_size, "rotation index (memory)");
        current
    }

    /// Resolves a provider-local model alias to the next concrete model,
    /// rotating the variant deque. Unknown aliases pass through unchanged.
    pub fn next_model(&self, provider: &str, alias: &str) -> String {
        let mut variants = self.variants.lock();
        let Some(queue) = variants.get_mut(&(provider.to_string(), alias.to_string())) else {
            return alias.to_string();
        };
        let Some(model) = queue.front().cloned() else {
            return alias.to_string();
        };
        queue.rotate_left(1);
        debug!(provider = %provider, alias = %alias, model = %model, "rotated model alias");
        model
    }
}
