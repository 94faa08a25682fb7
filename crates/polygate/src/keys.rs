//! Per-provider credential pools.
//!
//! Each provider owns a bounded FIFO of available keys plus two side maps:
//! `quarantined` (temporarily benched, returned by the sweeper) and `retired`
//! (permanently removed). A key occupies at most one of the three sets, or is
//! held out by exactly one caller between `acquire` and the lifecycle call
//! that ends the checkout.

use crate::error::GatewayError;
use crate::secrets::{key_label, SecretStore};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Default deadline for a blocked `acquire`.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(15);
/// Default quarantine duration.
pub const QUARANTINE_TTL: Duration = Duration::from_secs(300);
/// Sweeper cadence for returning expired quarantined keys.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Placeholder handed out for `local*` providers, which need no credential.
pub const LOCAL_KEY_PLACEHOLDER: &str = "local-key-placeholder";

#[derive(Debug, Clone)]
struct QuarantineEntry {
    reason: String,
    release_at: Instant,
}

#[derive(Default)]
struct Membership {
    quarantined: HashMap<String, QuarantineEntry>,
    retired: HashMap<String, String>,
    total_keys: usize,
}

struct Pool {
    available: Mutex<VecDeque<String>>,
    /// One permit per queued key; tokio semaphores wake waiters FIFO.
    permits: Semaphore,
    membership: Mutex<Membership>,
}

impl Pool {
    fn new() -> Self {
        Pool {
            available: Mutex::new(VecDeque::new()),
            permits: Semaphore::new(0),
            membership: Mutex::new(Membership::default()),
        }
    }

    fn enqueue(&self, key: String) {
        self.available.lock().push_back(key);
        self.permits.add_permits(1);
    }
}

/// Point-in-time view of a pool, for status endpoints and invariant checks.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStatus {
    pub available: usize,
    pub quarantined: usize,
    pub retired: usize,
    pub total_keys: usize,
}

/// Manages API keys for all providers: rotation, quarantine and retirement.
pub struct KeyManager {
    pools: RwLock<HashMap<String, Arc<Pool>>>,
    secrets: Arc<SecretStore>,
    acquire_timeout: Duration,
}

impl KeyManager {
    pub fn new(secrets: Arc<SecretStore>) -> Arc<Self> {
        Self::with_timeout(secrets, ACQUIRE_TIMEOUT)
    }

    pub fn with_timeout(secrets: Arc<SecretStore>, acquire_timeout: Duration) -> Arc<Self> {
        Arc::new(KeyManager {
            pools: RwLock::new(HashMap::new()),
            secrets,
            acquire_timeout,
        })
    }

    fn pool(&self, provider: &str) -> Option<Arc<Pool>> {
        self.pools.read().get(provider).cloned()
    }

    fn pool_or_create(&self, provider: &str) -> Arc<Pool> {
        if let Some(pool) = self.pool(provider) {
            return pool;
        }
        let mut pools = self.pools.write();
        pools
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Pool::new()))
            .clone()
    }

    /// Loads every `<provider>_free.env` / `<provider>_paid.env` file in
    /// `dir`. Files are UTF-8, one key per line, `#` comments allowed. Keys
    /// are shuffled before enqueueing: strict file order would hot-spot the
    /// first key.
    pub fn load_from_dir(&self, dir: &Path) -> Result<(), GatewayError> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            GatewayError::Config(format!("cannot read keys dir '{}': {}", dir.display(), e))
        })?;

        let mut by_provider: HashMap<String, Vec<String>> = HashMap::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let provider = if let Some(stripped) = name.strip_suffix("_free.env") {
                stripped.to_string()
            } else if let Some(stripped) = name.strip_suffix("_paid.env") {
                stripped.to_string()
            } else {
                continue;
            };
            let keys = read_key_file(&entry.path());
            by_provider.entry(provider).or_default().extend(keys);
        }

        for (provider, mut keys) in by_provider {
            keys.shuffle(&mut rand::thread_rng());
            self.secrets.register(keys.iter().cloned());

            let pool = self.pool_or_create(&provider);
            {
                // Reload semantics: drain anything already queued.
                let mut available = pool.available.lock();
                while available.pop_front().is_some() {
                    let _ = pool.permits.try_acquire().map(|p| p.forget());
                }
            }
            let count = keys.len();
            for key in keys {
                pool.enqueue(key);
            }
            pool.membership.lock().total_keys = count;
            info!(provider = %provider, keys = count, "loaded provider keys");
        }
        Ok(())
    }

    /// Registers extra keys for a provider at runtime (embedders, tests).
    pub fn add_keys(&self, provider: &str, keys: Vec<String>) {
        let pool = self.pool_or_create(provider);
        self.secrets.register(keys.iter().cloned());
        let count = keys.len();
        for key in keys {
            pool.enqueue(key);
        }
        pool.membership.lock().total_keys += count;
    }

    /// Checks a key out of the provider's pool, waiting up to the acquire
    /// deadline. The key is held by the caller until `release`, `quarantine`
    /// or `retire`.
    pub async fn acquire(&self, provider: &str) -> Result<String, GatewayError> {
        if provider.starts_with("local") {
            return Ok(LOCAL_KEY_PLACEHOLDER.to_string());
        }
        let pool = self.pool(provider).ok_or_else(|| {
            GatewayError::ProviderUnavailable(format!("no key pool for '{}'", provider))
        })?;

        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let permit = tokio::time::timeout(remaining, pool.permits.acquire())
                .await
                .map_err(|_| {
                    error!(provider = %provider, "key pool exhausted, acquire timed out");
                    GatewayError::KeyTimeout(provider.to_string())
                })?
                .map_err(|_| GatewayError::ProviderUnavailable(format!("pool for '{}' closed", provider)))?;
            permit.forget();

            let key = match pool.available.lock().pop_front() {
                Some(key) => key,
                None => continue,
            };
            // A key retired while queued is dropped, not handed out.
            if pool.membership.lock().retired.contains_key(&key) {
                warn!(provider = %provider, key = %key_label(&key), "dropping retired key found in queue");
                continue;
            }
            return Ok(key);
        }
    }

    /// Returns a key to the available queue, unless it was quarantined or
    /// retired while held out.
    pub fn release(&self, provider: &str, key: &str) {
        if provider.starts_with("local") {
            return;
        }
        let Some(pool) = self.pool(provider) else { return };
        {
            let membership = pool.membership.lock();
            if membership.retired.contains_key(key) || membership.quarantined.contains_key(key) {
                return;
            }
        }
        pool.enqueue(key.to_string());
    }

    /// Benches a key for `ttl`; the sweeper re-enqueues it afterwards.
    pub fn quarantine(&self, provider: &str, key: &str, reason: &str, ttl: Duration) {
        if provider.starts_with("local") {
            return;
        }
        let Some(pool) = self.pool(provider) else { return };
        let reason = self.secrets.mask(reason);
        pool.membership.lock().quarantined.insert(
            key.to_string(),
            QuarantineEntry {
                reason: reason.clone(),
                release_at: Instant::now() + ttl,
            },
        );
        warn!(
            provider = %provider,
            key = %key_label(key),
            ttl_secs = ttl.as_secs(),
            reason = %reason,
            "key quarantined"
        );
    }

    /// Permanently removes a key. Retired keys never re-enter the pool and
    /// `total_keys` shrinks accordingly.
    pub fn retire(&self, provider: &str, key: &str, reason: &str) {
        if provider.starts_with("local") {
            return;
        }
        let Some(pool) = self.pool(provider) else { return };
        let reason = self.secrets.mask(reason);
        let mut membership = pool.membership.lock();
        if membership.retired.contains_key(key) {
            return;
        }
        membership.quarantined.remove(key);
        membership.retired.insert(key.to_string(), reason.clone());
        membership.total_keys = membership.total_keys.saturating_sub(1);
        error!(provider = %provider, key = %key_label(key), reason = %reason, "key retired");
    }

    /// Moves expired quarantined keys back to their available queues.
    pub fn sweep(&self) {
        let now = Instant::now();
        let pools: Vec<(String, Arc<Pool>)> = self
            .pools
            .read()
            .iter()
            .map(|(name, pool)| (name.clone(), pool.clone()))
            .collect();

        for (provider, pool) in pools {
            let expired: Vec<String> = {
                let mut membership = pool.membership.lock();
                let expired: Vec<String> = membership
                    .quarantined
                    .iter()
                    .filter(|(_, entry)| now >= entry.release_at)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in &expired {
                    membership.quarantined.remove(key);
                }
                expired
            };
            for key in expired {
                info!(provider = %provider, key = %key_label(&key), "key released from quarantine");
                pool.enqueue(key);
            }
        }
    }

    /// Spawns the cooperative quarantine sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.sweep();
            }
        })
    }

    pub fn status(&self) -> HashMap<String, PoolStatus> {
        self.pools
            .read()
            .iter()
            .map(|(provider, pool)| {
                let membership = pool.membership.lock();
                (
                    provider.clone(),
                    PoolStatus {
                        available: pool.available.lock().len(),
                        quarantined: membership.quarantined.len(),
                        retired: membership.retired.len(),
                        total_keys: membership.total_keys,
                    },
                )
            })
            .collect()
    }

    /// Current `total_keys` for a provider; bounds the engine's attempt loop.
    pub fn total_keys(&self, provider: &str) -> usize {
        self.pool(provider)
            .map(|pool| pool.membership.lock().total_keys)
            .unwrap_or(0)
    }

    /// Reason a key was quarantined, if it currently is. Test/observability
    /// helper.
    pub fn quarantine_reason(&self, provider: &str, key: &str) -> Option<String> {
        self.pool(provider)?
            .membership
            .lock()
            .quarantined
            .get(key)
            .map(|e| e.reason.clone())
    }
}

fn read_key_file(path: &Path) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(raw) => raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect(),
        Err(e) => {
            error!(file = %path.display(), error = %e, "error reading key file");
            Vec::new()
        }
    }
}

/// RAII checkout of a pooled key. Dropping the lease releases the key, which
/// keeps cancellation (client disconnect mid-stream) from leaking checkouts.
/// Quarantine/retire consume the lease instead.
pub struct KeyLease {
    manager: Arc<KeyManager>,
    provider: String,
    key: Option<String>,
}

impl KeyLease {
    pub async fn acquire(manager: Arc<KeyManager>, provider: &str) -> Result<Self, GatewayError> {
        let key = manager.acquire(provider).await?;
        Ok(KeyLease {
            manager,
            provider: provider.to_string(),
            key: Some(key),
        })
    }

    pub fn key(&self) -> &str {
        self.key.as_deref().expect("lease already consumed")
    }

    pub fn release(mut self) {
        if let Some(key) = self.key.take() {
            self.manager.release(&self.provider, &key);
        }
    }

    pub fn quarantine(mut self, reason: &str, ttl: Duration) {
        if let Some(key) = self.key.take() {
            self.manager.quarantine(&self.provider, &key, reason, ttl);
        }
    }

    pub fn retire(mut self, reason: &str) {
        if let Some(key) = self.key.take() {
            self.manager.retire(&self.provider, &key, reason);
        }
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.manager.release(&self.provider, &key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn manager_with_keys(provider: &str, keys: &[&str]) -> Arc<KeyManager> {
        let manager = KeyManager::with_timeout(SecretStore::new(), Duration::from_millis(50));
        let pool = manager.pool_or_create(provider);
        for key in keys {
            pool.enqueue(key.to_string());
        }
        pool.membership.lock().total_keys = keys.len();
        manager
    }

    fn conservation_holds(manager: &KeyManager, provider: &str, held_out: usize) {
        let pools = manager.status();
        let status = &pools[provider];
        assert_eq!(
            status.available + status.quarantined + status.retired,
            status.total_keys + held_out,
            "pool conservation violated: {:?} held_out={}",
            status,
            held_out
        );
    }

    #[tokio::test]
    async fn acquire_release_roundtrip() {
        let manager = manager_with_keys("groq", &["k1"]);
        let key = manager.acquire("groq").await.unwrap();
        assert_eq!(key, "k1");
        conservation_holds(&manager, "groq", 1);
        manager.release("groq", &key);
        conservation_holds(&manager, "groq", 0);
        assert_eq!(manager.status()["groq"].available, 1);
    }

    #[tokio::test]
    async fn acquire_times_out_on_empty_pool() {
        let manager = manager_with_keys("groq", &[]);
        let err = manager.acquire("groq").await.unwrap_err();
        assert!(matches!(err, GatewayError::KeyTimeout(_)));
    }

    #[tokio::test]
    async fn quarantined_key_is_not_released_back() {
        let manager = manager_with_keys("groq", &["k1"]);
        let key = manager.acquire("groq").await.unwrap();
        manager.quarantine("groq", &key, "HTTP 429", QUARANTINE_TTL);
        manager.release("groq", &key);
        let pools = manager.status();
        let status = &pools["groq"];
        assert_eq!(status.available, 0);
        assert_eq!(status.quarantined, 1);
        conservation_holds(&manager, "groq", 0);
    }

    #[tokio::test]
    async fn sweep_returns_expired_quarantine() {
        let manager = manager_with_keys("groq", &["k1"]);
        let key = manager.acquire("groq").await.unwrap();
        manager.quarantine("groq", &key, "HTTP 500", Duration::from_millis(0));
        manager.sweep();
        let pools = manager.status();
        let status = &pools["groq"];
        assert_eq!(status.available, 1);
        assert_eq!(status.quarantined, 0);
        let key = manager.acquire("groq").await.unwrap();
        assert_eq!(key, "k1");
    }

    #[tokio::test]
    async fn retired_key_never_returns() {
        let manager = manager_with_keys("groq", &["k1", "k2"]);
        let key = manager.acquire("groq").await.unwrap();
        manager.retire("groq", &key, "HTTP 401");
        manager.release("groq", &key);
        manager.sweep();

        let pools = manager.status();
        let status = &pools["groq"];
        assert_eq!(status.retired, 1);
        assert_eq!(status.total_keys, 1);
        conservation_holds(&manager, "groq", 0);

        // Only the surviving key is ever handed out again.
        let other = manager.acquire("groq").await.unwrap();
        assert_ne!(other, key);
        let err = manager.acquire("groq").await.unwrap_err();
        assert!(matches!(err, GatewayError::KeyTimeout(_)));
    }

    #[tokio::test]
    async fn retire_from_quarantine_does_not_double_count() {
        let manager = manager_with_keys("groq", &["k1"]);
        let key = manager.acquire("groq").await.unwrap();
        manager.quarantine("groq", &key, "HTTP 429", QUARANTINE_TTL);
        manager.retire("groq", &key, "HTTP 403");
        let pools = manager.status();
        let status = &pools["groq"];
        assert_eq!(status.quarantined, 0);
        assert_eq!(status.retired, 1);
        assert_eq!(status.total_keys, 0);
    }

    #[tokio::test]
    async fn local_providers_bypass_the_pool() {
        let manager = manager_with_keys("groq", &[]);
        let key = manager.acquire("local-llama").await.unwrap();
        assert_eq!(key, LOCAL_KEY_PLACEHOLDER);
        manager.release("local-llama", &key);
    }

    #[tokio::test]
    async fn lease_releases_on_drop() {
        let manager = manager_with_keys("groq", &["k1"]);
        {
            let lease = KeyLease::acquire(Arc::clone(&manager), "groq").await.unwrap();
            assert_eq!(lease.key(), "k1");
            conservation_holds(&manager, "groq", 1);
        }
        assert_eq!(manager.status()["groq"].available, 1);
    }

    #[tokio::test]
    async fn loads_tier_files_and_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let mut free = std::fs::File::create(dir.path().join("groq_free.env")).unwrap();
        writeln!(free, "# free tier\nkey-free-1\n\nkey-free-2").unwrap();
        let mut paid = std::fs::File::create(dir.path().join("groq_paid.env")).unwrap();
        writeln!(paid, "key-paid-1").unwrap();
        std::fs::write(dir.path().join("README.md"), "not keys").unwrap();

        let manager = KeyManager::new(SecretStore::new());
        manager.load_from_dir(dir.path()).unwrap();
        let pools = manager.status();
        let status = &pools["groq"];
        assert_eq!(status.total_keys, 3);
        assert_eq!(status.available, 3);
    }
}
