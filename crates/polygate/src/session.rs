//! Session state: lease, cancellation flag and small per-session cells.
//!
//! The lease is a conditional write with a TTL, guaranteeing at most one
//! active driver per session; release is a compare-and-delete so a worker
//! can never drop another worker's lease. The same store carries a small
//! TTL'd KV used for Gemini thought signatures and cached-content names.
//!
//! When no backend is configured the store runs degraded: leases always
//! succeed and cancellation is never observed. Everything else keeps its
//! semantics.

use crate::error::GatewayError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Lease TTL: a stuck worker loses ownership after this.
pub const LEASE_TTL: Duration = Duration::from_secs(60);
/// TTL on the session record (status, draft, phase).
pub const SESSION_TTL: Duration = Duration::from_secs(1800);

/// Minimal KV the session store needs from a backend. `set_nx` is the
/// conditional write behind lease acquisition; `del_if_eq` the
/// compare-and-delete behind release.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), GatewayError>;
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, GatewayError>;
    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool, GatewayError>;
}

/// In-process backend: a mutexed map with per-entry expiry, checked lazily
/// on read.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryBackend {
    fn live(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((_, Some(expiry))) if Instant::now() >= *expiry => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        Ok(self.live(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), GatewayError> {
        self.entries.lock().insert(
            key.to_string(),
            (value.to_string(), ttl.map(|t| Instant::now() + t)),
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, GatewayError> {
        if self.live(key).is_some() {
            return Ok(false);
        }
        self.entries.lock().insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(true)
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool, GatewayError> {
        let mut entries = self.entries.lock();
        if entries.get(key).map(|(v, _)| v.as_str()) == Some(value) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

pub struct SessionStore {
    backend: Option<Arc<dyn SessionBackend>>,
}

fn owner_key(session_id: &str) -> String {
    format!("owner:{}", session_id)
}

fn field_key(session_id: &str, field: &str) -> String {
    format!("session:{}:{}", session_id, field)
}

impl SessionStore {
    pub fn new(backend: Option<Arc<dyn SessionBackend>>) -> Arc<Self> {
        Arc::new(SessionStore { backend })
    }

    pub fn in_memory() -> Arc<Self> {
        Self::new(Some(Arc::new(MemoryBackend::default())))
    }

    /// A store with no backend: degraded mode.
    pub fn disabled() -> Arc<Self> {
        Self::new(None)
    }

    /// Generic TTL'd cell, shared by the signature stash and the Gemini
    /// cached-content names. Errors degrade to misses.
    pub async fn kv_get(&self, key: &str) -> Option<String> {
        let backend = self.backend.as_ref()?;
        match backend.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "session kv read failed");
                None
            }
        }
    }

    pub async fn kv_set(&self, key: &str, value: &str, ttl: Duration) {
        let Some(backend) = self.backend.as_ref() else { return };
        if let Err(e) = backend.set(key, value, Some(ttl)).await {
            warn!(key = %key, error = %e, "session kv write failed");
        }
    }

    /// Flags a running session as cancelled. Returns false when the session
    /// record does not exist (or the store is degraded).
    pub async fn cancel(&self, session_id: &str) -> bool {
        let Some(backend) = self.backend.as_ref() else { return false };
        let status_key = field_key(session_id, "status");
        match backend.get(&status_key).await {
            Ok(Some(_)) => {
                let result = backend
                    .set(&status_key, "cancelled", Some(SESSION_TTL))
                    .await;
                if let Err(e) = result {
                    warn!(session = %session_id, error = %e, "failed to cancel session");
                    return false;
                }
                info!(session = %session_id, "session cancelled");
                true
            }
            _ => {
                warn!(session = %session_id, "session not found for cancellation");
                false
            }
        }
    }

    /// Binds a worker to a session for one driver run.
    pub fn handle(self: &Arc<Self>, session_id: impl Into<String>) -> SessionHandle {
        SessionHandle {
            store: Arc::clone(self),
            session_id: session_id.into(),
            worker_id: format!("worker-{}", Uuid::new_v4().simple()),
            generation_id: Uuid::new_v4().to_string(),
        }
    }
}

/// One worker's view of one session.
pub struct SessionHandle {
    store: Arc<SessionStore>,
    pub session_id: String,
    pub worker_id: String,
    pub generation_id: String,
}

impl SessionHandle {
    /// Conditional-write lease acquisition. Degraded mode always succeeds.
    pub async fn acquire_lease(&self) -> bool {
        let Some(backend) = self.store.backend.as_ref() else { return true };
        let acquired = backend
            .set_nx(&owner_key(&self.session_id), &self.worker_id, LEASE_TTL)
            .await
            .unwrap_or(true);
        if !acquired {
            warn!(session = %self.session_id, "could not acquire session lease");
            return false;
        }
        let _ = backend
            .set(
                &field_key(&self.session_id, "status"),
                "running",
                Some(SESSION_TTL),
            )
            .await;
        let _ = backend
            .set(
                &field_key(&self.session_id, "generation"),
                &self.generation_id,
                Some(SESSION_TTL),
            )
            .await;
        info!(session = %self.session_id, worker = %self.worker_id, "acquired session lease");
        true
    }

    /// Compare-and-delete release; a non-owner's release is a no-op on the
    /// lease itself.
    pub async fn release_lease(&self) {
        let Some(backend) = self.store.backend.as_ref() else { return };
        let released = backend
            .del_if_eq(&owner_key(&self.session_id), &self.worker_id)
            .await
            .unwrap_or(false);
        let status_key = field_key(&self.session_id, "status");
        if let Ok(Some(status)) = backend.get(&status_key).await {
            // A cancelled session stays cancelled; only a running one
            // completes.
            if status == "running" {
                let _ = backend.set(&status_key, "done", Some(SESSION_TTL)).await;
            }
        }
        info!(session = %self.session_id, released, "released session lease");
    }

    /// Drivers poll this between iterations. Degraded mode never observes a
    /// cancellation.
    pub async fn is_cancelled(&self) -> bool {
        let Some(backend) = self.store.backend.as_ref() else { return false };
        matches!(
            backend.get(&field_key(&self.session_id, "status")).await,
            Ok(Some(status)) if status == "cancelled"
        )
    }

    pub async fn draft(&self) -> String {
        let Some(backend) = self.store.backend.as_ref() else {
            return String::new();
        };
        backend
            .get(&field_key(&self.session_id, "draft"))
            .await
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub async fn save_draft(&self, draft: &str) {
        let Some(backend) = self.store.backend.as_ref() else { return };
        let _ = backend
            .set(
                &field_key(&self.session_id, "draft"),
                draft,
                Some(SESSION_TTL),
            )
            .await;
    }

    pub async fn phase(&self) -> u32 {
        let Some(backend) = self.store.backend.as_ref() else { return 0 };
        backend
            .get(&field_key(&self.session_id, "phase"))
            .await
            .ok()
            .flatten()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0)
    }

    pub async fn save_phase(&self, phase: u32) {
        let Some(backend) = self.store.backend.as_ref() else { return };
        let _ = backend
            .set(
                &field_key(&self.session_id, "phase"),
                &phase.to_string(),
                Some(SESSION_TTL),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let store = SessionStore::in_memory();
        let first = store.handle("s1");
        let second = store.handle("s1");

        assert!(first.acquire_lease().await);
        assert!(!second.acquire_lease().await, "second worker must be rejected");

        first.release_lease().await;
        assert!(second.acquire_lease().await, "lease free after release");
    }

    #[tokio::test]
    async fn release_by_non_owner_keeps_lease() {
        let store = SessionStore::in_memory();
        let owner = store.handle("s1");
        let imposter = store.handle("s1");

        assert!(owner.acquire_lease().await);
        imposter.release_lease().await;

        let third = store.handle("s1");
        assert!(!third.acquire_lease().await, "owner still holds the lease");
    }

    #[tokio::test]
    async fn cancellation_is_observed_and_terminal() {
        let store = SessionStore::in_memory();
        let handle = store.handle("s1");
        assert!(handle.acquire_lease().await);
        assert!(!handle.is_cancelled().await);

        assert!(store.cancel("s1").await);
        assert!(handle.is_cancelled().await);

        // running→cancelled is terminal: release must not flip it to done.
        handle.release_lease().await;
        assert!(handle.is_cancelled().await);
    }

    #[tokio::test]
    async fn cancel_unknown_session_is_rejected() {
        let store = SessionStore::in_memory();
        assert!(!store.cancel("ghost").await);
    }

    #[tokio::test]
    async fn draft_and_phase_persist() {
        let store = SessionStore::in_memory();
        let handle = store.handle("s1");
        assert_eq!(handle.draft().await, "");
        assert_eq!(handle.phase().await, 0);

        handle.save_draft("outline").await;
        handle.save_phase(2).await;

        let again = store.handle("s1");
        assert_eq!(again.draft().await, "outline");
        assert_eq!(again.phase().await, 2);
    }

    #[tokio::test]
    async fn degraded_mode_always_leases_never_cancels() {
        let store = SessionStore::disabled();
        let handle = store.handle("s1");
        assert!(handle.acquire_lease().await);
        assert!(!store.cancel("s1").await);
        assert!(!handle.is_cancelled().await);
        assert_eq!(handle.draft().await, "");
    }

    #[tokio::test]
    async fn kv_entries_expire() {
        let store = SessionStore::in_memory();
        store.kv_set("sig:1", "abc", Duration::from_millis(0)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.kv_get("sig:1").await, None);

        store.kv_set("sig:2", "def", Duration::from_secs(60)).await;
        assert_eq!(store.kv_get("sig:2").await.as_deref(), Some("def"));
    }
}
