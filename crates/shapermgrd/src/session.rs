//! Session registry: who is currently allowed to talk to which router.
//!
//! Sessions are bookkeeping only — the actual channel to a router is
//! owned by the transport pool and shared by every session addressing
//! that router. Registry state is bucketed per router id so unrelated
//! routers never serialize behind one lock; operations on one
//! session id are linearizable through its router's bucket lock.

use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use shaper_common::{ShaperError, ShaperResult};

use crate::types::{Session, SessionInfo, SessionStatus};

type Bucket = Arc<Mutex<HashMap<String, Session>>>;

/// Registry of logical client sessions, bucketed per router.
pub struct SessionRegistry {
    ttl: Duration,
    /// session_id -> router_id, for operations keyed by session only.
    index: RwLock<HashMap<String, String>>,
    /// router_id -> its session bucket.
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl SessionRegistry {
    /// Creates an empty registry with the given idle TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            index: RwLock::new(HashMap::new()),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Generates a fresh session token (16 random bytes, hex).
    fn generate_id() -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    async fn bucket_for(&self, router_id: &str) -> Bucket {
        if let Some(bucket) = self.buckets.read().await.get(router_id) {
            return Arc::clone(bucket);
        }
        let mut buckets = self.buckets.write().await;
        Arc::clone(
            buckets
                .entry(router_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(HashMap::new()))),
        )
    }

    async fn router_of(&self, session_id: &str) -> ShaperResult<String> {
        self.index
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| ShaperError::session_not_found(session_id))
    }

    /// Starts a session with a server-generated id.
    pub async fn start(&self, router_id: &str) -> ShaperResult<String> {
        let session_id = Self::generate_id();
        self.start_with_id(&session_id, router_id).await?;
        Ok(session_id)
    }

    /// Starts a session under a caller-chosen id. Fails with
    /// `SessionAlreadyActive` if that id is currently active; an
    /// ended or expired id may be reused.
    pub async fn start_with_id(&self, session_id: &str, router_id: &str) -> ShaperResult<()> {
        let bucket = self.bucket_for(router_id).await;
        let mut sessions = bucket.lock().await;
        if sessions.get(session_id).is_some_and(Session::is_active) {
            return Err(ShaperError::session_already_active(session_id));
        }
        sessions.insert(session_id.to_string(), Session::new(session_id, router_id));
        self.index
            .write()
            .await
            .insert(session_id.to_string(), router_id.to_string());
        info!(session = %session_id, router = %router_id, "Session started");
        Ok(())
    }

    /// Updates a session's last-activity timestamp. Does not create.
    pub async fn refresh(&self, session_id: &str) -> ShaperResult<()> {
        let router = self.router_of(session_id).await?;
        let bucket = self.bucket_for(&router).await;
        let mut sessions = bucket.lock().await;
        match sessions.get_mut(session_id).filter(|s| s.is_active()) {
            Some(session) => {
                session.last_activity_at = std::time::Instant::now();
                Ok(())
            }
            None => Err(ShaperError::session_not_found(session_id)),
        }
    }

    /// Like refresh, but silent on a missing session — used on every
    /// executed command so activity counts as liveness.
    pub async fn touch(&self, session_id: &str) {
        let _ = self.refresh(session_id).await;
    }

    /// Ends a session, returning its router id so the caller can drop
    /// the transport reference.
    pub async fn end(&self, session_id: &str) -> ShaperResult<String> {
        let router = self.router_of(session_id).await?;
        let bucket = self.bucket_for(&router).await;
        let mut sessions = bucket.lock().await;
        match sessions.get_mut(session_id).filter(|s| s.is_active()) {
            Some(session) => {
                session.status = SessionStatus::Ended;
                info!(session = %session_id, router = %router, "Session ended");
                Ok(router)
            }
            None => Err(ShaperError::session_not_found(session_id)),
        }
    }

    /// Whether a session is currently active.
    pub async fn status(&self, session_id: &str) -> bool {
        let Ok(router) = self.router_of(session_id).await else {
            return false;
        };
        let bucket = self.bucket_for(&router).await;
        let sessions = bucket.lock().await;
        sessions.get(session_id).is_some_and(Session::is_active)
    }

    /// Router addressed by an active session.
    pub async fn router_for(&self, session_id: &str) -> ShaperResult<String> {
        let router = self.router_of(session_id).await?;
        if !self.status(session_id).await {
            return Err(ShaperError::session_not_found(session_id));
        }
        Ok(router)
    }

    /// Snapshot of every known session, keyed by session id.
    pub async fn list_all(&self) -> HashMap<String, SessionInfo> {
        let buckets: Vec<Bucket> = self.buckets.read().await.values().cloned().collect();
        let mut out = HashMap::new();
        for bucket in buckets {
            let sessions = bucket.lock().await;
            for (id, session) in sessions.iter() {
                out.insert(id.clone(), SessionInfo::from(session));
            }
        }
        out
    }

    /// Expires every active session idle past the TTL. Returns the
    /// (session, router) pairs expired so the caller can release
    /// their transport references.
    ///
    /// Also drops sessions already ended or expired before this
    /// sweep, together with their index entries, so the registry
    /// stays bounded over the daemon's lifetime. A just-expired
    /// session survives until the next sweep and stays visible to
    /// `list_all` in the meantime.
    pub async fn expire_sweep(&self) -> Vec<(String, String)> {
        let buckets: Vec<(String, Bucket)> = self
            .buckets
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut expired = Vec::new();
        for (router, bucket) in buckets {
            let mut sessions = bucket.lock().await;

            let stale: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| !s.is_active())
                .map(|(id, _)| id.clone())
                .collect();
            if !stale.is_empty() {
                // Bucket lock is held, so a stale id cannot be
                // restarted between the removal of its session and
                // its index entry (start takes the same lock first).
                let mut index = self.index.write().await;
                for id in &stale {
                    sessions.remove(id);
                    index.remove(id);
                }
                debug!(router = %router, count = stale.len(), "Purged inactive sessions");
            }

            for session in sessions.values_mut() {
                if session.is_active() && session.last_activity_at.elapsed() > self.ttl {
                    session.status = SessionStatus::Expired;
                    debug!(session = %session.session_id, router = %router, "Session expired");
                    expired.push((session.session_id.clone(), router.clone()));
                }
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_start_and_status() {
        let reg = registry();
        let id = reg.start("living-room").await.unwrap();
        assert!(reg.status(&id).await);
        assert_eq!(reg.router_for(&id).await.unwrap(), "living-room");
    }

    #[tokio::test]
    async fn test_generated_ids_are_unique() {
        let reg = registry();
        let a = reg.start("r1").await.unwrap();
        let b = reg.start("r1").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[tokio::test]
    async fn test_start_with_active_id_rejected() {
        let reg = registry();
        reg.start_with_id("s1", "r1").await.unwrap();
        let err = reg.start_with_id("s1", "r1").await.unwrap_err();
        assert!(matches!(err, ShaperError::SessionAlreadyActive { .. }));
    }

    #[tokio::test]
    async fn test_ended_id_may_be_reused() {
        let reg = registry();
        reg.start_with_id("s1", "r1").await.unwrap();
        reg.end("s1").await.unwrap();
        reg.start_with_id("s1", "r1").await.unwrap();
        assert!(reg.status("s1").await);
    }

    #[tokio::test]
    async fn test_refresh_unknown_session() {
        let reg = registry();
        let err = reg.refresh("nope").await.unwrap_err();
        assert!(matches!(err, ShaperError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_end_returns_router() {
        let reg = registry();
        let id = reg.start("office").await.unwrap();
        assert_eq!(reg.end(&id).await.unwrap(), "office");
        assert!(!reg.status(&id).await);
        // Double end reports not found.
        assert!(reg.end(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_list_all_includes_ended() {
        let reg = registry();
        let a = reg.start("r1").await.unwrap();
        let b = reg.start("r2").await.unwrap();
        reg.end(&b).await.unwrap();

        let all = reg.list_all().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[&a].status, SessionStatus::Active);
        assert_eq!(all[&b].status, SessionStatus::Ended);
    }

    #[tokio::test]
    async fn test_expire_sweep() {
        let reg = SessionRegistry::new(Duration::from_millis(10));
        let id = reg.start("r1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let expired = reg.expire_sweep().await;
        assert_eq!(expired, vec![(id.clone(), "r1".to_string())]);
        assert!(!reg.status(&id).await);

        // A second sweep finds nothing new and drops the expired
        // record.
        assert!(reg.expire_sweep().await.is_empty());
        assert!(reg.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_purges_inactive_sessions() {
        // Long-running daemons cycle through many sessions; the
        // registry must not accumulate their ended records.
        let reg = registry();
        for _ in 0..1000 {
            let id = reg.start("r1").await.unwrap();
            reg.end(&id).await.unwrap();
        }
        assert_eq!(reg.list_all().await.len(), 1000);

        let live = reg.start("r1").await.unwrap();
        assert!(reg.expire_sweep().await.is_empty());

        let all = reg.list_all().await;
        assert_eq!(all.len(), 1);
        assert!(all.contains_key(&live));
        assert!(reg.status(&live).await);
    }

    #[tokio::test]
    async fn test_sweep_spares_recently_refreshed() {
        let reg = SessionRegistry::new(Duration::from_millis(50));
        let id = reg.start("r1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        reg.refresh(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(reg.expire_sweep().await.is_empty());
        assert!(reg.status(&id).await);
    }
}
