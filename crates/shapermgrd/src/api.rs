//! The session-scoped management surface.
//!
//! Everything a client can do — start and end sessions, apply a
//! policy, inspect health — goes through [`ShaperApi`], which wires
//! the registry, the transport pool, the provisioner, the applier and
//! the health checker together and enforces their ordering: a session
//! exists before its transport reference, the baseline is ensured
//! before any policy, and a command on a session counts as activity.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use shaper_common::config::ShaperConfig;
use shaper_common::ShaperResult;

use crate::applier::{ApplyReport, PolicyApplier};
use crate::executor::IdempotentExecutor;
use crate::health::{HealthChecker, HealthReport};
use crate::provision::{ProvisionReport, Provisioner};
use crate::session::SessionRegistry;
use crate::transport::TransportPool;
use crate::types::{MacAddr, Policy, Rate, SessionInfo};

/// What a client gets back from a session start.
#[derive(Debug, Serialize)]
pub struct StartOutcome {
    /// Server-generated session token.
    pub session_id: String,
    /// Step-by-step baseline provisioning record. An incomplete
    /// report names the failing step; the session is still active so
    /// the client can end it cleanly or retry by restarting.
    pub provision: ProvisionReport,
}

/// The daemon's management facade.
pub struct ShaperApi {
    registry: SessionRegistry,
    pool: Arc<TransportPool>,
    provisioner: Provisioner,
    applier: PolicyApplier,
    health: HealthChecker,
    protected: BTreeSet<MacAddr>,
}

impl ShaperApi {
    /// Builds the facade over ssh transports.
    pub fn new(config: &ShaperConfig) -> ShaperResult<Self> {
        Self::with_pool(config, Arc::new(TransportPool::new(config)))
    }

    /// Builds the facade over an externally constructed pool (tests
    /// inject scripted shells this way).
    pub fn with_pool(config: &ShaperConfig, pool: Arc<TransportPool>) -> ShaperResult<Self> {
        let protected = config
            .protected_devices
            .iter()
            .map(|raw| MacAddr::parse(raw))
            .collect::<ShaperResult<BTreeSet<MacAddr>>>()?;
        let full_rate = Rate::parse(&config.full_rate)?;
        let limited_rate = Rate::parse(&config.limited_rate)?;

        let exec = IdempotentExecutor::new(Arc::clone(&pool));
        Ok(Self {
            registry: SessionRegistry::new(config.session_ttl()),
            provisioner: Provisioner::new(
                exec.clone(),
                config.lan_interface.clone(),
                full_rate,
                limited_rate,
            ),
            applier: PolicyApplier::new(exec, config.lan_interface.clone()),
            health: HealthChecker::new(Arc::clone(&pool), config.lan_interface.clone()),
            pool,
            protected,
        })
    }

    /// Starts a session against a router: registers it, takes a
    /// transport reference, and ensures the baseline infrastructure.
    ///
    /// On a channel failure the session is rolled back and the error
    /// propagates; a router-side provisioning rejection comes back in
    /// the report instead.
    #[instrument(skip(self))]
    pub async fn start(&self, router_id: &str) -> ShaperResult<StartOutcome> {
        let session_id = self.registry.start(router_id).await?;
        if let Err(e) = self.pool.retain(router_id).await {
            let _ = self.registry.end(&session_id).await;
            return Err(e);
        }

        match self.provisioner.ensure_baseline(router_id).await {
            Ok(provision) => {
                if let Some(failed) = provision.failed_step() {
                    warn!(
                        session = %session_id,
                        router = %router_id,
                        step = failed.step.name(),
                        "Session started over incomplete baseline"
                    );
                }
                Ok(StartOutcome {
                    session_id,
                    provision,
                })
            }
            Err(e) => {
                let _ = self.registry.end(&session_id).await;
                self.pool.release(router_id).await;
                Err(e)
            }
        }
    }

    /// Extends a session's idle deadline.
    pub async fn refresh(&self, session_id: &str) -> ShaperResult<()> {
        self.registry.refresh(session_id).await
    }

    /// Ends a session and drops its transport reference.
    #[instrument(skip(self))]
    pub async fn end(&self, session_id: &str) -> ShaperResult<()> {
        let router = self.registry.end(session_id).await?;
        self.pool.release(&router).await;
        Ok(())
    }

    /// Whether a session is currently active.
    pub async fn status(&self, session_id: &str) -> bool {
        self.registry.status(session_id).await
    }

    /// Snapshot of every known session.
    pub async fn list_sessions(&self) -> HashMap<String, SessionInfo> {
        self.registry.list_all().await
    }

    /// Applies a policy on the session's router. Counts as session
    /// activity.
    #[instrument(skip(self, policy), fields(mode = %policy.mode))]
    pub async fn apply_policy(&self, session_id: &str, policy: &Policy) -> ShaperResult<ApplyReport> {
        let router = self.registry.router_for(session_id).await?;
        self.registry.touch(session_id).await;
        self.applier.apply(&router, policy, &self.protected).await
    }

    /// Read-only health snapshot of the session's router. Counts as
    /// session activity.
    pub async fn health(&self, session_id: &str) -> ShaperResult<HealthReport> {
        let router = self.registry.router_for(session_id).await?;
        self.registry.touch(session_id).await;
        self.health.check(&router).await
    }

    /// Expires idle sessions and drops their transport references.
    /// Runs on the daemon's sweep interval.
    pub async fn sweep(&self) -> usize {
        let expired = self.registry.expire_sweep().await;
        let count = expired.len();
        for (session, router) in expired {
            info!(session = %session, router = %router, "Releasing transport of expired session");
            self.pool.release(&router).await;
        }
        count
    }

    /// Closes every transport. Called once at daemon shutdown.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Mode;
    use shaper_common::ShaperError;
    use shaper_testing::{MockShell, RouterSim, SAMPLE_CONFIG_YAML};
    use std::sync::Mutex as StdMutex;

    fn api_over(sim: Arc<StdMutex<RouterSim>>) -> (ShaperApi, Arc<TransportPool>) {
        let cfg = ShaperConfig::from_yaml(SAMPLE_CONFIG_YAML).unwrap();
        let pool = Arc::new(TransportPool::with_factory(
            &cfg,
            Box::new(move |_| Box::new(MockShell::simulated(Arc::clone(&sim)))),
        ));
        let api = ShaperApi::with_pool(&cfg, Arc::clone(&pool)).unwrap();
        (api, pool)
    }

    #[tokio::test]
    async fn test_full_session_lifecycle() {
        let sim = Arc::new(StdMutex::new(RouterSim::new()));
        let (api, pool) = api_over(Arc::clone(&sim));

        let outcome = api.start("living-room").await.unwrap();
        assert!(outcome.provision.complete());
        assert!(api.status(&outcome.session_id).await);
        assert_eq!(pool.session_count("living-room").await, 1);

        let policy = Policy::new(
            Mode::Blacklist,
            ["aa:bb:cc:dd:ee:01"],
            "2mbit",
            "100mbit",
        )
        .unwrap();
        let report = api.apply_policy(&outcome.session_id, &policy).await.unwrap();
        assert!(report.complete());

        let health = api.health(&outcome.session_id).await.unwrap();
        assert!(health.baseline_ok());
        assert_eq!(health.active_mode, Some(Mode::Blacklist));

        api.end(&outcome.session_id).await.unwrap();
        assert!(!api.status(&outcome.session_id).await);
        assert_eq!(pool.transport_count().await, 0);
    }

    #[tokio::test]
    async fn test_start_unknown_router_rolls_back_session() {
        let sim = Arc::new(StdMutex::new(RouterSim::new()));
        let (api, _pool) = api_over(sim);

        let err = api.start("garage").await.unwrap_err();
        assert!(matches!(err, ShaperError::RouterNotFound { .. }));
        assert!(api
            .list_sessions()
            .await
            .values()
            .all(|s| s.status != crate::types::SessionStatus::Active));
    }

    #[tokio::test]
    async fn test_apply_policy_requires_active_session() {
        let sim = Arc::new(StdMutex::new(RouterSim::new()));
        let (api, _pool) = api_over(sim);

        let policy = Policy::new(Mode::None, Vec::<&str>::new(), "2mbit", "100mbit").unwrap();
        let err = api.apply_policy("nope", &policy).await.unwrap_err();
        assert!(matches!(err, ShaperError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_protected_devices_come_from_config() {
        // SAMPLE_CONFIG_YAML protects c4:6e:1f:00:aa:01; blacklisting
        // it must leave it unmarked.
        let sim = Arc::new(StdMutex::new(RouterSim::new()));
        let (api, _pool) = api_over(Arc::clone(&sim));

        let outcome = api.start("living-room").await.unwrap();
        let policy = Policy::new(
            Mode::Blacklist,
            ["c4:6e:1f:00:aa:01", "aa:bb:cc:dd:ee:01"],
            "2mbit",
            "100mbit",
        )
        .unwrap();
        api.apply_policy(&outcome.session_id, &policy).await.unwrap();

        let listing = sim.lock().unwrap().listing("SHAPER_BL");
        assert!(listing.contains("aa:bb:cc:dd:ee:01"));
        assert!(!listing.contains("c4:6e:1f:00:aa:01"));
    }

    #[tokio::test]
    async fn test_sweep_releases_transports() {
        let mut cfg = ShaperConfig::from_yaml(SAMPLE_CONFIG_YAML).unwrap();
        cfg.session_ttl_secs = 1;
        let sim = Arc::new(StdMutex::new(RouterSim::new()));
        let pool = Arc::new(TransportPool::with_factory(
            &cfg,
            Box::new(move |_| Box::new(MockShell::simulated(Arc::clone(&sim)))),
        ));
        let api = ShaperApi::with_pool(&cfg, Arc::clone(&pool)).unwrap();

        api.start("office").await.unwrap();
        assert_eq!(pool.transport_count().await, 1);

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert_eq!(api.sweep().await, 1);
        assert_eq!(pool.transport_count().await, 0);
    }

    #[tokio::test]
    async fn test_two_sessions_share_one_transport() {
        let sim = Arc::new(StdMutex::new(RouterSim::new()));
        let (api, pool) = api_over(sim);

        let a = api.start("office").await.unwrap();
        let b = api.start("office").await.unwrap();
        assert_eq!(pool.transport_count().await, 1);
        assert_eq!(pool.session_count("office").await, 2);

        api.end(&a.session_id).await.unwrap();
        assert_eq!(pool.transport_count().await, 1);
        api.end(&b.session_id).await.unwrap();
        assert_eq!(pool.transport_count().await, 0);
    }
}
