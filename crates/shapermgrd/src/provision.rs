//! Baseline infrastructure provisioning.
//!
//! The durable remote objects — the two classification chains, the
//! HTB root with its two rate classes, the mark-to-class filters, and
//! the hook jumps — are built here. Every step is independently
//! idempotent, so `ensure_baseline` runs unconditionally at every
//! session start and converges on the same state whether the router
//! is factory fresh or fully provisioned.

use serde::Serialize;
use tracing::{info, instrument, warn};

use shaper_common::ShaperResult;

use crate::commands::{
    build_add_class_cmd, build_add_filter_cmd, build_add_root_qdisc_cmd, build_check_jump_cmd,
    build_create_chain_cmd, build_insert_jump_cmd, CHAIN_BLACKLIST, CHAIN_WHITELIST, CLASSID_FULL,
    CLASSID_LIMITED, MARK_FULL, MARK_LIMITED,
};
use crate::executor::{IdempotentExecutor, Verdict};
use crate::types::Rate;

/// The provisioning steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisionStep {
    /// Create the whitelist classification chain.
    WhitelistChain,
    /// Create the blacklist classification chain.
    BlacklistChain,
    /// Create the root queueing discipline on the LAN interface.
    RootQdisc,
    /// Create the full-rate class under the root.
    FullRateClass,
    /// Create the limited-rate class under the root.
    LimitedRateClass,
    /// Bind the full mark to the full-rate class.
    FullRateFilter,
    /// Bind the limited mark to the limited-rate class.
    LimitedRateFilter,
    /// Hook the whitelist chain into the marking stage.
    WhitelistJump,
    /// Hook the blacklist chain into the marking stage.
    BlacklistJump,
}

impl ProvisionStep {
    /// Step name for logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            ProvisionStep::WhitelistChain => "whitelist-chain",
            ProvisionStep::BlacklistChain => "blacklist-chain",
            ProvisionStep::RootQdisc => "root-qdisc",
            ProvisionStep::FullRateClass => "full-rate-class",
            ProvisionStep::LimitedRateClass => "limited-rate-class",
            ProvisionStep::FullRateFilter => "full-rate-filter",
            ProvisionStep::LimitedRateFilter => "limited-rate-filter",
            ProvisionStep::WhitelistJump => "whitelist-jump",
            ProvisionStep::BlacklistJump => "blacklist-jump",
        }
    }
}

/// Outcome of one provisioning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepVerdict {
    /// The step changed remote state.
    Applied,
    /// The remote object already existed.
    AlreadyApplied,
    /// The router rejected the step.
    Failed,
}

impl From<Verdict> for StepVerdict {
    fn from(v: Verdict) -> Self {
        match v {
            Verdict::Applied => StepVerdict::Applied,
            Verdict::AlreadyApplied => StepVerdict::AlreadyApplied,
        }
    }
}

/// Per-step detail in a provisioning report.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    /// Which step.
    pub step: ProvisionStep,
    /// How it went.
    pub verdict: StepVerdict,
    /// Failure output, when the step failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Step-by-step record of one `ensure_baseline` run.
///
/// Provisioning stops at the first failing step; the report then
/// names it so an operator can target a retry. A partially applied
/// baseline is never reported as success.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisionReport {
    /// Executed steps, in order, up to and including any failure.
    pub steps: Vec<StepOutcome>,
}

impl ProvisionReport {
    /// True when every step applied (freshly or already).
    pub fn complete(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.verdict != StepVerdict::Failed)
    }

    /// The failing step, if any.
    pub fn failed_step(&self) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.verdict == StepVerdict::Failed)
    }

    fn record(&mut self, step: ProvisionStep, verdict: StepVerdict, detail: Option<String>) {
        self.steps.push(StepOutcome {
            step,
            verdict,
            detail,
        });
    }
}

/// Builds and validates the durable baseline, once per router
/// lifecycle, safely re-runnable.
pub struct Provisioner {
    exec: IdempotentExecutor,
    lan_interface: String,
    full_rate: Rate,
    limited_rate: Rate,
}

impl Provisioner {
    /// Creates a provisioner for the configured LAN interface and
    /// baseline rates.
    pub fn new(
        exec: IdempotentExecutor,
        lan_interface: impl Into<String>,
        full_rate: Rate,
        limited_rate: Rate,
    ) -> Self {
        Self {
            exec,
            lan_interface: lan_interface.into(),
            full_rate,
            limited_rate,
        }
    }

    /// Ensures the baseline exists on a router.
    ///
    /// Returns `Err` only on channel failures (retry the whole call);
    /// a router-side rejection is recorded in the report, which stops
    /// at that step.
    #[instrument(skip(self))]
    pub async fn ensure_baseline(&self, router_id: &str) -> ShaperResult<ProvisionReport> {
        let dev = self.lan_interface.as_str();
        let creates = [
            (ProvisionStep::WhitelistChain, build_create_chain_cmd(CHAIN_WHITELIST)),
            (ProvisionStep::BlacklistChain, build_create_chain_cmd(CHAIN_BLACKLIST)),
            (ProvisionStep::RootQdisc, build_add_root_qdisc_cmd(dev)),
            (
                ProvisionStep::FullRateClass,
                build_add_class_cmd(dev, CLASSID_FULL, &self.full_rate),
            ),
            (
                ProvisionStep::LimitedRateClass,
                build_add_class_cmd(dev, CLASSID_LIMITED, &self.limited_rate),
            ),
            (
                ProvisionStep::FullRateFilter,
                build_add_filter_cmd(dev, MARK_FULL, CLASSID_FULL),
            ),
            (
                ProvisionStep::LimitedRateFilter,
                build_add_filter_cmd(dev, MARK_LIMITED, CLASSID_LIMITED),
            ),
        ];

        let mut report = ProvisionReport::default();
        for (step, cmd) in creates {
            if !self.run_step(router_id, step, &cmd, &mut report).await? {
                return Ok(report);
            }
        }

        for (step, chain) in [
            (ProvisionStep::WhitelistJump, CHAIN_WHITELIST),
            (ProvisionStep::BlacklistJump, CHAIN_BLACKLIST),
        ] {
            if !self.ensure_jump(router_id, step, chain, &mut report).await? {
                return Ok(report);
            }
        }

        info!(router = %router_id, "Baseline provisioned");
        Ok(report)
    }

    /// Runs one create step; false stops the sequence.
    async fn run_step(
        &self,
        router_id: &str,
        step: ProvisionStep,
        cmd: &str,
        report: &mut ProvisionReport,
    ) -> ShaperResult<bool> {
        match self.exec.create(router_id, cmd).await {
            Ok(verdict) => {
                report.record(step, verdict.into(), None);
                Ok(true)
            }
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                warn!(router = %router_id, step = step.name(), error = %e, "Provisioning step failed");
                report.record(step, StepVerdict::Failed, Some(e.to_string()));
                Ok(false)
            }
        }
    }

    /// Ensures a hook jump exists, probing before insert to avoid
    /// duplicates.
    async fn ensure_jump(
        &self,
        router_id: &str,
        step: ProvisionStep,
        chain: &str,
        report: &mut ProvisionReport,
    ) -> ShaperResult<bool> {
        if self.exec.probe(router_id, &build_check_jump_cmd(chain)).await? {
            report.record(step, StepVerdict::AlreadyApplied, None);
            return Ok(true);
        }
        match self.exec.strict(router_id, &build_insert_jump_cmd(chain)).await {
            Ok(_) => {
                report.record(step, StepVerdict::Applied, None);
                Ok(true)
            }
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                warn!(router = %router_id, step = step.name(), error = %e, "Jump insertion failed");
                report.record(step, StepVerdict::Failed, Some(e.to_string()));
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportPool;
    use shaper_common::config::ShaperConfig;
    use shaper_testing::{CommandLog, MockShell, RouterSim, ScriptedRule, SAMPLE_CONFIG_YAML};
    use std::sync::{Arc, Mutex};

    const ROUTER: &str = "living-room";

    fn provisioner_with_factory(
        factory: crate::transport::ShellFactory,
    ) -> Provisioner {
        let cfg = ShaperConfig::from_yaml(SAMPLE_CONFIG_YAML).unwrap();
        let pool = Arc::new(TransportPool::with_factory(&cfg, factory));
        Provisioner::new(
            IdempotentExecutor::new(pool),
            cfg.lan_interface.clone(),
            Rate::parse(&cfg.full_rate).unwrap(),
            Rate::parse(&cfg.limited_rate).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_fresh_router_applies_all_steps() {
        let sim = Arc::new(Mutex::new(RouterSim::new()));
        let shell_sim = Arc::clone(&sim);
        let prov = provisioner_with_factory(Box::new(move |_| {
            Box::new(MockShell::simulated(Arc::clone(&shell_sim)))
        }));

        let report = prov.ensure_baseline(ROUTER).await.unwrap();
        assert!(report.complete());
        assert_eq!(report.steps.len(), 9);
        assert!(report
            .steps
            .iter()
            .all(|s| s.verdict == StepVerdict::Applied));

        let sim = sim.lock().unwrap();
        assert!(sim.has_chain("SHAPER_WL"));
        assert!(sim.has_chain("SHAPER_BL"));
        assert!(sim.has_root_qdisc());
        assert_eq!(sim.class_count(), 2);
        assert_eq!(sim.filter_count(), 2);
        assert!(sim.has_jump("SHAPER_WL"));
        assert!(sim.has_jump("SHAPER_BL"));
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let sim = Arc::new(Mutex::new(RouterSim::new()));
        let shell_sim = Arc::clone(&sim);
        let prov = provisioner_with_factory(Box::new(move |_| {
            Box::new(MockShell::simulated(Arc::clone(&shell_sim)))
        }));

        prov.ensure_baseline(ROUTER).await.unwrap();
        let second = prov.ensure_baseline(ROUTER).await.unwrap();

        // No step of the second run fails; every one is already
        // applied.
        assert!(second.complete());
        assert!(second
            .steps
            .iter()
            .all(|s| s.verdict == StepVerdict::AlreadyApplied));
    }

    #[tokio::test]
    async fn test_steps_issue_commands_in_order() {
        // Chains before the queueing tree, the tree before its
        // classes and filters, hook probes last.
        let log: CommandLog = Arc::new(Mutex::new(Vec::new()));
        let shared = Arc::clone(&log);
        let prov = provisioner_with_factory(Box::new(move |_| {
            Box::new(MockShell::ok_with_log(Arc::clone(&shared)))
        }));
        prov.ensure_baseline(ROUTER).await.unwrap();

        let commands = log.lock().unwrap().clone();
        let pos = |needle: &str| commands.iter().position(|c| c.contains(needle)).unwrap();
        assert!(pos("-N SHAPER_WL") < pos("-N SHAPER_BL"));
        assert!(pos("-N SHAPER_BL") < pos("qdisc add"));
        assert!(pos("qdisc add") < pos("classid 1:10"));
        assert!(pos("classid 1:20") < pos("handle 0x10 fw"));
        assert!(pos("handle 0x20 fw") < pos("-C PREROUTING -j SHAPER_WL"));
        assert!(pos("-C PREROUTING -j SHAPER_WL") < pos("-C PREROUTING -j SHAPER_BL"));
    }

    #[tokio::test]
    async fn test_failure_stops_and_names_the_step() {
        let prov = provisioner_with_factory(Box::new(|_| {
            Box::new(MockShell::scripted(vec![ScriptedRule::fail(
                "qdisc add",
                1,
                "Error: Specified device does not exist.",
            )]))
        }));

        let report = prov.ensure_baseline(ROUTER).await.unwrap();
        assert!(!report.complete());
        let failed = report.failed_step().unwrap();
        assert_eq!(failed.step, ProvisionStep::RootQdisc);
        assert!(failed.detail.as_ref().unwrap().contains("does not exist"));
        // Nothing after the failing step ran.
        assert_eq!(report.steps.len(), 3);
    }

    #[tokio::test]
    async fn test_report_serializes_for_operators() {
        let prov = provisioner_with_factory(Box::new(|_| Box::new(MockShell::ok())));
        let report = prov.ensure_baseline(ROUTER).await.unwrap();
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("whitelist-chain"));
        assert!(json.contains("applied"));
    }
}
