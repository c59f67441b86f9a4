//! Policy application: the teardown → rebuild → activate transition.
//!
//! Every policy change, including reapplying the same mode, runs the
//! same full transition: remove both hook jumps, flush and delete
//! both chains, delete the queueing tree, rebuild the tree with the
//! policy's rates, rebuild the chains, populate the target chain, and
//! only then activate its jump. Incremental patching was deliberately
//! rejected — it cannot keep the default rule last under concurrent
//! edits; a full rebuild can, and is cheap at tens of devices.
//!
//! A transition runs to completion or failure — no cancellation. A
//! second transition for the same router queues behind the first on
//! the router's transition lock.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use shaper_common::ShaperResult;

use crate::commands::{
    build_add_class_cmd, build_add_filter_cmd, build_add_root_qdisc_cmd, build_create_chain_cmd,
    build_del_root_qdisc_cmd, build_delete_chain_cmd, build_flush_chain_cmd, build_remove_jump_cmd,
    CHAIN_BLACKLIST, CHAIN_WHITELIST, CLASSID_FULL, CLASSID_LIMITED, MARK_FULL, MARK_LIMITED,
};
use crate::executor::IdempotentExecutor;
use crate::policy::{self, PolicyProgram};
use crate::types::{MacAddr, Mode, Policy};

/// Phases of one policy transition, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyPhase {
    /// Remove both hook jumps.
    TeardownJumps,
    /// Flush and delete both classification chains.
    TeardownChains,
    /// Delete the queueing tree.
    TeardownQueueing,
    /// Recreate the queueing tree with the policy's rates.
    RebuildQueueing,
    /// Recreate both (empty) classification chains.
    RebuildChains,
    /// Populate the target chain, default rule last.
    PopulateChain,
    /// Insert the target chain's hook jump.
    Activate,
}

impl ApplyPhase {
    /// Phase name for logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            ApplyPhase::TeardownJumps => "teardown-jumps",
            ApplyPhase::TeardownChains => "teardown-chains",
            ApplyPhase::TeardownQueueing => "teardown-queueing",
            ApplyPhase::RebuildQueueing => "rebuild-queueing",
            ApplyPhase::RebuildChains => "rebuild-chains",
            ApplyPhase::PopulateChain => "populate-chain",
            ApplyPhase::Activate => "activate",
        }
    }
}

/// Outcome of one transition phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseOutcome {
    /// Which phase.
    pub phase: ApplyPhase,
    /// Whether every command of the phase succeeded.
    pub ok: bool,
    /// Failure output, when the phase failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Record of one policy transition.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// The mode being applied.
    pub mode: Mode,
    /// Executed phases, in order, up to and including any failure.
    pub phases: Vec<PhaseOutcome>,
}

impl ApplyReport {
    /// True when the whole transition succeeded.
    pub fn complete(&self) -> bool {
        self.phases.iter().all(|p| p.ok) && self.phases.len() == expected_phases(self.mode)
    }

    /// The failing phase, if any.
    pub fn failed_phase(&self) -> Option<&PhaseOutcome> {
        self.phases.iter().find(|p| !p.ok)
    }

    fn record_ok(&mut self, phase: ApplyPhase) {
        self.phases.push(PhaseOutcome {
            phase,
            ok: true,
            detail: None,
        });
    }

    fn record_failed(&mut self, phase: ApplyPhase, detail: String) {
        self.phases.push(PhaseOutcome {
            phase,
            ok: false,
            detail: Some(detail),
        });
    }
}

fn expected_phases(mode: Mode) -> usize {
    match mode {
        // No population or activation for mode none.
        Mode::None => 5,
        Mode::Whitelist | Mode::Blacklist => 7,
    }
}

/// Where a router stands in the applier's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplierState {
    /// Nothing applied yet, or the last transition failed midway.
    Unconfigured,
    /// The given mode was fully applied.
    Configured(Mode),
}

/// One command of a transition, tagged with how its result is judged.
enum Op {
    /// Already-exists is benign.
    Create(String),
    /// Already-absent is benign.
    Delete(String),
    /// Any non-zero exit is a real failure.
    Strict(String),
}

/// Drives policy transitions and tracks per-router applied state.
pub struct PolicyApplier {
    exec: IdempotentExecutor,
    lan_interface: String,
    state: Mutex<HashMap<String, ApplierState>>,
    /// Per-router transition locks; transitions never interleave.
    transitions: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PolicyApplier {
    /// Creates an applier executing on the configured LAN interface.
    pub fn new(exec: IdempotentExecutor, lan_interface: impl Into<String>) -> Self {
        Self {
            exec,
            lan_interface: lan_interface.into(),
            state: Mutex::new(HashMap::new()),
            transitions: Mutex::new(HashMap::new()),
        }
    }

    /// The applier's view of a router's configured mode.
    pub async fn state_of(&self, router_id: &str) -> ApplierState {
        self.state
            .lock()
            .await
            .get(router_id)
            .copied()
            .unwrap_or(ApplierState::Unconfigured)
    }

    async fn transition_lock(&self, router_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.transitions.lock().await;
        Arc::clone(
            locks
                .entry(router_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Applies a policy snapshot to a router.
    ///
    /// Returns `Err` only on channel failures. A router-side
    /// rejection aborts the transition; the report names the failing
    /// phase and the router is left unconfigured until a retry of the
    /// whole transition succeeds.
    #[instrument(skip(self, policy, protected), fields(mode = %policy.mode))]
    pub async fn apply(
        &self,
        router_id: &str,
        policy: &Policy,
        protected: &BTreeSet<MacAddr>,
    ) -> ShaperResult<ApplyReport> {
        let lock = self.transition_lock(router_id).await;
        let _guard = lock.lock().await;

        // A transition in flight means the previous configured mode
        // is no longer trustworthy.
        self.state
            .lock()
            .await
            .insert(router_id.to_string(), ApplierState::Unconfigured);

        let program = policy::build(policy, protected);
        let report = self.run_transition(router_id, policy, &program).await?;

        if report.complete() {
            self.state
                .lock()
                .await
                .insert(router_id.to_string(), ApplierState::Configured(policy.mode));
            info!(router = %router_id, mode = %policy.mode, "Policy applied");
        } else if let Some(failed) = report.failed_phase() {
            warn!(
                router = %router_id,
                phase = failed.phase.name(),
                "Policy transition aborted"
            );
        }
        Ok(report)
    }

    async fn run_transition(
        &self,
        router_id: &str,
        policy: &Policy,
        program: &PolicyProgram,
    ) -> ShaperResult<ApplyReport> {
        let dev = self.lan_interface.as_str();
        let mut report = ApplyReport {
            mode: policy.mode,
            phases: Vec::new(),
        };

        let teardown_jumps = vec![
            Op::Delete(build_remove_jump_cmd(CHAIN_WHITELIST)),
            Op::Delete(build_remove_jump_cmd(CHAIN_BLACKLIST)),
        ];
        let teardown_chains = vec![
            Op::Delete(build_flush_chain_cmd(CHAIN_WHITELIST)),
            Op::Delete(build_flush_chain_cmd(CHAIN_BLACKLIST)),
            Op::Delete(build_delete_chain_cmd(CHAIN_WHITELIST)),
            Op::Delete(build_delete_chain_cmd(CHAIN_BLACKLIST)),
        ];
        let teardown_queueing = vec![Op::Delete(build_del_root_qdisc_cmd(dev))];
        let rebuild_queueing = vec![
            Op::Create(build_add_root_qdisc_cmd(dev)),
            Op::Create(build_add_class_cmd(dev, CLASSID_FULL, &policy.full_rate)),
            Op::Create(build_add_class_cmd(dev, CLASSID_LIMITED, &policy.limited_rate)),
            Op::Create(build_add_filter_cmd(dev, MARK_FULL, CLASSID_FULL)),
            Op::Create(build_add_filter_cmd(dev, MARK_LIMITED, CLASSID_LIMITED)),
        ];
        let rebuild_chains = vec![
            Op::Create(build_create_chain_cmd(CHAIN_WHITELIST)),
            Op::Create(build_create_chain_cmd(CHAIN_BLACKLIST)),
        ];

        let phases: Vec<(ApplyPhase, Vec<Op>)> = vec![
            (ApplyPhase::TeardownJumps, teardown_jumps),
            (ApplyPhase::TeardownChains, teardown_chains),
            (ApplyPhase::TeardownQueueing, teardown_queueing),
            (ApplyPhase::RebuildQueueing, rebuild_queueing),
            (ApplyPhase::RebuildChains, rebuild_chains),
        ];

        for (phase, ops) in phases {
            if !self.run_phase(router_id, phase, &ops, &mut report).await? {
                return Ok(report);
            }
        }

        if program.target_chain.is_some() {
            let populate: Vec<Op> = program
                .flushes
                .iter()
                .chain(program.rules.iter())
                .cloned()
                .map(Op::Strict)
                .collect();
            if !self
                .run_phase(router_id, ApplyPhase::PopulateChain, &populate, &mut report)
                .await?
            {
                return Ok(report);
            }

            if let Some(activation) = &program.activation {
                let ok = if self.exec.probe(router_id, &activation.probe).await? {
                    true
                } else {
                    match self.exec.strict(router_id, &activation.insert).await {
                        Ok(_) => true,
                        Err(e) if e.is_retryable() => return Err(e),
                        Err(e) => {
                            report.record_failed(ApplyPhase::Activate, e.to_string());
                            false
                        }
                    }
                };
                if ok {
                    report.record_ok(ApplyPhase::Activate);
                } else {
                    return Ok(report);
                }
            }
        }

        Ok(report)
    }

    async fn run_phase(
        &self,
        router_id: &str,
        phase: ApplyPhase,
        ops: &[Op],
        report: &mut ApplyReport,
    ) -> ShaperResult<bool> {
        for op in ops {
            let result = match op {
                Op::Create(cmd) => self.exec.create(router_id, cmd).await.map(|_| ()),
                Op::Delete(cmd) => self.exec.delete(router_id, cmd).await.map(|_| ()),
                Op::Strict(cmd) => self.exec.strict(router_id, cmd).await.map(|_| ()),
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    report.record_failed(phase, e.to_string());
                    return Ok(false);
                }
            }
        }
        report.record_ok(phase);
        Ok(true)
    }
}
