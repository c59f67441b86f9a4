//! Read-only health and conformance validation.
//!
//! Operational tooling calls this surface to answer three questions
//! without mutating anything: is the baseline infrastructure present,
//! do the chains conform to the default-rule-last ordering, and which
//! mode's hook jump is currently active. The policy engine itself
//! never consumes these answers.

use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

use shaper_common::ShaperResult;

use crate::commands::{
    build_check_jump_cmd, build_list_chain_cmd, build_show_qdisc_cmd, CHAIN_BLACKLIST,
    CHAIN_WHITELIST,
};
use crate::transport::TransportPool;
use crate::types::Mode;

/// Health of one classification chain.
#[derive(Debug, Clone, Serialize)]
pub struct ChainHealth {
    /// Whether the chain exists.
    pub exists: bool,
    /// Number of rules in the chain.
    pub rule_count: usize,
    /// Whether the default rule, if present, is last and unique, with
    /// every device rule ahead of it.
    pub ordering_conformant: bool,
}

/// Snapshot of a router's managed state.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Whitelist chain health.
    pub whitelist_chain: ChainHealth,
    /// Blacklist chain health.
    pub blacklist_chain: ChainHealth,
    /// Whether the HTB root qdisc is on the LAN interface.
    pub root_qdisc_present: bool,
    /// Whether the whitelist hook jump is in place.
    pub whitelist_jump_active: bool,
    /// Whether the blacklist hook jump is in place.
    pub blacklist_jump_active: bool,
    /// Mode derived from the jumps: `None` when both jumps are
    /// present (the freshly provisioned, not-yet-applied state is
    /// ambiguous).
    pub active_mode: Option<Mode>,
}

impl HealthReport {
    /// Whether the durable baseline is fully present.
    pub fn baseline_ok(&self) -> bool {
        self.whitelist_chain.exists && self.blacklist_chain.exists && self.root_qdisc_present
    }
}

/// Parses an `iptables -S <chain>` dump into chain health.
///
/// A non-zero exit means the chain does not exist.
pub fn parse_chain_listing(chain: &str, exit_code: i32, stdout: &str) -> ChainHealth {
    if exit_code != 0 {
        return ChainHealth {
            exists: false,
            rule_count: 0,
            ordering_conformant: false,
        };
    }
    let prefix = format!("-A {} ", chain);
    let rules: Vec<&str> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with(&prefix))
        .collect();
    ChainHealth {
        exists: true,
        rule_count: rules.len(),
        ordering_conformant: ordering_conformant(&rules),
    }
}

/// The default-rule-last check: at most one unconditional mark rule,
/// and nothing after it.
fn ordering_conformant(rules: &[&str]) -> bool {
    let default_positions: Vec<usize> = rules
        .iter()
        .enumerate()
        .filter(|(_, r)| r.contains("-j MARK") && !r.contains("--mac-source"))
        .map(|(i, _)| i)
        .collect();
    match default_positions.as_slice() {
        [] => true,
        [only] => *only == rules.len() - 1,
        _ => false,
    }
}

/// Derives the active mode from the hook jumps.
fn derive_mode(whitelist_jump: bool, blacklist_jump: bool) -> Option<Mode> {
    match (whitelist_jump, blacklist_jump) {
        (true, false) => Some(Mode::Whitelist),
        (false, true) => Some(Mode::Blacklist),
        (false, false) => Some(Mode::None),
        (true, true) => None,
    }
}

/// Runs the read-only validation probes against a router.
pub struct HealthChecker {
    pool: Arc<TransportPool>,
    lan_interface: String,
}

impl HealthChecker {
    /// Creates a checker for the configured LAN interface.
    pub fn new(pool: Arc<TransportPool>, lan_interface: impl Into<String>) -> Self {
        Self {
            pool,
            lan_interface: lan_interface.into(),
        }
    }

    /// Collects a health snapshot. Issues only listing and probe
    /// commands.
    #[instrument(skip(self))]
    pub async fn check(&self, router_id: &str) -> ShaperResult<HealthReport> {
        let whitelist_chain = self.chain_health(router_id, CHAIN_WHITELIST).await?;
        let blacklist_chain = self.chain_health(router_id, CHAIN_BLACKLIST).await?;

        let qdisc = self
            .pool
            .run(router_id, &build_show_qdisc_cmd(&self.lan_interface))
            .await?;
        let root_qdisc_present = qdisc.success() && qdisc.stdout.contains("htb");

        let whitelist_jump_active = self.jump_active(router_id, CHAIN_WHITELIST).await?;
        let blacklist_jump_active = self.jump_active(router_id, CHAIN_BLACKLIST).await?;

        Ok(HealthReport {
            whitelist_chain,
            blacklist_chain,
            root_qdisc_present,
            whitelist_jump_active,
            blacklist_jump_active,
            active_mode: derive_mode(whitelist_jump_active, blacklist_jump_active),
        })
    }

    async fn chain_health(&self, router_id: &str, chain: &str) -> ShaperResult<ChainHealth> {
        let result = self.pool.run(router_id, &build_list_chain_cmd(chain)).await?;
        Ok(parse_chain_listing(chain, result.exit_code, &result.stdout))
    }

    async fn jump_active(&self, router_id: &str, chain: &str) -> ShaperResult<bool> {
        let result = self.pool.run(router_id, &build_check_jump_cmd(chain)).await?;
        Ok(result.success())
    }
}
