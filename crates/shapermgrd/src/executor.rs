//! Idempotent command execution.
//!
//! The remote chain/queueing primitives are not natively idempotent:
//! re-creating an existing chain errors, deleting an absent qdisc
//! errors. This module is the one place that knows which remote error
//! texts mean "the state you wanted is already there" and converts
//! them into success. Everything else is a real failure.

use std::sync::Arc;
use tracing::{debug, warn};

use shaper_common::shell::ExecResult;
use shaper_common::{ShaperError, ShaperResult};

use crate::transport::TransportPool;

/// What a successfully executed idempotent command actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The command ran and changed remote state.
    Applied,
    /// The remote object was already in the requested state.
    AlreadyApplied,
}

/// Direction of an idempotent command, selecting which benign
/// patterns apply. "Already exists" excuses a create, never a delete,
/// and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Creates a remote object (chain, qdisc, class, filter, jump).
    Create,
    /// Removes a remote object or rule.
    Delete,
}

/// The enumerated classification table: remote error text that means
/// the operation's goal state already holds.
pub const BENIGN_PATTERNS: &[(CommandKind, &str)] = &[
    (CommandKind::Create, "Chain already exists"),
    (CommandKind::Create, "File exists"),
    (CommandKind::Delete, "No chain/target/match by that name"),
    (CommandKind::Delete, "No such file or directory"),
    (CommandKind::Delete, "Bad rule (does a matching rule exist"),
    (CommandKind::Delete, "Cannot delete qdisc with handle of zero"),
];

/// Classifies a failed result: `Some(AlreadyApplied)` when the error
/// text matches a benign pattern for this command kind, else `None`.
pub fn classify(kind: CommandKind, result: &ExecResult) -> Option<Verdict> {
    let text = result.combined_output();
    BENIGN_PATTERNS
        .iter()
        .any(|(k, pattern)| *k == kind && text.contains(pattern))
        .then_some(Verdict::AlreadyApplied)
}

/// Executes commands through the shared transport pool, converting
/// benign "already applied" remote errors into success.
#[derive(Clone)]
pub struct IdempotentExecutor {
    pool: Arc<TransportPool>,
}

impl IdempotentExecutor {
    /// Creates an executor over a transport pool.
    pub fn new(pool: Arc<TransportPool>) -> Self {
        Self { pool }
    }

    async fn run_classified(
        &self,
        router_id: &str,
        cmd: &str,
        kind: CommandKind,
    ) -> ShaperResult<Verdict> {
        let result = self.pool.run(router_id, cmd).await?;
        if result.success() {
            return Ok(Verdict::Applied);
        }
        match classify(kind, &result) {
            Some(verdict) => {
                debug!(router = %router_id, command = %cmd, "Already applied");
                Ok(verdict)
            }
            None => {
                warn!(
                    router = %router_id,
                    command = %cmd,
                    exit_code = result.exit_code,
                    stderr = %result.stderr,
                    "Remote command failed"
                );
                Err(ShaperError::RemoteCommandFailed {
                    command: cmd.to_string(),
                    exit_code: result.exit_code,
                    output: result.combined_output(),
                })
            }
        }
    }

    /// Runs an object-creating command; "already exists" counts as
    /// success.
    pub async fn create(&self, router_id: &str, cmd: &str) -> ShaperResult<Verdict> {
        self.run_classified(router_id, cmd, CommandKind::Create).await
    }

    /// Runs an object-removing command; "already absent" counts as
    /// success.
    pub async fn delete(&self, router_id: &str, cmd: &str) -> ShaperResult<Verdict> {
        self.run_classified(router_id, cmd, CommandKind::Delete).await
    }

    /// Runs a command with no benign excuses; any non-zero exit is a
    /// real failure.
    pub async fn strict(&self, router_id: &str, cmd: &str) -> ShaperResult<ExecResult> {
        let result = self.pool.run(router_id, cmd).await?;
        if result.success() {
            Ok(result)
        } else {
            warn!(
                router = %router_id,
                command = %cmd,
                exit_code = result.exit_code,
                "Remote command failed"
            );
            Err(ShaperError::RemoteCommandFailed {
                command: cmd.to_string(),
                exit_code: result.exit_code,
                output: result.combined_output(),
            })
        }
    }

    /// Runs an existence probe: true on exit 0, false on any non-zero
    /// exit. Channel failures still propagate.
    pub async fn probe(&self, router_id: &str, cmd: &str) -> ShaperResult<bool> {
        let result = self.pool.run(router_id, cmd).await?;
        Ok(result.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shaper_common::config::ShaperConfig;
    use shaper_testing::{MockShell, ScriptedRule, SAMPLE_CONFIG_YAML};

    const ROUTER: &str = "living-room";

    fn failed(stderr: &str) -> ExecResult {
        ExecResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_classify_create_patterns() {
        assert_eq!(
            classify(CommandKind::Create, &failed("iptables: Chain already exists.")),
            Some(Verdict::AlreadyApplied)
        );
        assert_eq!(
            classify(CommandKind::Create, &failed("RTNETLINK answers: File exists")),
            Some(Verdict::AlreadyApplied)
        );
        // Absence text does not excuse a create.
        assert_eq!(
            classify(
                CommandKind::Create,
                &failed("iptables: No chain/target/match by that name.")
            ),
            None
        );
    }

    #[test]
    fn test_classify_delete_patterns() {
        assert_eq!(
            classify(
                CommandKind::Delete,
                &failed("iptables: No chain/target/match by that name.")
            ),
            Some(Verdict::AlreadyApplied)
        );
        assert_eq!(
            classify(
                CommandKind::Delete,
                &failed("RTNETLINK answers: No such file or directory")
            ),
            Some(Verdict::AlreadyApplied)
        );
        assert_eq!(
            classify(
                CommandKind::Delete,
                &failed("iptables: Bad rule (does a matching rule exist in that chain?).")
            ),
            Some(Verdict::AlreadyApplied)
        );
        // Existence text does not excuse a delete.
        assert_eq!(
            classify(CommandKind::Delete, &failed("RTNETLINK answers: File exists")),
            None
        );
    }

    #[test]
    fn test_classify_unknown_text_is_real_failure() {
        assert_eq!(
            classify(CommandKind::Create, &failed("iptables: unknown option --set-merk")),
            None
        );
    }

    fn executor(rules: Vec<ScriptedRule>) -> IdempotentExecutor {
        let cfg = ShaperConfig::from_yaml(SAMPLE_CONFIG_YAML).unwrap();
        let pool = TransportPool::with_factory(
            &cfg,
            Box::new(move |_| Box::new(MockShell::scripted(rules.clone()))),
        );
        IdempotentExecutor::new(Arc::new(pool))
    }

    #[tokio::test]
    async fn test_create_converts_exists_to_success() {
        let exec = executor(vec![ScriptedRule::fail(
            "-N SHAPER_WL",
            1,
            "iptables: Chain already exists.",
        )]);
        let verdict = exec
            .create(ROUTER, "/usr/sbin/iptables -t mangle -N SHAPER_WL")
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::AlreadyApplied);
    }

    #[tokio::test]
    async fn test_create_real_failure_surfaces() {
        let exec = executor(vec![ScriptedRule::fail(
            "-N SHAPER_WL",
            2,
            "iptables: can't initialize iptables table 'mangle'",
        )]);
        let err = exec
            .create(ROUTER, "/usr/sbin/iptables -t mangle -N SHAPER_WL")
            .await
            .unwrap_err();
        assert!(matches!(err, ShaperError::RemoteCommandFailed { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_delete_converts_absent_to_success() {
        let exec = executor(vec![ScriptedRule::fail(
            "qdisc del",
            2,
            "RTNETLINK answers: No such file or directory",
        )]);
        let verdict = exec
            .delete(ROUTER, "/sbin/tc qdisc del dev br-lan root")
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::AlreadyApplied);
    }

    #[tokio::test]
    async fn test_strict_rejects_benign_text_too() {
        let exec = executor(vec![ScriptedRule::fail(
            "-F SHAPER_BL",
            1,
            "iptables: No chain/target/match by that name.",
        )]);
        let err = exec
            .strict(ROUTER, "/usr/sbin/iptables -t mangle -F SHAPER_BL")
            .await
            .unwrap_err();
        assert!(matches!(err, ShaperError::RemoteCommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_probe_maps_exit_code() {
        let exec = executor(vec![ScriptedRule::fail(
            "-C PREROUTING",
            1,
            "iptables: Bad rule (does a matching rule exist in that chain?).",
        )]);
        assert!(!exec
            .probe(ROUTER, "/usr/sbin/iptables -t mangle -C PREROUTING -j SHAPER_WL")
            .await
            .unwrap());
        assert!(exec.probe(ROUTER, "true").await.unwrap());
    }
}
