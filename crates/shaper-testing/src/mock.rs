//! Scripted mock shell and stateful router simulation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shaper_common::error::{ShaperError, ShaperResult};
use shaper_common::shell::{ExecResult, RemoteShell};

/// Shared, inspectable log of every command a mock shell executed.
pub type CommandLog = Arc<Mutex<Vec<String>>>;

/// One scripted response: the first rule whose pattern is contained
/// in the command wins.
#[derive(Debug, Clone)]
pub struct ScriptedRule {
    /// Substring to match against the command.
    pub pattern: String,
    /// Exit code to report.
    pub exit_code: i32,
    /// Stderr text to report.
    pub stderr: String,
}

impl ScriptedRule {
    /// Creates a rule failing commands containing `pattern`.
    pub fn fail(pattern: impl Into<String>, exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }
}

/// In-memory model of the router state the engine manages.
///
/// Answers create/flush/delete commands the way iptables and tc do:
/// duplicate creates fail with the object-exists text, deletes of
/// absent objects fail with the not-found text. This is what makes
/// provisioning-idempotence tests honest — the second run really does
/// get the errors the executor must classify as benign.
#[derive(Debug, Default)]
pub struct RouterSim {
    /// Chain name -> appended rule suffixes (text after `-A <chain> `).
    chains: HashMap<String, Vec<String>>,
    /// Chains with a jump rule in PREROUTING, in insertion order.
    jumps: Vec<String>,
    /// Whether the root qdisc exists.
    root_qdisc: bool,
    /// classid -> class definition command.
    classes: HashMap<String, String>,
    /// filter handle -> flowid.
    filters: HashMap<String, String>,
}

impl RouterSim {
    /// Creates a simulation of a factory-fresh router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules currently appended to a chain.
    pub fn chain_rules(&self, chain: &str) -> Option<&[String]> {
        self.chains.get(chain).map(|v| v.as_slice())
    }

    /// Whether a chain exists.
    pub fn has_chain(&self, chain: &str) -> bool {
        self.chains.contains_key(chain)
    }

    /// Whether PREROUTING jumps into a chain.
    pub fn has_jump(&self, chain: &str) -> bool {
        self.jumps.iter().any(|c| c == chain)
    }

    /// Whether the root qdisc exists.
    pub fn has_root_qdisc(&self) -> bool {
        self.root_qdisc
    }

    /// Number of configured rate classes.
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Number of bound mark filters.
    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    /// Applies one command to the simulated state.
    pub fn apply(&mut self, cmd: &str) -> ExecResult {
        let tokens: Vec<&str> = cmd.split_whitespace().collect();
        if cmd.contains("iptables") {
            self.apply_iptables(cmd, &tokens)
        } else if cmd.contains("/tc ") || cmd.contains("tc ") {
            self.apply_tc(cmd, &tokens)
        } else {
            ok()
        }
    }

    fn apply_iptables(&mut self, cmd: &str, tokens: &[&str]) -> ExecResult {
        if let Some(chain) = arg_after(tokens, "-N") {
            if self.chains.contains_key(chain) {
                return fail(1, "iptables: Chain already exists.");
            }
            self.chains.insert(chain.to_string(), Vec::new());
            return ok();
        }
        if let Some(chain) = arg_after(tokens, "-F") {
            return match self.chains.get_mut(chain) {
                Some(rules) => {
                    rules.clear();
                    ok()
                }
                None => fail(1, "iptables: No chain/target/match by that name."),
            };
        }
        if let Some(chain) = arg_after(tokens, "-X") {
            return match self.chains.remove(chain) {
                Some(_) => ok(),
                None => fail(1, "iptables: No chain/target/match by that name."),
            };
        }
        if let Some(chain) = arg_after(tokens, "-A") {
            let suffix = rule_suffix(cmd, "-A", chain);
            return match self.chains.get_mut(chain) {
                Some(rules) => {
                    rules.push(suffix);
                    ok()
                }
                None => fail(1, "iptables: No chain/target/match by that name."),
            };
        }
        if arg_after(tokens, "-C") == Some("PREROUTING") {
            let target = arg_after(tokens, "-j").unwrap_or_default();
            return if self.has_jump(target) {
                ok()
            } else {
                fail(1, "iptables: Bad rule (does a matching rule exist in that chain?).")
            };
        }
        if arg_after(tokens, "-I") == Some("PREROUTING") {
            let target = arg_after(tokens, "-j").unwrap_or_default().to_string();
            self.jumps.insert(0, target);
            return ok();
        }
        if arg_after(tokens, "-D") == Some("PREROUTING") {
            let target = arg_after(tokens, "-j").unwrap_or_default();
            return match self.jumps.iter().position(|c| c == target) {
                Some(idx) => {
                    self.jumps.remove(idx);
                    ok()
                }
                None => fail(1, "iptables: Bad rule (does a matching rule exist in that chain?)."),
            };
        }
        if let Some(chain) = arg_after(tokens, "-S") {
            if chain != "PREROUTING" && !self.chains.contains_key(chain) {
                return fail(1, "iptables: No chain/target/match by that name.");
            }
            return ExecResult {
                exit_code: 0,
                stdout: self.listing(chain),
                stderr: String::new(),
            };
        }
        ok()
    }

    fn apply_tc(&mut self, cmd: &str, tokens: &[&str]) -> ExecResult {
        if cmd.contains("qdisc add") && cmd.contains("root") {
            if self.root_qdisc {
                return fail(2, "RTNETLINK answers: File exists");
            }
            self.root_qdisc = true;
            return ok();
        }
        if cmd.contains("qdisc del") && cmd.contains("root") {
            if !self.root_qdisc {
                return fail(2, "RTNETLINK answers: No such file or directory");
            }
            self.root_qdisc = false;
            self.classes.clear();
            self.filters.clear();
            return ok();
        }
        if cmd.contains("qdisc show") {
            let out = if self.root_qdisc {
                "qdisc htb 1: root refcnt 2 r2q 10 default 0x10 direct_packets_stat 0"
            } else {
                "qdisc fq_codel 0: root refcnt 2"
            };
            return ExecResult {
                exit_code: 0,
                stdout: out.to_string(),
                stderr: String::new(),
            };
        }
        if cmd.contains("class add") {
            if !self.root_qdisc {
                return fail(2, "RTNETLINK answers: No such file or directory");
            }
            let classid = arg_after(tokens, "classid").unwrap_or_default().to_string();
            if self.classes.contains_key(&classid) {
                return fail(2, "RTNETLINK answers: File exists");
            }
            self.classes.insert(classid, cmd.to_string());
            return ok();
        }
        if cmd.contains("filter add") {
            if !self.root_qdisc {
                return fail(2, "RTNETLINK answers: No such file or directory");
            }
            let handle = arg_after(tokens, "handle").unwrap_or_default().to_string();
            let flowid = arg_after(tokens, "flowid").unwrap_or_default().to_string();
            if self.filters.contains_key(&handle) {
                return fail(2, "RTNETLINK answers: File exists");
            }
            self.filters.insert(handle, flowid);
            return ok();
        }
        ok()
    }

    /// Renders an `iptables -S <chain>` style listing.
    pub fn listing(&self, chain: &str) -> String {
        if chain == "PREROUTING" {
            let mut lines = vec!["-P PREROUTING ACCEPT".to_string()];
            lines.extend(self.jumps.iter().map(|c| format!("-A PREROUTING -j {}", c)));
            return lines.join("\n");
        }
        match self.chains.get(chain) {
            Some(rules) => {
                let mut lines = vec![format!("-N {}", chain)];
                lines.extend(rules.iter().map(|r| format!("-A {} {}", chain, r)));
                lines.join("\n")
            }
            None => String::new(),
        }
    }
}

fn ok() -> ExecResult {
    ExecResult {
        exit_code: 0,
        stdout: String::new(),
        stderr: String::new(),
    }
}

fn fail(exit_code: i32, stderr: &str) -> ExecResult {
    ExecResult {
        exit_code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// Returns the token following `flag`, if any.
fn arg_after<'a>(tokens: &[&'a str], flag: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|t| *t == flag)
        .and_then(|i| tokens.get(i + 1))
        .copied()
}

/// Extracts the rule text after `-A <chain> ` in a command.
fn rule_suffix(cmd: &str, flag: &str, chain: &str) -> String {
    let marker = format!("{} {} ", flag, chain);
    cmd.find(&marker)
        .map(|i| cmd[i + marker.len()..].trim().to_string())
        .unwrap_or_default()
}

/// A `RemoteShell` for tests: captures every command and answers from
/// scripted rules, a [`RouterSim`], or plain success.
pub struct MockShell {
    log: CommandLog,
    rules: Vec<ScriptedRule>,
    sim: Option<Arc<Mutex<RouterSim>>>,
    unavailable: Arc<AtomicBool>,
    alive: bool,
}

impl MockShell {
    /// A shell on which every command succeeds with empty output.
    pub fn ok() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            rules: Vec::new(),
            sim: None,
            unavailable: Arc::new(AtomicBool::new(false)),
            alive: true,
        }
    }

    /// A shell answering from scripted rules (first match wins,
    /// otherwise success).
    pub fn scripted(rules: Vec<ScriptedRule>) -> Self {
        Self {
            rules,
            ..Self::ok()
        }
    }

    /// A shell recording into a caller-provided log, so several
    /// shells (or a factory's successive shells) share one stream.
    pub fn ok_with_log(log: CommandLog) -> Self {
        Self { log, ..Self::ok() }
    }

    /// A scripted shell recording into a caller-provided log.
    pub fn scripted_with_log(rules: Vec<ScriptedRule>, log: CommandLog) -> Self {
        Self {
            rules,
            log,
            ..Self::ok()
        }
    }

    /// A shell backed by a stateful [`RouterSim`].
    pub fn simulated(sim: Arc<Mutex<RouterSim>>) -> Self {
        Self {
            sim: Some(sim),
            ..Self::ok()
        }
    }

    /// Handle to the command log; clone before moving the shell.
    pub fn log(&self) -> CommandLog {
        Arc::clone(&self.log)
    }

    /// Handle to the channel-failure switch; while set, every execute
    /// returns `TransportUnavailable`.
    pub fn unavailable_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.unavailable)
    }
}

#[async_trait]
impl RemoteShell for MockShell {
    async fn execute(&mut self, cmd: &str, _timeout: Duration) -> ShaperResult<ExecResult> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ShaperError::transport_unavailable("mock", "channel down"));
        }
        self.log
            .lock()
            .expect("command log poisoned")
            .push(cmd.to_string());

        if let Some(sim) = &self.sim {
            return Ok(sim.lock().expect("router sim poisoned").apply(cmd));
        }
        for rule in &self.rules {
            if cmd.contains(&rule.pattern) {
                return Ok(ExecResult {
                    exit_code: rule.exit_code,
                    stdout: String::new(),
                    stderr: rule.stderr.clone(),
                });
            }
        }
        Ok(ok())
    }

    async fn is_alive(&mut self) -> bool {
        self.alive && !self.unavailable.load(Ordering::SeqCst)
    }

    async fn reconnect(&mut self) -> ShaperResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ShaperError::transport_unavailable("mock", "channel down"));
        }
        self.alive = true;
        Ok(())
    }

    async fn close(&mut self) {
        self.alive = false;
    }
}
