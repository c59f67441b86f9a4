//! Policy rule construction.
//!
//! `build` is a pure function from a policy snapshot to the ordered
//! command sequence that realizes it. Two invariants govern the
//! output:
//!
//! - The chain's unconditional default rule is always last; every
//!   device rule precedes it. A default rule ahead of its exceptions
//!   would shadow them.
//! - No rule ever targets a protected device's MAC with a limiting
//!   mark.
//!
//! The target chain is rebuilt in full on every change — flush, then
//! repopulate — never patched incrementally, so stale or misordered
//! leftovers cannot survive a build. Activation (the jump from the
//! hook chain) comes only after the chain is fully populated.

use std::collections::BTreeSet;

use crate::commands::{
    build_check_jump_cmd, build_default_mark_cmd, build_device_mark_cmd, build_device_return_cmd,
    build_flush_chain_cmd, build_insert_jump_cmd, CHAIN_BLACKLIST, CHAIN_WHITELIST, MARK_FULL,
    MARK_LIMITED,
};
use crate::types::{MacAddr, Mode, Policy};

/// Chain activation pair: probe for the jump, insert it if absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    /// Existence probe (exit 0 when the jump is already there).
    pub probe: String,
    /// Jump insertion command.
    pub insert: String,
}

/// The ordered command sequence realizing one policy snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyProgram {
    /// The policy's mode.
    pub mode: Mode,
    /// Chain being populated; `None` for a teardown-only program.
    pub target_chain: Option<&'static str>,
    /// Flush commands, executed first.
    pub flushes: Vec<String>,
    /// Chain population commands, in evaluation order. The default
    /// rule, when present, is the final element.
    pub rules: Vec<String>,
    /// Activation, executed only after every rule is in place.
    pub activation: Option<Activation>,
}

impl PolicyProgram {
    /// The full program as one flat ordered command list.
    pub fn as_commands(&self) -> Vec<String> {
        let mut out = self.flushes.clone();
        out.extend(self.rules.iter().cloned());
        if let Some(activation) = &self.activation {
            out.push(activation.insert.clone());
        }
        out
    }
}

/// Builds the ordered command sequence for a policy snapshot.
///
/// Deterministic: `device_set` is an ordered set, so the same policy
/// always yields the same sequence.
pub fn build(policy: &Policy, protected: &BTreeSet<MacAddr>) -> PolicyProgram {
    match policy.mode {
        Mode::None => PolicyProgram {
            mode: Mode::None,
            target_chain: None,
            flushes: vec![
                build_flush_chain_cmd(CHAIN_WHITELIST),
                build_flush_chain_cmd(CHAIN_BLACKLIST),
            ],
            rules: Vec::new(),
            activation: None,
        },
        Mode::Whitelist => {
            // Listed devices (and protected ones, unconditionally)
            // return unmarked and keep full rate; the default rule
            // limits everyone else.
            let mut rules: Vec<String> = policy
                .device_set
                .union(protected)
                .map(|mac| build_device_return_cmd(CHAIN_WHITELIST, mac))
                .collect();
            rules.push(build_default_mark_cmd(CHAIN_WHITELIST, MARK_LIMITED));
            PolicyProgram {
                mode: Mode::Whitelist,
                target_chain: Some(CHAIN_WHITELIST),
                flushes: vec![build_flush_chain_cmd(CHAIN_WHITELIST)],
                rules,
                activation: Some(activation_for(CHAIN_WHITELIST)),
            }
        }
        Mode::Blacklist => {
            // Listed devices are marked limited; protected devices
            // are exempt; the default rule marks full rate.
            let mut rules: Vec<String> = policy
                .device_set
                .difference(protected)
                .map(|mac| build_device_mark_cmd(CHAIN_BLACKLIST, mac, MARK_LIMITED))
                .collect();
            rules.push(build_default_mark_cmd(CHAIN_BLACKLIST, MARK_FULL));
            PolicyProgram {
                mode: Mode::Blacklist,
                target_chain: Some(CHAIN_BLACKLIST),
                flushes: vec![build_flush_chain_cmd(CHAIN_BLACKLIST)],
                rules,
                activation: Some(activation_for(CHAIN_BLACKLIST)),
            }
        }
    }
}

fn activation_for(chain: &str) -> Activation {
    Activation {
        probe: build_check_jump_cmd(chain),
        insert: build_insert_jump_cmd(chain),
    }
}
