//! Shell command builders for the chain and queueing surface.
//!
//! Everything the engine says to a router is assembled here: mangle
//! chains and MAC-match mark rules on the iptables side, the HTB root
//! plus two rate classes and mark-to-class filters on the tc side.
//! Client-originated values (MACs, rates, interface names) pass
//! through `shellquote` at this boundary.

use shaper_common::shell::{self, shellquote};

use crate::types::{MacAddr, Rate};

/// Classification chain for whitelist mode.
pub const CHAIN_WHITELIST: &str = "SHAPER_WL";

/// Classification chain for blacklist mode.
pub const CHAIN_BLACKLIST: &str = "SHAPER_BL";

/// Built-in chain the classification chains hook into.
pub const HOOK_CHAIN: &str = "PREROUTING";

/// Packet mark routed to the full-rate class.
pub const MARK_FULL: u32 = 0x10;

/// Packet mark routed to the limited-rate class.
pub const MARK_LIMITED: u32 = 0x20;

/// Handle of the root queueing discipline.
pub const ROOT_HANDLE: &str = "1:";

/// Class id of the full-rate class. Minor number matches [`MARK_FULL`].
pub const CLASSID_FULL: &str = "1:10";

/// Class id of the limited-rate class. Minor matches [`MARK_LIMITED`].
pub const CLASSID_LIMITED: &str = "1:20";

/// Default minor class for unmarked traffic (the full-rate class).
pub const DEFAULT_CLASS_MINOR: &str = "10";

/// Build chain creation command.
pub fn build_create_chain_cmd(chain: &str) -> String {
    format!("{} -t mangle -N {}", shell::IPTABLES_CMD, chain)
}

/// Build chain flush command (removes all rules, keeps the chain).
pub fn build_flush_chain_cmd(chain: &str) -> String {
    format!("{} -t mangle -F {}", shell::IPTABLES_CMD, chain)
}

/// Build chain delete command. The chain must be empty and
/// unreferenced, so flush and jump removal come first.
pub fn build_delete_chain_cmd(chain: &str) -> String {
    format!("{} -t mangle -X {}", shell::IPTABLES_CMD, chain)
}

/// Build a device rule marking traffic from a MAC.
pub fn build_device_mark_cmd(chain: &str, mac: &MacAddr, mark: u32) -> String {
    format!(
        "{} -t mangle -A {} -m mac --mac-source {} -j MARK --set-mark {:#x}",
        shell::IPTABLES_CMD,
        chain,
        shellquote(mac.as_str()),
        mark
    )
}

/// Build a device rule returning traffic from a MAC unmarked, ahead
/// of the chain's default rule.
pub fn build_device_return_cmd(chain: &str, mac: &MacAddr) -> String {
    format!(
        "{} -t mangle -A {} -m mac --mac-source {} -j RETURN",
        shell::IPTABLES_CMD,
        chain,
        shellquote(mac.as_str())
    )
}

/// Build the chain's unconditional default rule. Must always be
/// appended last.
pub fn build_default_mark_cmd(chain: &str, mark: u32) -> String {
    format!(
        "{} -t mangle -A {} -j MARK --set-mark {:#x}",
        shell::IPTABLES_CMD,
        chain,
        mark
    )
}

/// Build the jump existence probe (exit 0 when the jump is present).
pub fn build_check_jump_cmd(chain: &str) -> String {
    format!(
        "{} -t mangle -C {} -j {}",
        shell::IPTABLES_CMD,
        HOOK_CHAIN,
        chain
    )
}

/// Build the jump insertion command.
pub fn build_insert_jump_cmd(chain: &str) -> String {
    format!(
        "{} -t mangle -I {} -j {}",
        shell::IPTABLES_CMD,
        HOOK_CHAIN,
        chain
    )
}

/// Build the jump removal command.
pub fn build_remove_jump_cmd(chain: &str) -> String {
    format!(
        "{} -t mangle -D {} -j {}",
        shell::IPTABLES_CMD,
        HOOK_CHAIN,
        chain
    )
}

/// Build a chain listing command (`-S` rule dump) for health checks.
pub fn build_list_chain_cmd(chain: &str) -> String {
    format!("{} -t mangle -S {}", shell::IPTABLES_CMD, chain)
}

/// Build root qdisc creation command. Unmarked traffic defaults to
/// the full-rate class.
pub fn build_add_root_qdisc_cmd(dev: &str) -> String {
    format!(
        "{} qdisc add dev {} root handle {} htb default {}",
        shell::TC_CMD,
        shellquote(dev),
        ROOT_HANDLE,
        DEFAULT_CLASS_MINOR
    )
}

/// Build root qdisc deletion command. Takes classes and filters with it.
pub fn build_del_root_qdisc_cmd(dev: &str) -> String {
    format!("{} qdisc del dev {} root", shell::TC_CMD, shellquote(dev))
}

/// Build qdisc listing command for health checks.
pub fn build_show_qdisc_cmd(dev: &str) -> String {
    format!("{} qdisc show dev {}", shell::TC_CMD, shellquote(dev))
}

/// Build rate class creation command under the root.
pub fn build_add_class_cmd(dev: &str, classid: &str, rate: &Rate) -> String {
    format!(
        "{} class add dev {} parent {} classid {} htb rate {} ceil {}",
        shell::TC_CMD,
        shellquote(dev),
        ROOT_HANDLE,
        classid,
        shellquote(rate.as_str()),
        shellquote(rate.as_str())
    )
}

/// Build mark-to-class filter bind command.
pub fn build_add_filter_cmd(dev: &str, mark: u32, classid: &str) -> String {
    format!(
        "{} filter add dev {} parent {} protocol ip handle {:#x} fw flowid {}",
        shell::TC_CMD,
        shellquote(dev),
        ROOT_HANDLE,
        mark,
        classid
    )
}
