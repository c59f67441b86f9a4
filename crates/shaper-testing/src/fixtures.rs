//! Test fixtures for common shaper patterns
//!
//! Provides reusable MAC addresses, configuration YAML, and scripted
//! benign-error rule sets for engine testing.

use crate::mock::ScriptedRule;

/// Well-formed device MACs used across tests.
pub const MAC_PHONE: &str = "aa:bb:cc:dd:ee:01";
/// Second well-formed device MAC.
pub const MAC_LAPTOP: &str = "aa:bb:cc:dd:ee:02";
/// Third well-formed device MAC.
pub const MAC_TV: &str = "11:22:33:44:55:66";
/// MAC conventionally used as a protected (router/admin) device.
pub const MAC_ROUTER: &str = "c4:6e:1f:00:aa:01";

/// A daemon configuration with two routers and short timings.
pub const SAMPLE_CONFIG_YAML: &str = r#"
lan_interface: br-lan
full_rate: 100mbit
limited_rate: 2mbit
session_ttl_secs: 2
command_timeout_secs: 5
protected_devices:
  - "c4:6e:1f:00:aa:01"
routers:
  - id: living-room
    host: 192.168.1.1
  - id: office
    host: 10.0.0.1
    port: 2222
    user: admin
"#;

/// Scripted rules making every create command answer with its
/// object-exists text, as a router with the baseline already in
/// place would.
pub fn already_provisioned_rules() -> Vec<ScriptedRule> {
    vec![
        ScriptedRule::fail("-N ", 1, "iptables: Chain already exists."),
        ScriptedRule::fail("qdisc add", 2, "RTNETLINK answers: File exists"),
        ScriptedRule::fail("class add", 2, "RTNETLINK answers: File exists"),
        ScriptedRule::fail("filter add", 2, "RTNETLINK answers: File exists"),
        // Jump probes succeed so no insert is attempted.
    ]
}

/// Scripted rules making every delete/flush command answer with its
/// object-absent text, as a factory-fresh router would.
pub fn factory_fresh_rules() -> Vec<ScriptedRule> {
    vec![
        ScriptedRule::fail("-F ", 1, "iptables: No chain/target/match by that name."),
        ScriptedRule::fail("-X ", 1, "iptables: No chain/target/match by that name."),
        ScriptedRule::fail(
            "-D PREROUTING",
            1,
            "iptables: Bad rule (does a matching rule exist in that chain?).",
        ),
        ScriptedRule::fail("qdisc del", 2, "RTNETLINK answers: No such file or directory"),
    ]
}
