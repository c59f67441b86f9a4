//! Remote shell primitives shared by the shaper crates.
//!
//! This module provides safe shell command quoting, the result type
//! for remote command execution, and the [`RemoteShell`] trait that
//! seams the engine off the concrete SSH channel so tests can script
//! router responses.
//!
//! # Example
//!
//! ```ignore
//! use shaper_common::shell::{self, IPTABLES_CMD, shellquote};
//!
//! let mac = "aa:bb:cc:dd:ee:01";
//! let cmd = format!("{} -t mangle -A SHAPER_BL -m mac --mac-source {} -j MARK --set-mark 0x20",
//!     IPTABLES_CMD, shellquote(mac));
//! ```

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

use crate::error::ShaperResult;

/// Path to the `iptables` command on the router.
pub const IPTABLES_CMD: &str = "/usr/sbin/iptables";

/// Path to the `tc` traffic-control command on the router.
pub const TC_CMD: &str = "/sbin/tc";

/// Path to the `ssh` client binary on the controller host.
pub const SSH_CMD: &str = "/usr/bin/ssh";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// Wraps the string in double quotes and escapes the characters that
/// keep meaning inside them: `$`, `` ` ``, `"`, `\`, and newline.
/// Every value that originates from a client (MAC addresses, rates,
/// interface names) must pass through here before it is spliced into
/// a command string.
///
/// # Example
///
/// ```
/// use shaper_common::shell::shellquote;
///
/// assert_eq!(shellquote("br-lan"), "\"br-lan\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a remote command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command on the router (0 = success).
    pub exit_code: i32,
    /// The captured stdout output.
    pub stdout: String,
    /// The captured stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// A single remote-execution channel to one router.
///
/// Implementations own the underlying connection (host, credentials,
/// channel handle). Commands on one channel execute strictly
/// sequentially; callers serialize access externally (the transport
/// pool holds each shell behind a per-router mutex). Streaming and
/// interactive commands are not supported — one invokable string in,
/// captured output back.
#[async_trait]
pub trait RemoteShell: Send {
    /// Executes a single shell-invokable command on the router.
    ///
    /// Returns `Ok(ExecResult)` whenever the command reached the
    /// router and ran, regardless of its exit code. Returns an error
    /// only when the channel itself failed (`TransportUnavailable` /
    /// `ShellSpawn`), which callers treat as retryable.
    async fn execute(&mut self, cmd: &str, timeout: Duration) -> ShaperResult<ExecResult>;

    /// Probes whether the underlying channel is still usable.
    async fn is_alive(&mut self) -> bool;

    /// Tears down and re-establishes the channel.
    async fn reconnect(&mut self) -> ShaperResult<()>;

    /// Closes the channel. Safe to call on an already-closed shell.
    async fn close(&mut self);
}
