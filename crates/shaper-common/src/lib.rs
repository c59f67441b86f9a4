//! Common infrastructure for the router traffic-shaper engine.
//!
//! This crate provides the pieces shared between the daemon and its
//! test tooling:
//!
//! - [`shell`]: safe command quoting, the [`shell::RemoteShell`] trait,
//!   and the remote execution result type
//! - [`error`]: the engine's error taxonomy
//! - [`config`]: YAML daemon configuration
//!
//! # Architecture
//!
//! The shaper daemon governs a home router's access-control and
//! traffic-shaping state by issuing firewall and traffic-control
//! commands over a remote shell channel:
//!
//! 1. A client opens a session for a router (session registry)
//! 2. The baseline infrastructure is provisioned idempotently
//!    (classification chains + queueing tree)
//! 3. Policy changes are compiled into an ordered command sequence
//!    and pushed through the shared per-router transport
//!
//! Everything the engine does to a router goes through
//! [`shell::RemoteShell::execute`] with a single invokable command
//! string; nothing on the wire is interactive.

pub mod config;
pub mod error;
pub mod shell;

// Re-export commonly used items at crate root
pub use config::{RouterEndpoint, ShaperConfig};
pub use error::{ShaperError, ShaperResult};
pub use shell::{shellquote, ExecResult, RemoteShell};
