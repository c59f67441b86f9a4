//! Integration test infrastructure for the shaper engine
//!
//! Provides:
//! - A scripted [`MockShell`] implementing `RemoteShell` with command
//!   capture
//! - A stateful [`RouterSim`] that answers create/delete commands the
//!   way a real router does (duplicate creates error, deletes of
//!   absent objects error)
//! - Test fixtures for common policies, MACs, and configuration

pub mod fixtures;
mod mock;

pub use fixtures::*;
pub use mock::{CommandLog, MockShell, RouterSim, ScriptedRule};
