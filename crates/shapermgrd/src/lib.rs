//! shapermgrd - router session and traffic-shaping policy engine
//!
//! Governs per-device traffic shaping and access control on remote
//! home routers by driving their firewall and queueing tools over a
//! pooled remote shell. Clients open sessions against a router, the
//! daemon ensures the durable marking/queueing baseline, and policy
//! snapshots are realized as full ordered chain rebuilds.

pub mod api;
pub mod applier;
pub mod commands;
pub mod executor;
pub mod health;
pub mod policy;
pub mod provision;
pub mod session;
pub mod transport;
pub mod types;

pub use api::{ShaperApi, StartOutcome};
pub use applier::{ApplyReport, PolicyApplier};
pub use executor::{IdempotentExecutor, Verdict};
pub use health::{HealthChecker, HealthReport};
pub use policy::{build, PolicyProgram};
pub use provision::{ProvisionReport, Provisioner};
pub use session::SessionRegistry;
pub use transport::{SshShell, TransportPool};
pub use types::{MacAddr, Mode, Policy, Rate};
