//! Per-router remote-execution channels and the shared transport pool.
//!
//! One router gets at most one live channel no matter how many
//! sessions address it. The pool keys channels by router id, counts
//! the active sessions referencing each one, and closes a channel
//! exactly when its count reaches zero. Commands for one router
//! serialize on that router's channel mutex; different routers run in
//! parallel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use shaper_common::config::{RouterEndpoint, ShaperConfig};
use shaper_common::shell::{self, ExecResult, RemoteShell};
use shaper_common::{ShaperError, ShaperResult};

/// Exit code the ssh client reserves for its own failures
/// (connection, auth, channel) as opposed to the remote command's.
const SSH_FAILURE_EXIT: i32 = 255;

/// A remote shell over the `ssh` client binary with a persistent
/// control channel.
///
/// The control master is opened lazily by the first command
/// (`ControlMaster=auto`) and reused by every following one, so a
/// command is one round trip once the channel is warm. `reconnect`
/// tears the master down; the next command transparently reopens it.
pub struct SshShell {
    endpoint: RouterEndpoint,
    control_path: PathBuf,
}

impl SshShell {
    /// Creates a shell for one router endpoint. No connection is made
    /// until the first command.
    pub fn new(endpoint: RouterEndpoint) -> Self {
        let control_path =
            std::env::temp_dir().join(format!("shaperd-{}-{}.ctl", endpoint.id, std::process::id()));
        Self {
            endpoint,
            control_path,
        }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            "ControlPersist=600".to_string(),
            "-p".to_string(),
            self.endpoint.port.to_string(),
        ];
        if let Some(identity) = &self.endpoint.identity_file {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        args.push(format!("{}@{}", self.endpoint.user, self.endpoint.host));
        args
    }

    async fn control(&self, op: &str) -> bool {
        let status = Command::new(shell::SSH_CMD)
            .arg("-O")
            .arg(op)
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg(format!("{}@{}", self.endpoint.user, self.endpoint.host))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        matches!(status, Ok(s) if s.success())
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn execute(&mut self, cmd: &str, timeout: Duration) -> ShaperResult<ExecResult> {
        debug!(router = %self.endpoint.id, command = %cmd, "Executing remote command");

        let mut invocation = Command::new(shell::SSH_CMD);
        invocation
            .args(self.base_args())
            .arg("--")
            .arg(cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, invocation.output())
            .await
            .map_err(|_| {
                ShaperError::transport_unavailable(
                    &self.endpoint.id,
                    format!("command timed out after {:?}", timeout),
                )
            })?
            .map_err(|e| ShaperError::ShellSpawn {
                command: cmd.to_string(),
                source: e,
            })?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if exit_code == SSH_FAILURE_EXIT {
            return Err(ShaperError::transport_unavailable(&self.endpoint.id, stderr));
        }

        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn is_alive(&mut self) -> bool {
        self.control("check").await
    }

    async fn reconnect(&mut self) -> ShaperResult<()> {
        // Drop the master; ControlMaster=auto reopens it on the next
        // command.
        self.control("exit").await;
        Ok(())
    }

    async fn close(&mut self) {
        self.control("exit").await;
    }
}

/// Constructs the shell for a router endpoint. Swapped for a mock
/// factory in tests.
pub type ShellFactory = Box<dyn Fn(&RouterEndpoint) -> Box<dyn RemoteShell> + Send + Sync>;

struct PoolEntry {
    shell: Arc<Mutex<Box<dyn RemoteShell>>>,
    sessions: usize,
}

/// Registry of per-router transports with session reference counting.
pub struct TransportPool {
    endpoints: HashMap<String, RouterEndpoint>,
    command_timeout: Duration,
    factory: ShellFactory,
    entries: Mutex<HashMap<String, PoolEntry>>,
}

impl TransportPool {
    /// Creates a pool backed by [`SshShell`] channels.
    pub fn new(config: &ShaperConfig) -> Self {
        Self::with_factory(config, Box::new(|ep| Box::new(SshShell::new(ep.clone()))))
    }

    /// Creates a pool with a custom shell factory (used by tests to
    /// inject scripted shells).
    pub fn with_factory(config: &ShaperConfig, factory: ShellFactory) -> Self {
        let endpoints = config
            .routers
            .iter()
            .map(|r| (r.id.clone(), r.clone()))
            .collect();
        Self {
            endpoints,
            command_timeout: config.command_timeout(),
            factory,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Registers one more active session against a router's transport,
    /// creating the (still unconnected) transport entry if absent.
    pub async fn retain(&self, router_id: &str) -> ShaperResult<()> {
        let endpoint = self
            .endpoints
            .get(router_id)
            .ok_or_else(|| ShaperError::router_not_found(router_id))?;

        let mut entries = self.entries.lock().await;
        let entry = entries.entry(router_id.to_string()).or_insert_with(|| {
            debug!(router = %router_id, "Creating transport entry");
            PoolEntry {
                shell: Arc::new(Mutex::new((self.factory)(endpoint))),
                sessions: 0,
            }
        });
        entry.sessions += 1;
        Ok(())
    }

    /// Drops one session reference; the transport closes when the
    /// last reference goes.
    pub async fn release(&self, router_id: &str) {
        let removed = {
            let mut entries = self.entries.lock().await;
            match entries.get_mut(router_id) {
                Some(entry) => {
                    entry.sessions = entry.sessions.saturating_sub(1);
                    if entry.sessions == 0 {
                        entries.remove(router_id)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(entry) = removed {
            info!(router = %router_id, "Last session gone, closing transport");
            entry.shell.lock().await.close().await;
        }
    }

    /// Executes one command on a router's channel, serialized against
    /// every other command for that router. Reopens the channel if it
    /// is found dead first.
    pub async fn run(&self, router_id: &str, cmd: &str) -> ShaperResult<ExecResult> {
        let shell = {
            let endpoint = self
                .endpoints
                .get(router_id)
                .ok_or_else(|| ShaperError::router_not_found(router_id))?;
            let mut entries = self.entries.lock().await;
            let entry = entries.entry(router_id.to_string()).or_insert_with(|| {
                debug!(router = %router_id, "Opening transport on first command");
                PoolEntry {
                    shell: Arc::new(Mutex::new((self.factory)(endpoint))),
                    sessions: 0,
                }
            });
            Arc::clone(&entry.shell)
        };

        let mut shell = shell.lock().await;
        if !shell.is_alive().await {
            warn!(router = %router_id, "Channel dead before command, reconnecting");
            shell.reconnect().await?;
        }
        shell.execute(cmd, self.command_timeout).await
    }

    /// Number of live transport entries (one per addressed router).
    pub async fn transport_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Active session count against one router's transport.
    pub async fn session_count(&self, router_id: &str) -> usize {
        self.entries
            .lock()
            .await
            .get(router_id)
            .map(|e| e.sessions)
            .unwrap_or(0)
    }

    /// Closes every transport. Called once at daemon shutdown.
    pub async fn shutdown(&self) {
        let mut entries = self.entries.lock().await;
        for (router, entry) in entries.drain() {
            debug!(router = %router, "Closing transport at shutdown");
            entry.shell.lock().await.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shaper_testing::{MockShell, SAMPLE_CONFIG_YAML};

    fn pool() -> TransportPool {
        let cfg = ShaperConfig::from_yaml(SAMPLE_CONFIG_YAML).unwrap();
        TransportPool::with_factory(&cfg, Box::new(|_| Box::new(MockShell::ok())))
    }

    #[tokio::test]
    async fn test_retain_release_lifecycle() {
        let pool = pool();
        pool.retain("living-room").await.unwrap();
        pool.retain("living-room").await.unwrap();
        assert_eq!(pool.transport_count().await, 1);
        assert_eq!(pool.session_count("living-room").await, 2);

        pool.release("living-room").await;
        assert_eq!(pool.transport_count().await, 1);
        pool.release("living-room").await;
        assert_eq!(pool.transport_count().await, 0);
    }

    #[tokio::test]
    async fn test_retain_unknown_router() {
        let pool = pool();
        let err = pool.retain("garage").await.unwrap_err();
        assert!(matches!(err, ShaperError::RouterNotFound { .. }));
    }

    #[tokio::test]
    async fn test_one_transport_under_concurrent_retains() {
        let pool = Arc::new(pool());
        let a = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.retain("office").await })
        };
        let b = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.retain("office").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(pool.transport_count().await, 1);
        assert_eq!(pool.session_count("office").await, 2);
    }

    #[tokio::test]
    async fn test_run_opens_lazily() {
        let pool = pool();
        assert_eq!(pool.transport_count().await, 0);
        let result = pool.run("living-room", "true").await.unwrap();
        assert!(result.success());
        assert_eq!(pool.transport_count().await, 1);
    }

    #[tokio::test]
    async fn test_run_unknown_router() {
        let pool = pool();
        let err = pool.run("garage", "true").await.unwrap_err();
        assert!(matches!(err, ShaperError::RouterNotFound { .. }));
    }

    #[tokio::test]
    async fn test_independent_routers_get_independent_transports() {
        let pool = pool();
        pool.run("living-room", "true").await.unwrap();
        pool.run("office", "true").await.unwrap();
        assert_eq!(pool.transport_count().await, 2);
    }

    #[tokio::test]
    async fn test_shutdown_clears_entries() {
        let pool = pool();
        pool.retain("living-room").await.unwrap();
        pool.shutdown().await;
        assert_eq!(pool.transport_count().await, 0);
    }
}
