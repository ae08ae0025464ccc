//! Bounded pool of sandboxes keyed by session id.
//!
//! The registry lock guards bookkeeping only. Provisioning, cleanup and every
//! command run with the lock released; a session being provisioned holds a
//! placeholder slot so concurrent callers can neither exceed capacity nor
//! create a second sandbox for it.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SandboxError;
use crate::runtime::RuntimeAdapter;
use crate::sandbox::{ProvisionOptions, Sandbox, SandboxConfig, SandboxLease, SandboxState};

/// Capacity and eviction policy for a [`SandboxManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on live plus provisioning sandboxes.
    pub max_sandboxes: usize,
    /// Sandboxes idle for longer than this are evicted by the sweeper.
    pub idle_timeout: Duration,
    /// How often the background sweeper runs.
    pub sweep_interval: Duration,
    /// Pause before the single provisioning retry.
    pub provision_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sandboxes: 100,
            idle_timeout: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
            provision_backoff: Duration::from_millis(500),
        }
    }
}

impl PoolConfig {
    /// Rejects a zero capacity or sweep interval.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.max_sandboxes == 0 {
            return Err(SandboxError::configuration_invalid(
                "max_sandboxes must be greater than zero",
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(SandboxError::configuration_invalid(
                "sweep_interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Name of the runtime adapter.
    pub runtime: &'static str,
    pub capacity: usize,
    /// Sandboxes in the registry, including ones still provisioning.
    pub live: usize,
    /// Sandboxes with at least one operation in flight.
    pub busy: usize,
    pub provisioning: usize,
    pub sessions: Vec<SessionInfo>,
}

/// One ready sandbox in [`PoolStats`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub sandbox_id: String,
    pub name: String,
    pub state: SandboxState,
    pub busy: bool,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

enum Slot {
    /// Creation in flight; waiters are woken when it settles.
    Provisioning(Arc<Notify>),
    Ready(Arc<Sandbox>),
}

/// Owns every sandbox and maps session ids to them.
///
/// The manager holds the only long-lived strong reference to each sandbox.
/// Callers get a [`SandboxLease`] per operation, which keeps the sandbox from
/// being evicted while it is in use.
pub struct SandboxManager {
    runtime: Arc<dyn RuntimeAdapter>,
    config: PoolConfig,
    registry: Mutex<HashMap<String, Slot>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("runtime", &self.runtime.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SandboxManager {
    /// Creates an empty pool. The idle sweeper is not started.
    pub fn new(
        runtime: Arc<dyn RuntimeAdapter>,
        config: PoolConfig,
    ) -> Result<Arc<Self>, SandboxError> {
        config.validate()?;
        Ok(Arc::new(Self {
            runtime,
            config,
            registry: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Creates a pool and starts its idle sweeper.
    pub fn start(
        runtime: Arc<dyn RuntimeAdapter>,
        config: PoolConfig,
    ) -> Result<Arc<Self>, SandboxError> {
        let manager = Self::new(runtime, config)?;
        manager.spawn_sweeper();
        Ok(manager)
    }

    /// The runtime every sandbox in this pool runs on.
    pub fn runtime(&self) -> &Arc<dyn RuntimeAdapter> {
        &self.runtime
    }

    /// Pool limits this manager enforces.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns the session's sandbox, creating it if needed.
    ///
    /// At capacity, the idle sandbox with the oldest activity is evicted to
    /// make room. If every sandbox is busy this fails with
    /// [`SandboxError::CapacityExceeded`].
    pub async fn get_or_create(
        self: &Arc<Self>,
        session_id: &str,
        config: &SandboxConfig,
    ) -> Result<SandboxLease, SandboxError> {
        loop {
            let mut registry = self.registry.lock().await;
            if self.shutdown.is_cancelled() {
                return Err(SandboxError::closed(session_id));
            }

            let mut stale = None;
            match registry.get(session_id) {
                Some(Slot::Ready(sandbox)) if sandbox.state() == SandboxState::Running => {
                    return Ok(sandbox.lease());
                }
                Some(Slot::Ready(_)) => {
                    debug!(session_id, "Replacing closed sandbox");
                    stale = registry.remove(session_id);
                }
                Some(Slot::Provisioning(notify)) => {
                    let notify = Arc::clone(notify);
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    drop(registry);
                    notified.await;
                    continue;
                }
                None => {}
            }

            let evicted = if registry.len() >= self.config.max_sandboxes {
                match pick_victim(&registry) {
                    Some(key) => registry.remove(&key).map(|slot| (key, slot)),
                    None => {
                        return Err(SandboxError::CapacityExceeded {
                            capacity: self.config.max_sandboxes,
                        })
                    }
                }
            } else {
                None
            };

            let notify = Arc::new(Notify::new());
            registry.insert(session_id.to_string(), Slot::Provisioning(Arc::clone(&notify)));
            drop(registry);

            // Cleanup and provisioning run detached so a dropped caller cannot
            // strand the slot.
            let manager = Arc::clone(self);
            let session = session_id.to_string();
            let config = config.clone();
            let task = tokio::spawn(async move {
                if let Some(Slot::Ready(sandbox)) = stale {
                    discard(&sandbox).await;
                }
                if let Some((victim, Slot::Ready(sandbox))) = evicted {
                    info!(
                        session_id = %victim,
                        sandbox = %sandbox.name(),
                        "Evicting least recently active sandbox"
                    );
                    discard(&sandbox).await;
                }
                manager.provision(session, config, notify).await
            });
            return match task.await {
                Ok(result) => result,
                Err(e) => Err(SandboxError::provisioning_failed(format!(
                    "provisioning task failed: {e}"
                ))),
            };
        }
    }

    async fn provision(
        &self,
        session_id: String,
        config: SandboxConfig,
        notify: Arc<Notify>,
    ) -> Result<SandboxLease, SandboxError> {
        let options = ProvisionOptions {
            session: Some(session_id.clone()),
            retry_backoff: self.config.provision_backoff,
        };
        let created = Sandbox::create_with(Arc::clone(&self.runtime), config, options).await;

        let mut registry = self.registry.lock().await;
        let result = match created {
            Ok(sandbox) if self.shutdown.is_cancelled() => {
                registry.remove(&session_id);
                drop(registry);
                discard(&sandbox).await;
                Err(SandboxError::closed(sandbox.id()))
            }
            Ok(sandbox) => {
                let sandbox = Arc::new(sandbox);
                let lease = sandbox.lease();
                info!(session_id = %session_id, sandbox = %sandbox.name(), "Sandbox assigned to session");
                registry.insert(session_id, Slot::Ready(sandbox));
                drop(registry);
                Ok(lease)
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to provision sandbox");
                registry.remove(&session_id);
                drop(registry);
                Err(e)
            }
        };
        notify.notify_waiters();
        result
    }

    /// Ends a session: cleans up its sandbox and forgets it.
    ///
    /// Idempotent. The registry entry is removed even if cleanup fails; the
    /// error is returned so the caller knows a container may have leaked.
    pub async fn release(&self, session_id: &str) -> Result<(), SandboxError> {
        loop {
            let mut registry = self.registry.lock().await;
            match registry.get(session_id) {
                Some(Slot::Provisioning(notify)) => {
                    let notify = Arc::clone(notify);
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    drop(registry);
                    notified.await;
                }
                Some(Slot::Ready(_)) => {
                    let Some(Slot::Ready(sandbox)) = registry.remove(session_id) else {
                        return Ok(());
                    };
                    drop(registry);
                    info!(session_id, sandbox = %sandbox.name(), "Releasing session");
                    return sandbox.cleanup().await;
                }
                None => return Ok(()),
            }
        }
    }

    /// Evicts every idle sandbox past the idle timeout. Returns how many.
    pub async fn sweep_idle(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<(String, Arc<Sandbox>)> = {
            let mut registry = self.registry.lock().await;
            let keys: Vec<String> = registry
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(sandbox)
                        if !sandbox.is_busy()
                            && (sandbox.state() != SandboxState::Running
                                || sandbox.idle_for(now) >= self.config.idle_timeout) =>
                    {
                        Some(key.clone())
                    }
                    _ => None,
                })
                .collect();
            keys.into_iter()
                .filter_map(|key| match registry.remove(&key) {
                    Some(Slot::Ready(sandbox)) => Some((key, sandbox)),
                    _ => None,
                })
                .collect()
        };

        for (session_id, sandbox) in &expired {
            info!(session_id = %session_id, sandbox = %sandbox.name(), "Evicting idle sandbox");
            discard(sandbox).await;
        }
        if !expired.is_empty() {
            info!(evicted = expired.len(), "Idle sweep finished");
        }
        expired.len()
    }

    /// Runs [`SandboxManager::sweep_idle`] every `sweep_interval` until
    /// shutdown or until the manager is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.sweep_idle().await;
                    }
                }
            }
            debug!("Idle sweeper stopped");
        })
    }

    /// Stops the sweeper and cleans up every sandbox. Further
    /// `get_or_create` calls fail with [`SandboxError::SandboxClosed`].
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let sandboxes: Vec<Arc<Sandbox>> = {
            let mut registry = self.registry.lock().await;
            let keys: Vec<String> = registry
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter()
                .filter_map(|key| match registry.remove(key) {
                    Some(Slot::Ready(sandbox)) => Some(sandbox),
                    _ => None,
                })
                .collect()
        };
        info!(count = sandboxes.len(), "Shutting down sandbox pool");
        join_all(sandboxes.iter().map(|sandbox| discard(sandbox))).await;
    }

    /// Removes managed containers that no registered sandbox owns.
    pub async fn cleanup_orphaned(&self) -> Result<usize, SandboxError> {
        let containers = self.runtime.list_containers().await?;
        let (owned, provisioning): (HashSet<String>, HashSet<String>) = {
            let registry = self.registry.lock().await;
            let mut owned = HashSet::new();
            let mut provisioning = HashSet::new();
            for (key, slot) in registry.iter() {
                match slot {
                    Slot::Ready(sandbox) => {
                        owned.insert(sandbox.id().to_string());
                    }
                    Slot::Provisioning(_) => {
                        provisioning.insert(key.clone());
                    }
                }
            }
            (owned, provisioning)
        };

        let mut removed = 0;
        for container in containers {
            let in_flight = container
                .session
                .as_ref()
                .is_some_and(|session| provisioning.contains(session));
            if owned.contains(&container.id) || in_flight {
                continue;
            }
            match self.runtime.remove_container(&container.id).await {
                Ok(()) => {
                    info!(container = %container.id, name = %container.name, "Removed orphaned container");
                    removed += 1;
                }
                Err(e) => {
                    warn!(container = %container.id, error = %e, "Failed to remove orphaned container");
                }
            }
        }
        Ok(removed)
    }

    /// Snapshot of capacity and per-session state.
    pub async fn stats(&self) -> PoolStats {
        let registry = self.registry.lock().await;
        let mut sessions: Vec<SessionInfo> = registry
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Ready(sandbox) => Some(SessionInfo {
                    session_id: key.clone(),
                    sandbox_id: sandbox.id().to_string(),
                    name: sandbox.name().to_string(),
                    state: sandbox.state(),
                    busy: sandbox.is_busy(),
                    created_at: sandbox.created_at(),
                    last_active_at: sandbox.last_active_at(),
                }),
                Slot::Provisioning(_) => None,
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));

        PoolStats {
            runtime: self.runtime.name(),
            capacity: self.config.max_sandboxes,
            live: registry.len(),
            busy: sessions.iter().filter(|s| s.busy).count(),
            provisioning: registry.len() - sessions.len(),
            sessions,
        }
    }
}

/// Picks the idle sandbox with the oldest activity. Closed sandboxes go first.
fn pick_victim(registry: &HashMap<String, Slot>) -> Option<String> {
    registry
        .iter()
        .filter_map(|(key, slot)| match slot {
            Slot::Ready(sandbox) if !sandbox.is_busy() => Some((key, sandbox)),
            _ => None,
        })
        .min_by_key(|(_, sandbox)| {
            (
                sandbox.state() == SandboxState::Running,
                sandbox.last_active_at(),
            )
        })
        .map(|(key, _)| key.clone())
}

/// Cleans up an evicted sandbox. Failures are logged, never returned.
async fn discard(sandbox: &Sandbox) {
    if let Err(e) = sandbox.cleanup().await {
        warn!(sandbox = %sandbox.name(), error = %e, "Cleanup of evicted sandbox failed");
    }
}
