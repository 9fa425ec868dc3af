pub mod error;
pub mod process;
pub mod state_machine;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::config::WardenConfig;
use crate::port_allocator::PortAllocator;
use crate::service::{ServiceRecord, ServiceStore, DEFAULT_BOOT_ATTEMPTS};
use error::WardenError;
use process::ProcessHandle;
use state_machine::{State, StateMachine};

/// Outcome of a restart request. A restart that finds another lifecycle
/// operation in flight observes it instead of queuing a duplicate.
#[derive(Debug, PartialEq, Eq)]
pub enum RestartOutcome {
    Restarted,
    /// Another start/stop/restart holds the record's operation lock.
    InFlight,
    /// The restart budget was exhausted; the record is now failed.
    MarkedFailed,
    /// The record is disabled or already failed; nothing to do.
    Skipped,
}

/// Sole owner of the service registry and of all child process handles.
/// Every mutation of desired or observed state funnels through here; other
/// components only ever see cloned snapshots.
pub struct Supervisor {
    config: WardenConfig,
    store: Mutex<ServiceStore>,
    processes: Mutex<HashMap<String, ProcessHandle>>,
    states: Mutex<HashMap<String, StateMachine>>,
    // Per-record operation locks: only one start/stop/restart may be in
    // flight for a given record at a time.
    op_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    pub allocator: PortAllocator,
}

impl Supervisor {
    /// Load the registry and build the supervisor. A malformed registry is
    /// fatal here; observed state left over from a previous run (running,
    /// healthy, pid) is reset because none of those processes are ours.
    pub fn new(config: WardenConfig) -> Result<Self, WardenError> {
        let mut store = ServiceStore::new(&config.registry_path);
        store.load()?;

        let mut states = HashMap::new();
        for record in store.list_mut() {
            record.running = false;
            record.healthy = false;
            record.pid = None;
            states.insert(record.name.clone(), StateMachine::new());
        }
        if !store.list().is_empty() {
            store.save().map_err(WardenError::Internal)?;
        }

        let allocator = PortAllocator::new(config.port_range_lo, config.port_range_hi);
        Ok(Self {
            config,
            store: Mutex::new(store),
            processes: Mutex::new(HashMap::new()),
            states: Mutex::new(states),
            op_locks: Mutex::new(HashMap::new()),
            allocator,
        })
    }

    async fn op_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.op_locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn transition(&self, name: &str, to: State) {
        let mut states = self.states.lock().await;
        if let Some(sm) = states.get_mut(name) {
            if let Err(e) = sm.transition(to) {
                tracing::debug!("'{}': {}", name, e);
                sm.force(to);
            }
        }
    }

    /// Current lifecycle state of a record, for status reporting.
    pub async fn state_of(&self, name: &str) -> Option<State> {
        self.states.lock().await.get(name).map(|sm| sm.state)
    }

    // ── snapshots ───────────────────────────────────────────

    /// Read-only snapshot of every record, in registry order.
    pub async fn snapshot(&self) -> Vec<ServiceRecord> {
        self.store.lock().await.list().to_vec()
    }

    pub async fn get_record(&self, name: &str) -> Result<ServiceRecord, WardenError> {
        self.store
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| WardenError::ServiceNotFound(name.to_string()))
    }

    pub async fn ports_in_use(&self) -> Vec<u16> {
        self.allocator.reserved_ports().await
    }

    // ── lifecycle operations ────────────────────────────────

    /// Start a service: allocate a port if needed, spawn its binary with the
    /// port passed by argument and environment, and record the new PID.
    /// Idempotent if the service already has a live process.
    pub async fn start(&self, name: &str) -> Result<ServiceRecord, WardenError> {
        let lock = self.op_lock(name).await;
        let _guard = lock.lock().await;
        self.start_locked(name).await
    }

    /// Start body; the caller must hold the record's operation lock.
    async fn start_locked(&self, name: &str) -> Result<ServiceRecord, WardenError> {
        let record = self.get_record(name).await?;

        {
            let mut processes = self.processes.lock().await;
            if let Some(handle) = processes.get_mut(name) {
                if handle.is_alive() {
                    tracing::debug!("'{}' already running (pid {})", name, handle.pid);
                    return Ok(record);
                }
                processes.remove(name);
            }
        }

        self.transition(name, State::Starting).await;

        let port = self.allocator.allocate(record.port, name).await?;
        let exe = process::service_executable(name, self.config.services_dir.as_deref())?;

        let handle = match ProcessHandle::spawn(name, &exe, port) {
            Ok(handle) => handle,
            Err(e) => {
                self.allocator.release(port).await;
                let mut store = self.store.lock().await;
                if let Some(rec) = store.get_mut(name) {
                    rec.running = false;
                    rec.healthy = false;
                    rec.pid = None;
                }
                tracing::error!("Failed to start '{}': {}", name, e);
                return Err(e);
            }
        };

        let pid = handle.pid;
        self.processes.lock().await.insert(name.to_string(), handle);

        let snapshot = {
            let mut store = self.store.lock().await;
            let rec = store
                .get_mut(name)
                .ok_or_else(|| WardenError::ServiceNotFound(name.to_string()))?;
            rec.running = true;
            rec.healthy = false;
            rec.pid = Some(pid);
            rec.port = port;
            rec.last_restart_time = Some(Instant::now());
            let snapshot = rec.clone();
            store.save().map_err(WardenError::Internal)?;
            snapshot
        };

        self.transition(name, State::Unhealthy).await;
        Ok(snapshot)
    }

    /// Stop a service: graceful signal, bounded grace period, force kill.
    /// Idempotent if already stopped.
    pub async fn stop(&self, name: &str) -> Result<ServiceRecord, WardenError> {
        let lock = self.op_lock(name).await;
        let _guard = lock.lock().await;
        self.stop_locked(name).await
    }

    async fn stop_locked(&self, name: &str) -> Result<ServiceRecord, WardenError> {
        let record = self.get_record(name).await?;

        let handle = self.processes.lock().await.remove(name);
        if let Some(handle) = handle {
            tracing::info!("Stopping '{}' (pid {})", name, handle.pid);
            handle.terminate(self.config.stop_grace_period()).await;
        }
        self.allocator.release(record.port).await;

        let mut store = self.store.lock().await;
        let rec = store
            .get_mut(name)
            .ok_or_else(|| WardenError::ServiceNotFound(name.to_string()))?;
        let was_running = rec.running;
        rec.running = false;
        rec.healthy = false;
        rec.pid = None;
        let snapshot = rec.clone();
        if was_running {
            store.save().map_err(WardenError::Internal)?;
        }
        Ok(snapshot)
    }

    /// Restart a service, consuming one boot attempt. When the budget hits
    /// zero the record is marked failed and left stopped; automatic restarts
    /// are suppressed until `enable` resets the budget.
    pub async fn restart(&self, name: &str) -> Result<RestartOutcome, WardenError> {
        let lock = self.op_lock(name).await;
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("Restart of '{}' already in flight, observing", name);
                return Ok(RestartOutcome::InFlight);
            }
        };

        let record = self.get_record(name).await?;
        if !record.enabled || record.failed {
            return Ok(RestartOutcome::Skipped);
        }

        self.transition(name, State::Restarting).await;

        // One attempt consumed per restart; the counter of consecutive probe
        // failures restarts from zero either way.
        let exhausted = {
            let mut store = self.store.lock().await;
            let rec = store
                .get_mut(name)
                .ok_or_else(|| WardenError::ServiceNotFound(name.to_string()))?;
            if rec.boot_attempts > 0 {
                rec.boot_attempts -= 1;
            }
            rec.consecutive_health_failures = 0;
            let exhausted = rec.boot_attempts == 0;
            if exhausted {
                rec.failed = true;
            }
            store.save().map_err(WardenError::Internal)?;
            exhausted
        };

        if exhausted {
            tracing::warn!("'{}' exhausted its restart budget, marking failed", name);
            self.stop_locked(name).await?;
            self.transition(name, State::Failed).await;
            return Ok(RestartOutcome::MarkedFailed);
        }

        tracing::info!("Restarting '{}'", name);
        self.stop_locked(name).await?;
        tokio::time::sleep(self.config.restart_delay()).await;
        self.start_locked(name).await?;
        Ok(RestartOutcome::Restarted)
    }

    // ── administrative operations ───────────────────────────

    /// Enable a service: reset the failed flag and the restart budget, then
    /// try to start it. A spawn failure leaves the service enabled but
    /// stopped; the monitor retries on its next sweep.
    pub async fn enable(&self, name: &str) -> Result<ServiceRecord, WardenError> {
        {
            let mut store = self.store.lock().await;
            let rec = store
                .get_mut(name)
                .ok_or_else(|| WardenError::ServiceNotFound(name.to_string()))?;
            rec.enabled = true;
            rec.failed = false;
            rec.consecutive_health_failures = 0;
            if rec.boot_attempts == 0 {
                rec.boot_attempts = DEFAULT_BOOT_ATTEMPTS;
            }
            store.save().map_err(WardenError::Internal)?;
        }

        match self.start(name).await {
            Ok(record) => Ok(record),
            Err(WardenError::Spawn { reason, .. }) => {
                tracing::warn!("'{}' enabled but failed to start: {}", name, reason);
                self.get_record(name).await
            }
            Err(e) => Err(e),
        }
    }

    /// Disable a service and terminate its process.
    pub async fn disable(&self, name: &str) -> Result<ServiceRecord, WardenError> {
        {
            let mut store = self.store.lock().await;
            let rec = store
                .get_mut(name)
                .ok_or_else(|| WardenError::ServiceNotFound(name.to_string()))?;
            rec.enabled = false;
            rec.consecutive_health_failures = 0;
            store.save().map_err(WardenError::Internal)?;
        }

        let snapshot = self.stop(name).await?;
        self.transition(name, State::Disabled).await;
        Ok(snapshot)
    }

    /// Record a port assignment made through the control API.
    pub async fn assign_port(&self, name: &str, port: u16) -> Result<(), WardenError> {
        let mut store = self.store.lock().await;
        let rec = store
            .get_mut(name)
            .ok_or_else(|| WardenError::ServiceNotFound(name.to_string()))?;
        rec.port = port;
        store.save().map_err(WardenError::Internal)?;
        Ok(())
    }

    // ── observed-state bookkeeping (health monitor) ─────────

    /// Whether the service's OS process is alive right now. Prefers the
    /// owned child handle; falls back to a PID table probe.
    pub async fn is_alive(&self, name: &str) -> bool {
        {
            let mut processes = self.processes.lock().await;
            if let Some(handle) = processes.get_mut(name) {
                return handle.is_alive();
            }
        }
        match self.get_record(name).await.ok().and_then(|r| r.pid) {
            Some(pid) => crate::process_monitor::is_running_async(pid).await,
            None => false,
        }
    }

    /// A health probe succeeded: mark healthy, clear the failure streak.
    pub async fn record_probe_success(&self, name: &str) {
        let changed = {
            let mut store = self.store.lock().await;
            match store.get_mut(name) {
                Some(rec) => {
                    let changed = !rec.healthy;
                    rec.healthy = true;
                    rec.consecutive_health_failures = 0;
                    changed
                }
                None => false,
            }
        };
        if changed {
            let store = self.store.lock().await;
            if let Err(e) = store.save() {
                tracing::error!("Failed to persist registry: {}", e);
            }
            drop(store);
            self.transition(name, State::Healthy).await;
        }
    }

    /// A health probe failed: mark unhealthy and bump the failure streak.
    /// Returns `(streak, threshold)` so the caller decides on escalation.
    pub async fn record_probe_failure(&self, name: &str) -> (u32, u32) {
        let (streak, threshold, became_unhealthy) = {
            let mut store = self.store.lock().await;
            match store.get_mut(name) {
                Some(rec) => {
                    let became_unhealthy = rec.healthy;
                    rec.healthy = false;
                    rec.consecutive_health_failures += 1;
                    (rec.consecutive_health_failures, rec.healthcheck_attempts, became_unhealthy)
                }
                None => return (0, u32::MAX),
            }
        };
        if became_unhealthy {
            let store = self.store.lock().await;
            if let Err(e) = store.save() {
                tracing::error!("Failed to persist registry: {}", e);
            }
            drop(store);
            self.transition(name, State::Unhealthy).await;
        }
        (streak, threshold)
    }

    // ── startup and shutdown sweeps ─────────────────────────

    /// Start every enabled, non-failed service in registry order with a
    /// stagger delay between spawns. The warden never starts itself.
    pub async fn start_enabled_services(&self) {
        let own_name = own_service_name();
        let records = self.snapshot().await;
        for record in records {
            if !record.enabled || record.failed || record.name == own_name {
                continue;
            }
            match self.start(&record.name).await {
                Ok(rec) => tracing::info!("Started '{}' on port {}", rec.name, rec.port),
                Err(e) => tracing::error!("Failed to start '{}': {}", record.name, e),
            }
            tokio::time::sleep(self.config.start_stagger()).await;
        }
    }

    /// Terminate every running child with the configured grace period.
    /// Called on clean shutdown, after the health monitor has stopped.
    pub async fn shutdown_all(&self) {
        let names: Vec<String> = self.processes.lock().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                tracing::error!("Failed to stop '{}' during shutdown: {}", name, e);
            }
        }
    }
}

/// The warden's own service name, used to exclude it from the registry
/// sweep; its registry entry exists so other tooling can see it.
fn own_service_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "warden".to_string())
}
