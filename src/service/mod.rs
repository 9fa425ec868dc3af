use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::supervisor::error::WardenError;

/// Default restart budget granted to a service when it is (re-)enabled.
pub const DEFAULT_BOOT_ATTEMPTS: u32 = 3;

fn default_health_path() -> String {
    "healthcheck/basic".to_string()
}

fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One managed service: administrative desired state, observed runtime state,
/// and restart policy. The persisted form is exactly the serde fields; the
/// `#[serde(skip)]` fields are runtime-only and absent from the registry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    #[serde(default = "new_uuid")]
    pub uuid: String,
    /// Administrative desired state.
    pub enabled: bool,
    /// Observed: a tracked process exists for this record.
    pub running: bool,
    /// Observed: the last health probe succeeded.
    pub healthy: bool,
    /// Terminal until re-enabled: the restart budget was exhausted.
    pub failed: bool,
    /// Remaining restart attempts before the record is marked failed.
    pub boot_attempts: u32,
    /// Health probes are suppressed for this long after each (re)start.
    pub boot_timeout_millisecs: u64,
    /// Consecutive probe failures tolerated before a restart is triggered.
    pub healthcheck_attempts: u32,
    pub healthcheck_timeout_millisecs: u64,
    /// Assigned port, rewritten by allocation and persisted for reuse.
    pub port: u16,
    pub version: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,

    // ── ephemeral, never persisted ──
    #[serde(skip)]
    pub pid: Option<u32>,
    #[serde(skip)]
    pub consecutive_health_failures: u32,
    #[serde(skip)]
    pub last_restart_time: Option<Instant>,
}

impl ServiceRecord {
    pub fn new(name: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            uuid: new_uuid(),
            enabled: true,
            running: false,
            healthy: false,
            failed: false,
            boot_attempts: DEFAULT_BOOT_ATTEMPTS,
            boot_timeout_millisecs: 10_000,
            healthcheck_attempts: 3,
            healthcheck_timeout_millisecs: 5_000,
            port,
            version: "0.1.0".to_string(),
            health_path: default_health_path(),
            pid: None,
            consecutive_health_failures: 0,
            last_restart_time: None,
        }
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_millisecs)
    }

    pub fn healthcheck_timeout(&self) -> Duration {
        Duration::from_millis(self.healthcheck_timeout_millisecs)
    }

    /// Whether the service is still inside its post-start grace window,
    /// during which health probes must not be counted against it.
    pub fn in_boot_grace(&self) -> bool {
        match self.last_restart_time {
            Some(started) => started.elapsed() < self.boot_timeout(),
            None => false,
        }
    }

    /// URL of the service's liveness endpoint.
    pub fn health_url(&self) -> String {
        format!(
            "http://127.0.0.1:{}/{}",
            self.port,
            self.health_path.trim_start_matches('/')
        )
    }
}

/// Service registry backed by a JSON document. The single source of truth for
/// configuration and last-known runtime state; every mutation of a persisted
/// field is followed by a `save()`.
pub struct ServiceStore {
    file_path: PathBuf,
    records: Vec<ServiceRecord>,
}

impl ServiceStore {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            records: Vec::new(),
        }
    }

    /// Load all records from the registry file, preserving document order.
    /// A malformed document or a record missing required fields is a
    /// configuration error, fatal to startup.
    pub fn load(&mut self) -> Result<(), WardenError> {
        if !self.file_path.exists() {
            tracing::warn!("Registry file {} does not exist, starting empty", self.file_path.display());
            self.records = Vec::new();
            return Ok(());
        }

        let content = fs::read_to_string(&self.file_path).map_err(|e| {
            WardenError::Config(format!("cannot read {}: {}", self.file_path.display(), e))
        })?;
        self.records = serde_json::from_str(&content).map_err(|e| {
            WardenError::Config(format!("malformed registry {}: {}", self.file_path.display(), e))
        })?;
        tracing::info!("Loaded {} services from {}", self.records.len(), self.file_path.display());
        Ok(())
    }

    /// Atomically persist the registry: write to a temp file in the same
    /// directory, then rename over the previous document. A crash mid-write
    /// leaves the previous valid document intact.
    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.records)?;
        let dir = self
            .file_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&self.file_path)?;
        tracing::debug!("Persisted {} services to {}", self.records.len(), self.file_path.display());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ServiceRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ServiceRecord> {
        self.records.iter_mut().find(|r| r.name == name)
    }

    pub fn list(&self) -> &[ServiceRecord] {
        &self.records
    }

    pub fn list_mut(&mut self) -> &mut [ServiceRecord] {
        &mut self.records
    }

    #[allow(dead_code)]
    pub fn insert(&mut self, record: ServiceRecord) {
        self.records.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(records: Vec<ServiceRecord>, dir: &std::path::Path) -> ServiceStore {
        let mut store = ServiceStore::new(dir.join("services.json"));
        store.records = records;
        store
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ServiceStore::new(dir.path().join("nope.json"));
        store.load().unwrap();
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_load_malformed_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.json");
        fs::write(&path, "{ not json").unwrap();

        let mut store = ServiceStore::new(&path);
        let err = store.load().unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
    }

    #[test]
    fn test_load_missing_required_field_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.json");
        // "enabled" is required and absent
        fs::write(&path, r#"[{"name": "tts", "port": 7001}]"#).unwrap();

        let mut store = ServiceStore::new(&path);
        assert!(store.load().is_err());
    }

    #[test]
    fn test_save_load_round_trip_preserves_order_and_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = ServiceRecord::new("svc-b", 7002);
        a.enabled = false;
        a.boot_attempts = 1;
        a.version = "2.3.4".to_string();
        let b = ServiceRecord::new("svc-a", 7001);
        let store = store_with(vec![a.clone(), b.clone()], dir.path());
        store.save().unwrap();

        let mut reloaded = ServiceStore::new(dir.path().join("services.json"));
        reloaded.load().unwrap();

        // order is document order, not sorted
        assert_eq!(reloaded.list()[0].name, "svc-b");
        assert_eq!(reloaded.list()[1].name, "svc-a");

        let r = &reloaded.list()[0];
        assert_eq!(r.uuid, a.uuid);
        assert!(!r.enabled);
        assert_eq!(r.boot_attempts, 1);
        assert_eq!(r.version, "2.3.4");
        assert_eq!(r.port, 7002);
    }

    #[test]
    fn test_ephemeral_fields_absent_from_persisted_form() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = ServiceRecord::new("svc", 7001);
        rec.pid = Some(4242);
        rec.consecutive_health_failures = 2;
        rec.last_restart_time = Some(Instant::now());
        let store = store_with(vec![rec], dir.path());
        store.save().unwrap();

        let raw = fs::read_to_string(dir.path().join("services.json")).unwrap();
        assert!(!raw.contains("pid"));
        assert!(!raw.contains("consecutive_health_failures"));
        assert!(!raw.contains("last_restart_time"));

        let mut reloaded = ServiceStore::new(dir.path().join("services.json"));
        reloaded.load().unwrap();
        assert_eq!(reloaded.list()[0].pid, None);
        assert_eq!(reloaded.list()[0].consecutive_health_failures, 0);
    }

    #[test]
    fn test_save_overwrites_previous_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(vec![ServiceRecord::new("one", 7001)], dir.path());
        store.save().unwrap();
        let store = store_with(vec![ServiceRecord::new("two", 7002)], dir.path());
        store.save().unwrap();

        let mut reloaded = ServiceStore::new(dir.path().join("services.json"));
        reloaded.load().unwrap();
        assert_eq!(reloaded.list().len(), 1);
        assert_eq!(reloaded.list()[0].name, "two");
    }

    #[test]
    fn test_uuid_generated_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.json");
        fs::write(
            &path,
            r#"[{
                "name": "tts", "enabled": true, "running": false,
                "healthy": false, "failed": false, "boot_attempts": 3,
                "boot_timeout_millisecs": 10000, "healthcheck_attempts": 3,
                "healthcheck_timeout_millisecs": 5000, "port": 7001,
                "version": "1.0.0"
            }]"#,
        )
        .unwrap();

        let mut store = ServiceStore::new(&path);
        store.load().unwrap();
        assert!(!store.list()[0].uuid.is_empty());
        assert_eq!(store.list()[0].health_path, "healthcheck/basic");
    }

    #[test]
    fn test_health_url() {
        let mut rec = ServiceRecord::new("svc", 7001);
        assert_eq!(rec.health_url(), "http://127.0.0.1:7001/healthcheck/basic");
        rec.health_path = "/health".to_string();
        assert_eq!(rec.health_url(), "http://127.0.0.1:7001/health");
    }

    #[test]
    fn test_boot_grace_window() {
        let mut rec = ServiceRecord::new("svc", 7001);
        assert!(!rec.in_boot_grace());
        rec.last_restart_time = Some(Instant::now());
        assert!(rec.in_boot_grace());
        rec.boot_timeout_millisecs = 0;
        assert!(!rec.in_boot_grace());
    }
}
