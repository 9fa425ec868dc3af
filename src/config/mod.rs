use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon-level configuration, read from `config/warden.toml`. Every field
/// has a default so a missing or partial file is fine; a handful of env
/// variables override the file for deployment scripting.
///
/// The administrative port range is deliberately a parameter rather than a
/// constant; deployments disagree about where service ports should live.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WardenConfig {
    /// Address the control API binds to.
    pub listen_addr: String,
    /// Path of the persisted service registry (JSON).
    pub registry_path: PathBuf,
    /// Directory holding service executables; defaults to the warden's own.
    pub services_dir: Option<PathBuf>,
    pub port_range_lo: u16,
    pub port_range_hi: u16,
    pub health_interval_secs: u64,
    /// How long a stopping service may take before it is force-killed.
    pub stop_grace_period_millisecs: u64,
    /// Pause between stop and start during a restart.
    pub restart_delay_millisecs: u64,
    /// Pause between consecutive boot-time service starts.
    pub start_stagger_millisecs: u64,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:6080".to_string(),
            registry_path: PathBuf::from("deps/core_microservices.json"),
            services_dir: None,
            port_range_lo: 6000,
            port_range_hi: 7000,
            health_interval_secs: 10,
            stop_grace_period_millisecs: 3_000,
            restart_delay_millisecs: 1_000,
            start_stagger_millisecs: 2_000,
        }
    }
}

impl WardenConfig {
    pub fn load() -> Self {
        let mut cfg: Self = std::fs::read_to_string("config/warden.toml")
            .ok()
            .and_then(|s| match toml::from_str(&s) {
                Ok(cfg) => Some(cfg),
                Err(e) => {
                    tracing::warn!("Ignoring malformed config/warden.toml: {}", e);
                    None
                }
            })
            .unwrap_or_default();

        if let Ok(addr) = std::env::var("WARDEN_LISTEN_ADDR") {
            cfg.listen_addr = addr;
        }
        if let Ok(path) = std::env::var("WARDEN_REGISTRY_PATH") {
            cfg.registry_path = PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("WARDEN_SERVICES_DIR") {
            cfg.services_dir = Some(PathBuf::from(dir));
        }
        cfg
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_millisecs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_millisecs)
    }

    pub fn start_stagger(&self) -> Duration {
        Duration::from_millis(self.start_stagger_millisecs)
    }
}
