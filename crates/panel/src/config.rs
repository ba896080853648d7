use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Job types a Windows-class agent is allowed to run.
pub const DEFAULT_WINDOWS_JOB_TYPES: &[&str] = &[
    "agent.update",
    "agent.self_update",
    "sniper.update",
    "instance.create",
    "instance.start",
    "instance.stop",
    "instance.restart",
    "instance.reinstall",
    "instance.delete",
    "instance.backup.create",
    "instance.disk.scan",
    "instance.query.check",
    "server.status.check",
    "node.disk.stat",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub bind: String,
    pub data_dir: PathBuf,
    pub persist: bool,
    /// Shared token gating agent registration.
    pub bootstrap_token: String,
    /// Bearer token for the producer/admin surface.
    pub admin_token: String,
    /// Key material for encrypting agent secrets at rest.
    pub master_key: String,
    pub windows_enabled: bool,
    pub windows_allowed_job_types: Vec<String>,
    pub lease_ttl_secs: i64,
    pub signature_window_secs: i64,
    pub poll_limit: usize,
    pub update_job_limit: usize,
    pub max_log_lines: usize,
    pub stale_sweep_secs: u64,
    pub disk_warn_free_percent: f64,
    pub disk_critical_free_percent: f64,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8088".to_string(),
            data_dir: default_data_dir(),
            persist: true,
            bootstrap_token: String::new(),
            admin_token: String::new(),
            master_key: String::new(),
            windows_enabled: false,
            windows_allowed_job_types: DEFAULT_WINDOWS_JOB_TYPES.iter().map(|s| s.to_string()).collect(),
            lease_ttl_secs: 600,
            signature_window_secs: 300,
            poll_limit: 10,
            update_job_limit: 2,
            max_log_lines: 200,
            stale_sweep_secs: 30,
            disk_warn_free_percent: 15.0,
            disk_critical_free_percent: 5.0,
        }
    }
}

/// Resolve the panel data directory in a platform-appropriate location.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir().unwrap_or(std::env::temp_dir()).join("panel")
}

impl PanelConfig {
    /// Config file first, then `PANEL_*` environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .map_err(|e| anyhow::anyhow!("reading {}: {}", p.display(), e))?;
                toml::from_str::<PanelConfig>(&text)?
            }
            None => PanelConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        fn flag(v: &str) -> bool {
            v == "1" || v.eq_ignore_ascii_case("true")
        }
        if let Some(v) = get("PANEL_BIND") {
            self.bind = v;
        }
        if let Some(v) = get("PANEL_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("PANEL_PERSIST") {
            self.persist = flag(&v);
        }
        if let Some(v) = get("PANEL_BOOTSTRAP_TOKEN") {
            self.bootstrap_token = v;
        }
        if let Some(v) = get("PANEL_ADMIN_TOKEN") {
            self.admin_token = v;
        }
        if let Some(v) = get("PANEL_MASTER_KEY") {
            self.master_key = v;
        }
        if let Some(v) = get("PANEL_WINDOWS_ENABLED") {
            self.windows_enabled = flag(&v);
        }
        if let Some(v) = get("PANEL_LEASE_TTL_SECS").and_then(|v| v.parse().ok()) {
            self.lease_ttl_secs = v;
        }
        if let Some(v) = get("PANEL_POLL_LIMIT").and_then(|v| v.parse().ok()) {
            self.poll_limit = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lease_ttl_secs <= 0 {
            anyhow::bail!("lease_ttl_secs must be positive");
        }
        if self.signature_window_secs <= 0 {
            anyhow::bail!("signature_window_secs must be positive");
        }
        if self.disk_critical_free_percent > self.disk_warn_free_percent {
            anyhow::bail!("disk_critical_free_percent must not exceed disk_warn_free_percent");
        }
        Ok(())
    }

    /// Poll limit requested by an agent, clamped to a sane window.
    pub fn clamp_poll_limit(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.poll_limit).clamp(1, 50)
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("panel-state.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_file_values() {
        let mut config: PanelConfig = toml::from_str("bind = \"0.0.0.0:9000\"\nwindows_enabled = true\n").unwrap();
        assert_eq!(config.lease_ttl_secs, 600);
        let env: HashMap<&str, &str> = [("PANEL_WINDOWS_ENABLED", "0"), ("PANEL_POLL_LIMIT", "25")].into_iter().collect();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert!(!config.windows_enabled);
        assert_eq!(config.poll_limit, 25);
    }

    #[test]
    fn every_env_override_applies() {
        let mut config = PanelConfig::default();
        let env: HashMap<&str, &str> = [
            ("PANEL_BIND", "127.0.0.1:7000"),
            ("PANEL_DATA_DIR", "/var/lib/panel"),
            ("PANEL_PERSIST", "false"),
            ("PANEL_BOOTSTRAP_TOKEN", "boot"),
            ("PANEL_ADMIN_TOKEN", "admin"),
            ("PANEL_MASTER_KEY", "master"),
            ("PANEL_WINDOWS_ENABLED", "TRUE"),
            ("PANEL_LEASE_TTL_SECS", "120"),
            ("PANEL_POLL_LIMIT", "not-a-number"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.bind, "127.0.0.1:7000");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/panel"));
        assert!(!config.persist);
        assert_eq!((config.bootstrap_token.as_str(), config.admin_token.as_str()), ("boot", "admin"));
        assert_eq!(config.master_key, "master");
        assert!(config.windows_enabled);
        assert_eq!(config.lease_ttl_secs, 120);
        // unparsable numbers keep the previous value
        assert_eq!(config.poll_limit, PanelConfig::default().poll_limit);
    }

    #[test]
    fn poll_limit_is_clamped() {
        let config = PanelConfig::default();
        assert_eq!(config.clamp_poll_limit(None), 10);
        assert_eq!(config.clamp_poll_limit(Some(0)), 1);
        assert_eq!(config.clamp_poll_limit(Some(500)), 50);
    }

    #[test]
    fn rejects_inverted_disk_thresholds() {
        let config = PanelConfig { disk_warn_free_percent: 2.0, ..PanelConfig::default() };
        assert!(config.validate().is_err());
    }
}
