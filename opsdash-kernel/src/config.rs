use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DashboardConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub roles_file: PathBuf,
    pub backend: BackendConf,
    pub cache: CacheConf,
    pub limits: LimitsConf,
    pub fix: FixConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BackendConf {
    /// Command prefix of the agent-management CLI, ex: "openclaw" or "node /opt/cli.mjs"
    pub bin: String,
    pub command_timeout_secs: u64,
    /// Short model names accepted by the session model patch
    pub model_aliases: BTreeMap<String, String>,
    /// Providers left out of the usage report (lowercase)
    pub hidden_usage_providers: Vec<String>,
}

/// TTL per key class, in seconds
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConf {
    pub status_ttl_secs: u64,
    pub usage_ttl_secs: u64,
    pub crons_ttl_secs: u64,
    pub version_ttl_secs: u64,
    pub skills_ttl_secs: u64,
    pub summary_ttl_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LimitsConf {
    pub mutations_per_window: u32,
    pub window_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FixConf {
    pub agent: String,
    pub reply_to: Option<String>,
    pub timeout_secs: u64,
    pub command_ceiling_secs: u64,
    pub agent_timeout_secs: u64,
    pub tick_secs: u64,
    pub retention_hours: u64,
    pub max_operations: usize,
    pub list_limit: usize,
    pub result_budget_chars: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3210,
            data_dir: PathBuf::from("./data"),
            roles_file: PathBuf::from("./roles.json"),
            backend: BackendConf::default(),
            cache: CacheConf::default(),
            limits: LimitsConf::default(),
            fix: FixConf::default(),
        }
    }
}

impl Default for BackendConf {
    fn default() -> Self {
        let model_aliases = [
            ("opus", "anthropic/claude-opus-4-6"),
            ("sonnet", "anthropic/claude-sonnet-4-6"),
            ("claude-opus-4-6", "anthropic/claude-opus-4-6"),
            ("claude-sonnet-4-6", "anthropic/claude-sonnet-4-6"),
            ("gpt-5.3-codex", "openai-codex/gpt-5.3-codex"),
            ("gpt-4o", "openai/gpt-4o"),
            ("gpt-4o-mini", "openai/gpt-4o-mini"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            bin: "openclaw".into(),
            command_timeout_secs: 30,
            model_aliases,
            hidden_usage_providers: vec!["google-antigravity".into(), "antigravity".into()],
        }
    }
}

impl Default for CacheConf {
    fn default() -> Self {
        Self {
            status_ttl_secs: 60,
            usage_ttl_secs: 60,
            crons_ttl_secs: 30,
            version_ttl_secs: 120,
            skills_ttl_secs: 300,
            summary_ttl_secs: 30,
        }
    }
}

impl Default for LimitsConf {
    fn default() -> Self {
        Self { mutations_per_window: 40, window_secs: 60 }
    }
}

impl Default for FixConf {
    fn default() -> Self {
        Self {
            agent: "main".into(),
            reply_to: None,
            timeout_secs: 9 * 60,
            command_ceiling_secs: 8 * 60,
            agent_timeout_secs: 420,
            tick_secs: 5,
            retention_hours: 12,
            max_operations: 120,
            list_limit: 30,
            result_budget_chars: 4000,
        }
    }
}

impl FixConf {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn command_ceiling(&self) -> Duration {
        Duration::from_secs(self.command_ceiling_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

impl LimitsConf {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl DashboardConfig {
    pub fn triage_file(&self) -> PathBuf {
        self.data_dir.join("triage-state.json")
    }

    pub fn events_file(&self) -> PathBuf {
        self.data_dir.join("operator-events.jsonl")
    }

    pub fn audit_file(&self) -> PathBuf {
        self.data_dir.join("audit.log.jsonl")
    }

    /// Env overrides win over the file (OPSDASH_BACKEND_BIN, PORT)
    fn apply_env(mut self) -> Self {
        if let Ok(bin) = std::env::var("OPSDASH_BACKEND_BIN") {
            if !bin.trim().is_empty() {
                self.backend.bin = bin;
            }
        }
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        self
    }
}

pub fn parse_config(txt: &str) -> Result<DashboardConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(DashboardConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> DashboardConfig {
    let path = std::env::var("OPSDASH_CONFIG").unwrap_or_else(|_| "opsdash.yaml".into());
    let cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!("[kernel] invalid config {path}: {e}");
            DashboardConfig::default()
        })
    } else {
        warn!("[kernel] no {path}, using default config");
        DashboardConfig::default()
    };
    cfg.apply_env()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = parse_config("  \n").unwrap();
        assert_eq!(cfg.port, 3210);
        assert_eq!(cfg.limits.mutations_per_window, 40);
        assert_eq!(cfg.fix.max_operations, 120);
    }

    #[test]
    fn test_partial_config_keeps_other_defaults() {
        let cfg = parse_config("port: 8080\nfix:\n  agent: sre\n  tick_secs: 2\n").unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.fix.agent, "sre");
        assert_eq!(cfg.fix.tick(), Duration::from_secs(2));
        assert_eq!(cfg.fix.timeout_secs, 540);
        assert_eq!(cfg.cache.skills_ttl_secs, 300);
    }

    #[test]
    fn test_data_files_live_under_data_dir() {
        let cfg = DashboardConfig { data_dir: PathBuf::from("/tmp/x"), ..Default::default() };
        assert_eq!(cfg.triage_file(), PathBuf::from("/tmp/x/triage-state.json"));
        assert_eq!(cfg.events_file(), PathBuf::from("/tmp/x/operator-events.jsonl"));
    }
}
