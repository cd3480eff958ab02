//! Dashboard header: app info plus backend counters (sessions, crons, security).

use serde::Serialize;

use crate::backend::{CronList, StatusSnapshot};
use crate::clock::{human_duration, ms_to_rfc3339};

const ACTIVE_SESSION_MS: i64 = 3_600_000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub app: AppInfo,
    pub backend: BackendSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub name: String,
    pub version: String,
    pub uptime: String,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSummary {
    pub version: String,
    pub host: String,
    pub ip: Option<String>,
    pub default_model: String,
    pub total_sessions: u64,
    pub active_sessions: usize,
    pub total_crons: usize,
    pub enabled_crons: usize,
    pub cron_degraded: bool,
    pub cron_error: Option<String>,
    pub status_degraded: bool,
    pub status_error: Option<String>,
    pub security_warn: u64,
    pub security_critical: u64,
    pub agents: Vec<AgentSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub workspace_dir: Option<String>,
    pub last_active_age_ms: Option<i64>,
}

pub fn build_summary(
    snapshot: &StatusSnapshot,
    crons: &CronList,
    cli_version: Option<String>,
    started_at_ms: i64,
    now_ms: i64,
) -> Summary {
    let status = &snapshot.status;
    let sessions = status.sessions();
    let version = cli_version
        .or_else(|| status.gateway.this.version.clone())
        .or_else(|| status.update.registry.latest_version.clone())
        .unwrap_or_else(|| "unknown".into());

    Summary {
        app: AppInfo {
            name: "OpsDash".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            uptime: human_duration(now_ms - started_at_ms),
            updated_at: ms_to_rfc3339(now_ms),
        },
        backend: BackendSummary {
            version,
            host: status.gateway.this.host.clone().unwrap_or_else(|| "unknown".into()),
            ip: status.gateway.this.ip.clone(),
            default_model: status.sessions.defaults.model.clone().unwrap_or_else(|| "unknown".into()),
            total_sessions: status.sessions.count.unwrap_or(0.0).max(0.0) as u64,
            active_sessions: sessions.iter().filter(|s| s.age_ms < ACTIVE_SESSION_MS).count(),
            total_crons: crons.jobs.len(),
            enabled_crons: crons.jobs.iter().filter(|j| j.enabled).count(),
            cron_degraded: crons.meta.degraded,
            cron_error: crons.meta.error.clone(),
            status_degraded: snapshot.meta.degraded,
            status_error: snapshot.meta.error.clone(),
            security_warn: status.security_warn(),
            security_critical: status.security_critical(),
            agents: status
                .agents
                .agents
                .iter()
                .map(|a| AgentSummary {
                    id: a.id.clone(),
                    name: a.name.clone().unwrap_or_else(|| a.id.clone()),
                    workspace_dir: a.workspace_dir.clone(),
                    last_active_age_ms: a.last_active_age_ms.map(|v| v as i64),
                })
                .collect(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SourceMeta;
    use crate::signals::{parse_cron_jobs, StatusPayload};
    use serde_json::json;

    #[test]
    fn test_summary_counts() {
        let snapshot = StatusSnapshot {
            status: StatusPayload::parse(&json!({
                "gateway": {"self": {"host": "box", "version": "2026.1.1-1"}},
                "sessions": {"count": 4, "recent": [{"key": "agent:a:x", "age": 1000}, {"key": "agent:a:y", "age": 7200000}]},
                "securityAudit": {"summary": {"warn": 3}},
                "agents": {"agents": [{"id": "main"}]}
            })).unwrap(),
            meta: SourceMeta::default(),
        };
        let crons = CronList {
            jobs: parse_cron_jobs(&json!({"jobs": [{"id": "a", "enabled": true}, {"id": "b"}]})).unwrap(),
            meta: SourceMeta { degraded: true, stale: true, error: Some("gateway timeout while fetching cron list".into()) },
        };
        let s = build_summary(&snapshot, &crons, None, 0, 3_600_000);
        assert_eq!(s.app.uptime, "1h 0m");
        assert_eq!(s.backend.version, "2026.1.1-1");
        assert_eq!(s.backend.host, "box");
        assert_eq!(s.backend.total_sessions, 4);
        assert_eq!(s.backend.active_sessions, 1);
        assert_eq!((s.backend.total_crons, s.backend.enabled_crons), (2, 1));
        assert!(s.backend.cron_degraded);
        assert_eq!(s.backend.security_warn, 3);
        assert_eq!(s.backend.agents[0].name, "main");
    }
}
