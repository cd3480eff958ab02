/*!
Payload builders shaped like the backend CLI output

`StatusBuilder` produces `status --json`, `cron_job`/`cron_list` produce
`cron list --json`. Only the fields the kernel reads are filled.
*/

use serde_json::{json, Value};

#[derive(Debug, Clone, Default)]
pub struct StatusBuilder {
    sessions: Vec<Value>,
    findings: Vec<Value>,
    warn: u64,
    critical: u64,
    host: Option<String>,
    version: Option<String>,
    agents: Vec<Value>,
}

impl StatusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session touched `age_ms` ago, `updated_at` is derived from `now_ms`
    pub fn session(mut self, key: &str, age_ms: i64, percent_used: f64, now_ms: i64) -> Self {
        self.sessions.push(json!({
            "key": key,
            "model": "gpt-test",
            "percentUsed": percent_used,
            "age": age_ms,
            "updatedAt": now_ms - age_ms,
        }));
        self
    }

    pub fn aborted_session(mut self, key: &str, age_ms: i64, now_ms: i64) -> Self {
        self.sessions.push(json!({
            "key": key,
            "age": age_ms,
            "updatedAt": now_ms - age_ms,
            "abortedLastRun": true,
            "sessionId": format!("sid-{}", self.sessions.len()),
        }));
        self
    }

    pub fn security(mut self, warn: u64, critical: u64) -> Self {
        self.warn = warn;
        self.critical = critical;
        self
    }

    pub fn finding(mut self, check_id: &str, severity: &str, title: &str) -> Self {
        self.findings.push(json!({
            "checkId": check_id,
            "severity": severity,
            "title": title,
            "detail": format!("{title} detected"),
            "remediation": "tighten the configuration",
        }));
        self
    }

    pub fn host(mut self, host: &str, version: &str) -> Self {
        self.host = Some(host.to_string());
        self.version = Some(version.to_string());
        self
    }

    pub fn agent(mut self, id: &str) -> Self {
        self.agents.push(json!({ "id": id, "name": id }));
        self
    }

    pub fn build(self) -> Value {
        json!({
            "sessions": {
                "count": self.sessions.len(),
                "recent": self.sessions,
                "defaults": { "model": "gpt-test" },
            },
            "securityAudit": {
                "summary": { "warn": self.warn, "critical": self.critical },
                "findings": self.findings,
            },
            "agents": { "agents": self.agents },
            "gateway": { "self": { "host": self.host, "version": self.version } },
        })
    }
}

/// Healthy, enabled cron job
pub fn cron_job(id: &str, name: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "agentId": "main",
        "enabled": true,
        "schedule": { "kind": "cron", "expr": "*/15 * * * *" },
        "state": { "lastStatus": "ok", "consecutiveErrors": 0 },
    })
}

/// Cron job with `errors` consecutive failures and a last status of `error`
pub fn failing_cron(id: &str, name: &str, errors: u32) -> Value {
    let mut job = cron_job(id, name);
    job["state"] = json!({ "lastStatus": "error", "consecutiveErrors": errors });
    job
}

pub fn cron_list(jobs: Vec<Value>) -> Value {
    json!({ "jobs": jobs })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_builder_shape() {
        let status = StatusBuilder::new()
            .session("agent:main:telegram:direct:1", 1_000, 50.0, 10_000)
            .security(2, 0)
            .build();
        assert_eq!(status["sessions"]["recent"][0]["updatedAt"], 9_000);
        assert_eq!(status["securityAudit"]["summary"]["warn"], 2);
    }

    #[test]
    fn test_failing_cron_state() {
        let job = failing_cron("c1", "backup", 7);
        assert_eq!(job["state"]["consecutiveErrors"], 7);
        assert_eq!(cron_list(vec![job])["jobs"].as_array().map(Vec::len), Some(1));
    }
}
