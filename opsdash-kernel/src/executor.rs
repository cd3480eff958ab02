//! Command execution seam towards the agent-management CLI
//!
//! The core never talks to the backend directly: every read goes through a
//! [`CommandExecutor`] that runs one shell command under a timeout and hands
//! back raw stdout. The output is treated as an opaque, possibly malformed,
//! JSON-shaped payload; [`extract_json`] is the only parser.

use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use crate::error::{OpsError, OpsResult};

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs `command` and returns stdout. Fails with `UpstreamTimeout` when the
    /// bound is exceeded and `UpstreamFailed` on spawn errors or non-zero exit.
    async fn run(&self, command: &str, timeout: Duration) -> OpsResult<String>;
}

pub type SharedExecutor = Arc<dyn CommandExecutor>;

/// Executes through `bash -c`, like the agent host does for remote shell commands.
#[derive(Debug, Default, Clone)]
pub struct ShellExecutor;

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn run(&self, command: &str, timeout: Duration) -> OpsResult<String> {
        let start_time = Instant::now();
        debug!("[exec] running: {} (timeout: {:?})", command, timeout);

        let output = tokio::time::timeout(
            timeout,
            AsyncCommand::new("bash")
                .arg("-c")
                .arg(command)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| OpsError::UpstreamTimeout(format!("command exceeded {}s", timeout.as_secs())))?
        .map_err(|e| OpsError::UpstreamFailed(format!("failed to spawn command: {e}")))?;

        debug!("[exec] finished in {}ms", start_time.elapsed().as_millis());

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = [stderr.trim(), stdout.trim()]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("exit status {}", output.status.code().unwrap_or(-1)));
        Err(OpsError::UpstreamFailed(message))
    }
}

/// Parses the first JSON object found in CLI output. Log lines before the
/// object and anything after it are ignored.
pub fn extract_json(text: &str) -> OpsResult<Value> {
    let start = text
        .find('{')
        .ok_or_else(|| OpsError::UpstreamMalformed("No JSON object in command output".into()))?;
    let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(OpsError::UpstreamMalformed(format!("invalid JSON: {e}"))),
        None => Err(OpsError::UpstreamMalformed("No JSON object in command output".into())),
    }
}

/// Single-quotes an argument for the shell command line.
pub fn sh_quote(text: &str) -> String {
    shell_words::quote(text).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_skips_log_prefix() {
        let out = "[plugins] loading...\nwarn: slow gateway\n{\"ok\":true,\"n\":2}\n";
        let v = extract_json(out).unwrap();
        assert_eq!(v["n"], 2);
    }

    #[test]
    fn test_extract_json_ignores_trailing_noise() {
        let v = extract_json("{\"a\":1}\nDone.").unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn test_extract_json_malformed() {
        assert!(matches!(extract_json("no json here"), Err(OpsError::UpstreamMalformed(_))));
        assert!(matches!(extract_json("{\"a\": "), Err(OpsError::UpstreamMalformed(_))));
    }

    #[test]
    fn test_sh_quote_protects_spaces_and_quotes() {
        let q = sh_quote("it's a fix");
        assert!(q.starts_with('\'') || q.starts_with('"'));
        assert_eq!(shell_words::split(&q).unwrap(), vec!["it's a fix".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_command_execution() {
        let out = ShellExecutor.run("echo 'Hello World'", Duration::from_secs(5)).await.unwrap();
        assert!(out.contains("Hello World"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_timeout() {
        let res = ShellExecutor.run("sleep 10", Duration::from_millis(200)).await;
        assert!(matches!(res, Err(OpsError::UpstreamTimeout(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_reports_stderr() {
        let res = ShellExecutor.run("echo boom >&2; exit 3", Duration::from_secs(5)).await;
        assert_eq!(res, Err(OpsError::UpstreamFailed("boom".into())));
    }
}
