/*!
Scripted command executor for tests without the backend CLI

Replies are matched by substring of the command line; the most recently
registered rule wins. Every call is recorded so tests can assert on how many
times the backend was actually hit.
*/

use async_trait::async_trait;
use opsdash_kernel::executor::CommandExecutor;
use opsdash_kernel::{OpsError, OpsResult};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Reply {
    Output(String),
    Fail(String),
    /// Sleeps for the caller's whole timeout, then reports it
    Hang,
}

#[derive(Debug, Clone)]
struct Rule {
    needle: String,
    reply: Reply,
    delay: Duration,
}

#[derive(Clone, Default)]
pub struct MockExecutor {
    rules: Arc<Mutex<Vec<Rule>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> Arc<dyn CommandExecutor> {
        Arc::new(self.clone())
    }

    fn push(&self, needle: &str, reply: Reply, delay: Duration) -> &Self {
        self.rules.lock().unwrap().push(Rule { needle: needle.to_string(), reply, delay });
        self
    }

    /// Replies with `payload`, prefixed by a log line like the real CLI prints
    pub fn on_json(&self, needle: &str, payload: Value) -> &Self {
        self.push(needle, Reply::Output(format!("[plugins] loaded\n{payload}")), Duration::ZERO)
    }

    pub fn on_text(&self, needle: &str, text: &str) -> &Self {
        self.push(needle, Reply::Output(text.to_string()), Duration::ZERO)
    }

    /// Same as `on_json` but only answers after `delay`
    pub fn on_json_after(&self, needle: &str, payload: Value, delay: Duration) -> &Self {
        self.push(needle, Reply::Output(payload.to_string()), delay)
    }

    pub fn fail(&self, needle: &str, message: &str) -> &Self {
        self.push(needle, Reply::Fail(message.to_string()), Duration::ZERO)
    }

    pub fn hang(&self, needle: &str) -> &Self {
        self.push(needle, Reply::Hang, Duration::ZERO)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.contains(needle)).count()
    }
}

#[async_trait]
impl CommandExecutor for MockExecutor {
    async fn run(&self, command: &str, timeout: Duration) -> OpsResult<String> {
        self.calls.lock().unwrap().push(command.to_string());
        let rule = self.rules.lock().unwrap().iter().rev().find(|r| command.contains(&r.needle)).cloned();

        let Some(rule) = rule else {
            return Err(OpsError::UpstreamFailed(format!("no scripted reply for: {command}")));
        };
        if !rule.delay.is_zero() {
            tokio::time::sleep(rule.delay).await;
        }
        match rule.reply {
            Reply::Output(text) => Ok(text),
            Reply::Fail(message) => Err(OpsError::UpstreamFailed(message)),
            Reply::Hang => {
                tokio::time::sleep(timeout).await;
                Err(OpsError::UpstreamTimeout(format!("timed out after {}s", timeout.as_secs())))
            }
        }
    }
}
