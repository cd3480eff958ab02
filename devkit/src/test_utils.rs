/*!
Test harness for the OpsDash kernel

Builds an isolated core with:
- a temp data directory (triage, events and audit files land there)
- a manual clock, so TTLs, rate windows and fix timeouts are crossed without sleeping
- a scripted executor instead of the backend CLI
*/

use crate::executor_stub::MockExecutor;
use opsdash_kernel::clock::{Clock, ManualClock};
use opsdash_kernel::config::DashboardConfig;
use opsdash_kernel::identity::{Identity, Role};
use opsdash_kernel::OpsCore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const START_MS: i64 = 1_760_000_000_000;

pub struct TestHarness {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub executor: MockExecutor,
    pub config: DashboardConfig,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        tracing_subscriber::fmt()
            .with_env_filter("opsdash_kernel=debug")
            .with_test_writer()
            .try_init()
            .ok();

        let dir = tempfile::tempdir().expect("temp dir");
        let mut config = DashboardConfig::default();
        config.data_dir = dir.path().to_path_buf();
        config.roles_file = dir.path().join("roles.json");
        config.backend.bin = "openclaw".into();
        config.fix.agent = "sre".into();

        Self { dir, clock: Arc::new(ManualClock::new(START_MS)), executor: MockExecutor::new(), config }
    }

    pub fn with_config(mut self, edit: impl FnOnce(&mut DashboardConfig)) -> Self {
        edit(&mut self.config);
        self
    }

    /// Fresh core over the harness state. Two cores built from the same
    /// harness share the data directory, which is how reload is tested.
    pub async fn core(&self) -> OpsCore {
        OpsCore::open(self.config.clone(), self.executor.shared(), self.clock.clone()).await
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub fn operator(name: &str) -> Identity {
        Identity::new(name, Role::Operator)
    }

    pub fn viewer(name: &str) -> Identity {
        Identity::new(name, Role::Viewer)
    }

    pub fn admin(name: &str) -> Identity {
        Identity::new(name, Role::Admin)
    }

    /// Polls `check` every 10ms (real time) until it holds or `within` elapses.
    pub async fn wait_until<F, Fut>(within: Duration, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check().await
    }
}
