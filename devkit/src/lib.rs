/*!
# OpsDash DevKit - Stubs and fixtures for testing the kernel

- Scripted command executor standing in for the backend CLI
- JSON builders for status and cron list payloads
- Test harness building an isolated core on a temp dir with a manual clock
*/

pub mod executor_stub;
pub mod fixtures;
pub mod test_utils;

pub use executor_stub::MockExecutor;
pub use fixtures::{cron_job, cron_list, failing_cron, StatusBuilder};
pub use test_utils::TestHarness;
