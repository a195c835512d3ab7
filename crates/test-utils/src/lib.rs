pub mod builders;
pub mod fake_executor;
pub mod scripted_runner;

pub use builders::{ConfigBuilder, TaskBuilder, plan, run_context};
pub use fake_executor::{ExecEvent, RecordingExecutor};
pub use scripted_runner::{
    ScriptedRunner, failure, flag_value, success, worker_report, write_worker_report,
};

use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Install a test-writer subscriber once per test binary.
///
/// Scheduler and backend logs show up for failing tests only; raise the
/// level with `RUST_LOG=taskfleet=debug`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Await `f`, failing the test if a run hangs for more than 10 seconds.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(10), f)
        .await
        .expect("run did not finish within 10 seconds")
}
