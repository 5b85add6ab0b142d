//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                                |
//! |----------|-------------------------------------------------|
//! | `init`   | `Init`                                          |
//! | `serve`  | `Serve`, `Worker`                               |
//! | `runs`   | `Submit`, `Status`, `Cancel`, `Sweep`, `Queue`  |
//! | `config` | `Config`                                        |

pub mod config;
pub mod init;
pub mod runs;
pub mod serve;

pub use config::cmd_config;
pub use init::cmd_init;
pub use runs::{cmd_cancel, cmd_queue, cmd_status, cmd_submit, cmd_sweep};
pub use serve::{cmd_serve, cmd_worker};

use std::sync::Arc;

use anyhow::{Context, Result};
use relay::config::RelayConfig;
use relay::coordinator::Coordinator;
use relay::engine::CommandEngine;
use relay::store::{SUPERVISOR_JOB_TYPE, Store, StoreHandle, WORKER_JOB_TYPE};
use relay::worker::{CommandJob, JobDefinition, JobRegistry, RetryPolicy, SupervisorJob};

/// Identity used for leases and `RunContext::owner`.
pub fn process_owner() -> String {
    format!("relay-{}", std::process::id())
}

/// Open the configured store, creating its directory if needed.
pub fn open_store(config: &RelayConfig) -> Result<StoreHandle> {
    let path = config.db_path();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = Store::open(&path, &config.store_options())?;
    Ok(StoreHandle::new(store))
}

pub fn build_coordinator(config: &RelayConfig, store: StoreHandle) -> Arc<Coordinator> {
    let engine = Arc::new(CommandEngine::new(config.engine_config()));
    Arc::new(Coordinator::new(
        store,
        engine,
        config.coordinator_settings(process_owner()),
    ))
}

/// The job types a relay process runs: supervisor starts and worker
/// commands.
pub fn build_registry(config: &RelayConfig, coordinator: &Arc<Coordinator>) -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry
        .register(JobDefinition::plain(
            SUPERVISOR_JOB_TYPE,
            Arc::new(SupervisorJob::new(coordinator.clone())),
            RetryPolicy::once(),
        ))
        .register(JobDefinition::barrier(
            WORKER_JOB_TYPE,
            Arc::new(CommandJob::new(config.worker_command(), config.job_timeout())),
            config.retry_policy(),
        ));
    registry
}
