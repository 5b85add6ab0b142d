//! Relay configuration, read from `.relay/relay.toml`.
//!
//! Every field has a default, so an empty or missing file is a valid
//! configuration. Values are layered file → environment → CLI flags:
//! `RELAY_DB_PATH` and `RELAY_BIND` override the file, and the internal
//! secret is only ever read from the environment variable named by
//! `server.secret_env`.
//!
//! ```toml
//! [store]
//! path = ".relay/relay.db"
//! busy_timeout_ms = 5000
//!
//! [queue]
//! lease_ttl_secs = 300
//! poll_interval_ms = 500
//! concurrency = 4
//!
//! [retry]
//! max_attempts = 5
//! base_delay_secs = 5
//! max_delay_secs = 600
//!
//! [barrier]
//! timeout_secs = 3600
//! sweep_interval_secs = 30
//! failure_policy = "continue"
//! resume_grace_secs = 60
//!
//! [server]
//! bind = "127.0.0.1:8700"
//! secret_env = "RELAY_INTERNAL_SECRET"
//!
//! [engine]
//! command = "relay-engine"
//!
//! [worker]
//! command = "relay-worker"
//! callback_url = "http://127.0.0.1:8700"
//!
//! [logging]
//! json = false
//! directory = ".relay/logs"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::coordinator::{CoordinatorSettings, FailurePolicy};
use crate::engine::CommandEngineConfig;
use crate::process::CommandSpec;
use crate::store::StoreOptions;
use crate::worker::{RetryPolicy, WorkerPoolConfig};

pub const RELAY_DIR: &str = ".relay";
pub const CONFIG_FILE: &str = "relay.toml";

/// Default config location relative to the working directory.
pub fn default_config_path() -> PathBuf {
    Path::new(RELAY_DIR).join(CONFIG_FILE)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    Path::new(RELAY_DIR).join("relay.db")
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Worker slots per process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_lease_ttl_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_concurrency() -> usize {
    4
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            lease_ttl_secs: default_lease_ttl_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_secs() -> u64 {
    5
}

fn default_max_delay_secs() -> u64 {
    600
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarrierSection {
    /// Deadline from suspension; 0 disables deadlines.
    #[serde(default = "default_barrier_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Age at which a barrier stuck in `resuming` is taken over by the sweep.
    #[serde(default = "default_resume_grace_secs")]
    pub resume_grace_secs: u64,
}

fn default_barrier_timeout_secs() -> u64 {
    3600
}

fn default_resume_grace_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for BarrierSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_barrier_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            failure_policy: FailurePolicy::default(),
            resume_grace_secs: default_resume_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Name of the environment variable holding the internal secret.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
}

fn default_bind() -> String {
    "127.0.0.1:8700".to_string()
}

fn default_secret_env() -> String {
    "RELAY_INTERNAL_SECRET".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            secret_env: default_secret_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_engine_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// 0 waits forever.
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
}

fn default_engine_command() -> String {
    "relay-engine".to_string()
}

fn default_turn_timeout_secs() -> u64 {
    600
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            args: Vec::new(),
            turn_timeout_secs: default_turn_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_worker_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// 0 waits forever.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Report completions to this relay server instead of in-process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default = "default_callback_timeout_secs")]
    pub callback_timeout_secs: u64,
}

fn default_worker_command() -> String {
    "relay-worker".to_string()
}

fn default_job_timeout_secs() -> u64 {
    900
}

fn default_callback_timeout_secs() -> u64 {
    30
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: Vec::new(),
            job_timeout_secs: default_job_timeout_secs(),
            callback_url: None,
            callback_timeout_secs: default_callback_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub json: bool,
    /// Daily rolling log files go here when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub barrier: BarrierSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse relay.toml")
    }

    /// Load `path`, or defaults when it doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize relay.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    // ── Environment-aware accessors ───────────────────────────────────

    pub fn db_path(&self) -> PathBuf {
        std::env::var("RELAY_DB_PATH")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.store.path.clone())
    }

    pub fn bind(&self) -> String {
        std::env::var("RELAY_BIND")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| self.server.bind.clone())
    }

    pub fn secret(&self) -> Option<String> {
        std::env::var(&self.server.secret_env)
            .ok()
            .filter(|v| !v.is_empty())
    }

    // ── Component settings ────────────────────────────────────────────

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            busy_timeout: Duration::from_millis(self.store.busy_timeout_ms),
            lease_ttl: chrono::Duration::seconds(self.queue.lease_ttl_secs as i64),
        }
    }

    pub fn coordinator_settings(&self, owner: impl Into<String>) -> CoordinatorSettings {
        CoordinatorSettings {
            owner: owner.into(),
            barrier_timeout: (self.barrier.timeout_secs > 0)
                .then(|| chrono::Duration::seconds(self.barrier.timeout_secs as i64)),
            failure_policy: self.barrier.failure_policy,
            resume_grace: chrono::Duration::seconds(self.barrier.resume_grace_secs.max(1) as i64),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_secs(self.retry.base_delay_secs),
            max_delay: Duration::from_secs(self.retry.max_delay_secs),
        }
    }

    pub fn pool_config(&self, worker_id: impl Into<String>) -> WorkerPoolConfig {
        WorkerPoolConfig {
            worker_id: worker_id.into(),
            concurrency: self.queue.concurrency,
            poll_interval: Duration::from_millis(self.queue.poll_interval_ms),
            lease_ttl: Duration::from_secs(self.queue.lease_ttl_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.barrier.sweep_interval_secs.max(1))
    }

    pub fn engine_config(&self) -> CommandEngineConfig {
        CommandEngineConfig {
            command: CommandSpec::new(&self.engine.command).with_args(&self.engine.args),
            turn_timeout: non_zero_secs(self.engine.turn_timeout_secs),
        }
    }

    pub fn worker_command(&self) -> CommandSpec {
        CommandSpec::new(&self.worker.command).with_args(&self.worker.args)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.worker.job_timeout_secs)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.callback_timeout_secs)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.queue.lease_ttl_secs == 0 {
            warnings.push("queue.lease_ttl_secs is 0: every lease expires immediately".to_string());
        }
        if self.queue.concurrency == 0 {
            warnings.push("queue.concurrency is 0: one worker slot will be used".to_string());
        }
        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0: jobs fail before their first run".to_string());
        }
        if self.retry.base_delay_secs > self.retry.max_delay_secs {
            warnings.push(format!(
                "retry.base_delay_secs ({}) exceeds retry.max_delay_secs ({})",
                self.retry.base_delay_secs, self.retry.max_delay_secs
            ));
        }
        if self.barrier.timeout_secs == 0 {
            warnings.push(
                "barrier.timeout_secs is 0: a lost worker leaves its run waiting forever"
                    .to_string(),
            );
        }
        if self.bind().parse::<SocketAddr>().is_err() {
            warnings.push(format!("Invalid server bind address '{}'", self.bind()));
        }
        if self.secret().is_none() {
            warnings.push(format!(
                "{} is not set: internal endpoints will refuse every request",
                self.server.secret_env
            ));
        }
        if let Some(url) = &self.worker.callback_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            warnings.push(format!("worker.callback_url '{}' is not an http(s) URL", url));
        }

        warnings
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    // Serializes tests that touch process environment.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_empty_file_is_all_defaults() {
        let config = RelayConfig::parse("").unwrap();
        assert_eq!(config.store.path, PathBuf::from(".relay/relay.db"));
        assert_eq!(config.queue.lease_ttl_secs, 300);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.barrier.failure_policy, FailurePolicy::Continue);
        assert_eq!(config.server.bind, "127.0.0.1:8700");
        assert!(config.worker.callback_url.is_none());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = RelayConfig::parse(
            r#"
[barrier]
timeout_secs = 0
failure_policy = "fail_run"

[retry]
max_attempts = 2
"#,
        )
        .unwrap();
        assert_eq!(config.barrier.failure_policy, FailurePolicy::FailRun);
        assert_eq!(config.barrier.sweep_interval_secs, 30);
        assert_eq!(config.barrier.resume_grace_secs, 60);
        assert_eq!(config.retry.base_delay_secs, 5);

        let settings = config.coordinator_settings("test");
        assert!(settings.barrier_timeout.is_none());
        assert_eq!(settings.resume_grace, chrono::Duration::seconds(60));
        assert_eq!(settings.failure_policy, FailurePolicy::FailRun);
        assert_eq!(config.retry_policy().max_attempts, 2);
    }

    #[test]
    fn test_unknown_failure_policy_is_rejected() {
        let err = RelayConfig::parse("[barrier]\nfailure_policy = \"shrug\"").unwrap_err();
        assert!(format!("{:#}", err).contains("relay.toml"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relay.toml");
        let mut config = RelayConfig::default();
        config.engine.args = vec!["--model".into(), "small".into()];
        config.worker.callback_url = Some("http://relay:8700".into());
        config.save(&path).unwrap();

        let loaded = RelayConfig::load(&path).unwrap();
        assert_eq!(loaded.engine.args, config.engine.args);
        assert_eq!(loaded.worker.callback_url, config.worker.callback_url);
        assert!(RelayConfig::load_or_default(&dir.path().join("missing.toml")).is_ok());
    }

    #[test]
    fn test_component_conversions() {
        let config = RelayConfig::parse(
            r#"
[engine]
command = "python3"
args = ["engine.py"]
turn_timeout_secs = 0

[queue]
lease_ttl_secs = 90
"#,
        )
        .unwrap();
        let engine = config.engine_config();
        assert_eq!(engine.command.display(), "python3 engine.py");
        assert!(engine.turn_timeout.is_none());
        assert_eq!(config.store_options().lease_ttl, chrono::Duration::seconds(90));
        assert_eq!(config.pool_config("w").lease_ttl, Duration::from_secs(90));
        assert_eq!(config.job_timeout(), Some(Duration::from_secs(900)));
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let config = RelayConfig::parse("[server]\nsecret_env = \"RELAY_TEST_SECRET_A\"").unwrap();

        unsafe {
            std::env::set_var("RELAY_DB_PATH", "/tmp/override.db");
            std::env::set_var("RELAY_BIND", "0.0.0.0:9000");
            std::env::set_var("RELAY_TEST_SECRET_A", "hunter2");
        }
        assert_eq!(config.db_path(), PathBuf::from("/tmp/override.db"));
        assert_eq!(config.bind(), "0.0.0.0:9000");
        assert_eq!(config.secret().as_deref(), Some("hunter2"));

        unsafe {
            std::env::remove_var("RELAY_DB_PATH");
            std::env::remove_var("RELAY_BIND");
            std::env::remove_var("RELAY_TEST_SECRET_A");
        }
        assert_eq!(config.db_path(), PathBuf::from(".relay/relay.db"));
        assert!(config.secret().is_none());
    }

    #[test]
    fn test_validate_warnings() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let config = RelayConfig::parse(
            r#"
[queue]
lease_ttl_secs = 0

[retry]
max_attempts = 0

[server]
bind = "not-an-address"
secret_env = "RELAY_TEST_SECRET_UNSET"
"#,
        )
        .unwrap();
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("lease_ttl_secs")));
        assert!(warnings.iter().any(|w| w.contains("max_attempts")));
        assert!(warnings.iter().any(|w| w.contains("bind address")));
        assert!(warnings.iter().any(|w| w.contains("RELAY_TEST_SECRET_UNSET")));
    }
}
