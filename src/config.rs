use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::core::errors::{ConveyorError, Result};

/// Environment variable that switches a host binary into worker mode
pub const WORKER_ENV: &str = "CONVEYOR_WORKER";

/// Execution strategy selected when the executor is constructed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackendKind {
    /// In-process thread pool
    Thread,
    /// Fresh worker-process pool per fixed-size batch, batches run one after another
    Batched,
    /// One worker-process pool kept alive for the whole run
    Process,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Thread => "thread",
            BackendKind::Batched => "pool",
            BackendKind::Process => "process",
        }
    }

    pub fn is_process(&self) -> bool {
        !matches!(self, BackendKind::Thread)
    }

    fn default_workers(&self) -> usize {
        let cpus = num_cpus::get();
        match self {
            BackendKind::Thread => cpus + 4,
            BackendKind::Batched | BackendKind::Process => cpus.saturating_sub(1).max(1),
        }
    }
}

impl FromStr for BackendKind {
    type Err = ConveyorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thread" => Ok(BackendKind::Thread),
            "pool" | "batched" => Ok(BackendKind::Batched),
            "process" => Ok(BackendKind::Process),
            other => Err(ConveyorError::configuration_field(
                format!("unsupported executor mode '{}'", other),
                "mode",
                "thread | pool | process",
                other,
            )),
        }
    }
}

impl TryFrom<String> for BackendKind {
    type Error = ConveyorError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BackendKind> for String {
    fn from(kind: BackendKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the coordinator harness drives a registered stage task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HarnessMode {
    /// Run exactly once per pipeline
    Once,
    /// Bind, merge, invoke and publish on every cycle until stopped
    Persistent,
    /// Hand the raw queues to the task function
    Custom,
}

impl HarnessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HarnessMode::Once => "once",
            HarnessMode::Persistent => "persistent",
            HarnessMode::Custom => "custom",
        }
    }

    /// Whether the sequencer wraps back to stage 1 after the last stage
    pub fn cycles(&self) -> bool {
        !matches!(self, HarnessMode::Once)
    }
}

impl FromStr for HarnessMode {
    type Err = ConveyorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(HarnessMode::Once),
            "persistent" | "hybrid" => Ok(HarnessMode::Persistent),
            "custom" | "loop" => Ok(HarnessMode::Custom),
            other => Err(ConveyorError::configuration_field(
                format!("unsupported task mode '{}'", other),
                "task_mode",
                "once | persistent | custom",
                other,
            )),
        }
    }
}

impl TryFrom<String> for HarnessMode {
    type Error = ConveyorError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<HarnessMode> for String {
    fn from(mode: HarnessMode) -> Self {
        mode.as_str().to_string()
    }
}

impl fmt::Display for HarnessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How worker processes are launched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCommandConfig {
    /// Worker executable. `None` re-executes the current binary.
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Executor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Display name of the executor
    pub name: Option<String>,
    pub mode: BackendKind,
    /// Worker count. `None` picks the backend default.
    pub max_workers: Option<usize>,
    /// Tasks per batch in batched mode
    pub batch_size: usize,
    /// Tasks a worker process runs before it is retired (batched mode)
    pub max_tasks_per_child: usize,
    pub worker: WorkerCommandConfig,
    /// Grace period for worker processes to exit before they are killed
    pub shutdown_grace_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: None,
            mode: BackendKind::Thread,
            max_workers: None,
            batch_size: 100,
            max_tasks_per_child: 1,
            worker: WorkerCommandConfig::default(),
            shutdown_grace_ms: 2_000,
        }
    }
}

impl ExecutorConfig {
    pub fn new(mode: BackendKind) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Parse the mode string and build a default configuration for it
    pub fn for_mode(mode: &str) -> Result<Self> {
        Ok(Self::new(mode.parse()?))
    }

    pub fn builder() -> ExecutorConfigBuilder {
        ExecutorConfigBuilder::new()
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConveyorError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&text)
    }

    /// Worker count after applying the backend default
    pub fn effective_max_workers(&self) -> usize {
        self.max_workers
            .unwrap_or_else(|| self.mode.default_workers())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == Some(0) {
            return Err(ConveyorError::configuration_field(
                "max_workers must be greater than 0",
                "max_workers",
                ">= 1",
                "0",
            ));
        }
        if self.batch_size == 0 {
            return Err(ConveyorError::configuration_field(
                "batch_size must be greater than 0",
                "batch_size",
                ">= 1",
                "0",
            ));
        }
        if self.max_tasks_per_child == 0 {
            return Err(ConveyorError::configuration_field(
                "max_tasks_per_child must be greater than 0",
                "max_tasks_per_child",
                ">= 1",
                "0",
            ));
        }
        Ok(())
    }
}

/// Builder for ExecutorConfig
pub struct ExecutorConfigBuilder {
    config: ExecutorConfig,
}

impl ExecutorConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ExecutorConfig::default(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    pub fn mode(mut self, mode: BackendKind) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.config.max_workers = Some(max_workers);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn max_tasks_per_child(mut self, count: usize) -> Self {
        self.config.max_tasks_per_child = count;
        self
    }

    /// Launch workers from an explicit program instead of the current binary
    pub fn worker_program(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.config.worker.program = Some(program.into());
        self.config.worker.args = args;
        self
    }

    pub fn worker_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.worker.env.insert(key.into(), value.into());
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<ExecutorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ExecutorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub executor: ExecutorConfig,
    pub task_mode: HarnessMode,
    /// Capacity of every request and publish queue
    pub queue_capacity: usize,
    /// Completed cycles after which a cycling pipeline ends on its own
    pub max_cycles: Option<usize>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            task_mode: HarnessMode::Once,
            queue_capacity: 64,
            max_cycles: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn new(executor: ExecutorConfig, task_mode: HarnessMode) -> Self {
        Self {
            executor,
            task_mode,
            ..Default::default()
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_max_cycles(mut self, cycles: usize) -> Self {
        self.max_cycles = Some(cycles);
        self
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConveyorError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.executor.validate()?;
        if self.queue_capacity == 0 {
            return Err(ConveyorError::configuration_field(
                "queue_capacity must be greater than 0",
                "queue_capacity",
                ">= 1",
                "0",
            ));
        }
        if self.max_cycles == Some(0) {
            return Err(ConveyorError::configuration_field(
                "max_cycles must be greater than 0 when set",
                "max_cycles",
                ">= 1",
                "0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = ExecutorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mode, BackendKind::Thread);
        assert_eq!(config.effective_max_workers(), num_cpus::get() + 4);
    }

    #[test]
    fn test_mode_strings() {
        assert_eq!("thread".parse::<BackendKind>().unwrap(), BackendKind::Thread);
        assert_eq!("pool".parse::<BackendKind>().unwrap(), BackendKind::Batched);
        assert_eq!("batched".parse::<BackendKind>().unwrap(), BackendKind::Batched);
        assert_eq!("Process".parse::<BackendKind>().unwrap(), BackendKind::Process);
        assert_eq!("hybrid".parse::<HarnessMode>().unwrap(), HarnessMode::Persistent);
        assert_eq!("loop".parse::<HarnessMode>().unwrap(), HarnessMode::Custom);
    }

    #[test]
    fn test_unknown_mode_fails_fast() {
        let err = ExecutorConfig::for_mode("fiber").unwrap_err();
        match err {
            ConveyorError::Configuration { field, actual, .. } => {
                assert_eq!(field.as_deref(), Some("mode"));
                assert_eq!(actual.as_deref(), Some("fiber"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!("forever".parse::<HarnessMode>().is_err());
    }

    #[test]
    fn test_process_default_workers() {
        let config = ExecutorConfig::new(BackendKind::Process);
        assert_eq!(
            config.effective_max_workers(),
            num_cpus::get().saturating_sub(1).max(1)
        );
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ExecutorConfig::default();
        config.max_workers = Some(0);
        assert!(config.validate().is_err());
        config.max_workers = Some(2);

        config.batch_size = 0;
        assert!(config.validate().is_err());
        config.batch_size = 10;

        config.max_tasks_per_child = 0;
        assert!(config.validate().is_err());

        let coordinator = CoordinatorConfig::default().with_queue_capacity(0);
        assert!(coordinator.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = ExecutorConfig::builder()
            .name("nightly")
            .mode(BackendKind::Batched)
            .max_workers(3)
            .batch_size(2)
            .max_tasks_per_child(4)
            .worker_env("RUST_LOG", "debug")
            .build()
            .unwrap();

        assert_eq!(config.name.as_deref(), Some("nightly"));
        assert_eq!(config.mode, BackendKind::Batched);
        assert_eq!(config.effective_max_workers(), 3);
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.max_tasks_per_child, 4);
        assert_eq!(config.worker.env.get("RUST_LOG").map(String::as_str), Some("debug"));
    }

    #[test]
    fn test_yaml_loading() {
        let yaml = r#"
executor:
  mode: pool
  max_workers: 2
  batch_size: 5
task_mode: hybrid
queue_capacity: 8
"#;
        let config = CoordinatorConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.executor.mode, BackendKind::Batched);
        assert_eq!(config.executor.max_workers, Some(2));
        assert_eq!(config.executor.batch_size, 5);
        assert_eq!(config.executor.max_tasks_per_child, 1);
        assert_eq!(config.task_mode, HarnessMode::Persistent);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.max_cycles, None);
    }

    #[test]
    fn test_yaml_rejects_unknown_mode() {
        assert!(ExecutorConfig::from_yaml_str("mode: greenlet\n").is_err());
    }
}
