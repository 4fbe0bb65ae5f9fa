/// Deployment configuration surface. Read once at startup from the
/// environment; never consulted on the execution hot path.
use crate::config::policy::ExecutionPolicy;
use crate::exec::IsolationMode;
use std::path::PathBuf;
use std::time::Duration;

/// Environment-derived sandbox settings.
#[derive(Clone, Debug)]
pub struct SandboxSettings {
    pub policy: ExecutionPolicy,
    pub isolation_mode: IsolationMode,
    /// Path of the runner program spawned in process mode. Defaults to a
    /// `gradebox-runner` sibling of the current executable.
    pub runner_path: Option<PathBuf>,
    /// Server-side ceilings bounding caller overrides.
    pub max_wall_timeout: Duration,
    pub max_memory_limit: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            policy: ExecutionPolicy::default(),
            isolation_mode: IsolationMode::Process,
            runner_path: None,
            max_wall_timeout: Duration::from_secs(30),
            max_memory_limit: 512 * 1024 * 1024,
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring unparseable {key}={raw:?}");
            None
        }
    }
}

impl SandboxSettings {
    /// Load settings from `GRADEBOX_*` environment variables, falling back
    /// to the grading baseline for anything unset.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Some(secs) = env_u64("GRADEBOX_WALL_TIMEOUT_SECS") {
            settings.policy.wall_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("GRADEBOX_CPU_LIMIT_SECS") {
            settings.policy.cpu_time_limit = Duration::from_secs(secs);
        }
        if let Some(mb) = env_u64("GRADEBOX_MEMORY_LIMIT_MB") {
            settings.policy.memory_limit = mb * 1024 * 1024;
        }
        if let Some(mb) = env_u64("GRADEBOX_STACK_LIMIT_MB") {
            settings.policy.stack_limit = mb * 1024 * 1024;
        }
        if let Some(bytes) = env_u64("GRADEBOX_MAX_OUTPUT_BYTES") {
            settings.policy.max_output_bytes = bytes as usize;
        }
        if let Some(secs) = env_u64("GRADEBOX_MAX_WALL_TIMEOUT_SECS") {
            settings.max_wall_timeout = Duration::from_secs(secs);
        }
        if let Some(mb) = env_u64("GRADEBOX_MAX_MEMORY_LIMIT_MB") {
            settings.max_memory_limit = mb * 1024 * 1024;
        }

        if let Ok(mode) = std::env::var("GRADEBOX_ISOLATION_MODE") {
            match mode.trim() {
                "process" => settings.isolation_mode = IsolationMode::Process,
                "in-process" | "inprocess" => {
                    settings.isolation_mode = IsolationMode::InProcess;
                }
                other => log::warn!("unknown GRADEBOX_ISOLATION_MODE {other:?}, keeping default"),
            }
        }

        if let Ok(path) = std::env::var("GRADEBOX_RUNNER_PATH") {
            settings.runner_path = Some(PathBuf::from(path));
        }

        settings
    }
}
