/// Execution policy: resource ceilings and allow/deny lists governing what a
/// submission may do. Created once, shared read-only by every execution.
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Modules a submission must never import. Matched on the import root, so
/// `os.path` is covered by `os`.
pub const BLOCKED_MODULES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "shutil",
    "pathlib",
    "pickle",
    "marshal",
    "shelve",
    "socket",
    "asyncio",
    "multiprocessing",
    "threading",
    "ctypes",
    "signal",
];

/// Callable names a submission must never invoke: interpreter entry points,
/// reflection, dynamic attribute mutation, and file/console access.
pub const BLOCKED_CALLABLES: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "globals",
    "locals",
    "getattr",
    "setattr",
    "delattr",
    "__import__",
    "open",
    "input",
    "memoryview",
    "breakpoint",
    "help",
];

/// Attribute names that reach interpreter internals through the object
/// graph (class hierarchy traversal, frame/code introspection).
pub const BLOCKED_ATTRIBUTES: &[&str] = &[
    "__subclasses__",
    "__globals__",
    "__builtins__",
    "__getattribute__",
    "__setattr__",
    "__bases__",
    "__mro__",
    "__code__",
    "__closure__",
];

/// Standard-library modules a submission may import in the fallback mode.
pub const ALLOWED_MODULES: &[&str] = &[
    "math",
    "random",
    "datetime",
    "collections",
    "itertools",
    "functools",
    "heapq",
    "bisect",
    "array",
    "copy",
    "re",
    "json",
    "hashlib",
    "base64",
    "decimal",
    "fractions",
    "statistics",
    "string",
];

/// Immutable per-deployment execution policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    pub allowed_modules: BTreeSet<String>,
    pub blocked_modules: BTreeSet<String>,
    pub blocked_callables: BTreeSet<String>,
    pub blocked_attributes: BTreeSet<String>,
    /// CPU time ceiling for the executing unit.
    pub cpu_time_limit: Duration,
    /// Address-space ceiling in bytes.
    pub memory_limit: u64,
    /// Stack ceiling in bytes.
    pub stack_limit: u64,
    /// Real elapsed-time limit on one submission's total execution,
    /// enforced by the host.
    pub wall_timeout: Duration,
    /// Ceiling on captured submission stdout.
    pub max_output_bytes: usize,
}

impl Default for ExecutionPolicy {
    /// Grading baseline: 5s CPU, 100 MB address space, 8 MB stack, 10s wall,
    /// 64 KB of captured output.
    fn default() -> Self {
        fn owned(names: &[&str]) -> BTreeSet<String> {
            names.iter().map(|s| s.to_string()).collect()
        }

        Self {
            allowed_modules: owned(ALLOWED_MODULES),
            blocked_modules: owned(BLOCKED_MODULES),
            blocked_callables: owned(BLOCKED_CALLABLES),
            blocked_attributes: owned(BLOCKED_ATTRIBUTES),
            cpu_time_limit: Duration::from_secs(5),
            memory_limit: 100 * 1024 * 1024,
            stack_limit: 8 * 1024 * 1024,
            wall_timeout: Duration::from_secs(10),
            max_output_bytes: 64 * 1024,
        }
    }
}

/// Per-request overrides supplied by the caller, bounded by server maxima.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PolicyOverrides {
    #[serde(
        default,
        rename = "timeout",
        skip_serializing_if = "Option::is_none"
    )]
    pub wall_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<u64>,
}

impl ExecutionPolicy {
    /// Derive a per-request policy. Overrides may only tighten or modestly
    /// extend the baseline and are clamped to the server-side maxima so a
    /// caller cannot escalate its own ceilings.
    pub fn with_overrides(
        &self,
        overrides: &PolicyOverrides,
        max_wall_timeout: Duration,
        max_memory_limit: u64,
    ) -> Self {
        let mut policy = self.clone();
        if let Some(wall) = overrides.wall_timeout {
            policy.wall_timeout = wall.min(max_wall_timeout);
        }
        if let Some(memory) = overrides.memory_limit {
            policy.memory_limit = memory.min(max_memory_limit);
        }
        policy
    }

    /// True when `module` or its import root is deny-listed.
    pub fn is_module_blocked(&self, module: &str) -> bool {
        let root = module.split('.').next().unwrap_or(module);
        self.blocked_modules.contains(root)
    }

    /// True when `module` or its import root is allow-listed for the
    /// fallback import hook.
    pub fn is_module_allowed(&self, module: &str) -> bool {
        if self.allowed_modules.contains(module) {
            return true;
        }
        let root = module.split('.').next().unwrap_or(module);
        self.allowed_modules.contains(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_blocks_expected_surfaces() {
        let policy = ExecutionPolicy::default();
        assert!(policy.blocked_modules.contains("os"));
        assert!(policy.blocked_callables.contains("eval"));
        assert!(policy.blocked_attributes.contains("__subclasses__"));
        assert!(policy.allowed_modules.contains("math"));
    }

    #[test]
    fn module_root_matching() {
        let policy = ExecutionPolicy::default();
        assert!(policy.is_module_blocked("os"));
        assert!(policy.is_module_blocked("os.path"));
        assert!(!policy.is_module_blocked("math"));

        assert!(policy.is_module_allowed("collections"));
        assert!(policy.is_module_allowed("collections.abc"));
        assert!(!policy.is_module_allowed("socket"));
    }

    #[test]
    fn overrides_are_clamped_to_server_maxima() {
        let policy = ExecutionPolicy::default();
        let overrides = PolicyOverrides {
            wall_timeout: Some(Duration::from_secs(600)),
            memory_limit: Some(64 * 1024 * 1024 * 1024),
        };
        let derived = policy.with_overrides(
            &overrides,
            Duration::from_secs(30),
            512 * 1024 * 1024,
        );
        assert_eq!(derived.wall_timeout, Duration::from_secs(30));
        assert_eq!(derived.memory_limit, 512 * 1024 * 1024);
        // Deny lists are untouched by overrides.
        assert_eq!(derived.blocked_modules, policy.blocked_modules);
    }

    #[test]
    fn overrides_may_tighten() {
        let policy = ExecutionPolicy::default();
        let overrides = PolicyOverrides {
            wall_timeout: Some(Duration::from_secs(2)),
            memory_limit: None,
        };
        let derived = policy.with_overrides(
            &overrides,
            Duration::from_secs(30),
            512 * 1024 * 1024,
        );
        assert_eq!(derived.wall_timeout, Duration::from_secs(2));
        assert_eq!(derived.memory_limit, policy.memory_limit);
    }
}
