/// Process-mode isolation: the preferred strategy for untrusted submissions.
///
/// The host materializes a throwaway workspace (submission source plus a
/// serialized manifest, both read-only), spawns the fixed `gradebox-runner`
/// program against it with resource ceilings applied pre-exec, and waits up
/// to the wall timeout. The runner emits one JSON result blob as its final
/// stdout line; everything else about its death is classified from the exit
/// status. Timeout handling never trusts the isolate: expiry escalates
/// SIGTERM then SIGKILL against the runner's process group.
use crate::config::policy::ExecutionPolicy;
use crate::config::types::{
    BatchReport, ExecutionOutcome, ExecutionStatus, Result, RunReport, SandboxError, TestCase,
};
use crate::utils::output::read_bounded;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Everything the runner needs besides the source file: the effective
/// policy, the target callable, and the batch.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RunnerManifest {
    pub policy: ExecutionPolicy,
    pub target_callable: Option<String>,
    pub cases: Vec<TestCase>,
}

pub const SUBMISSION_FILE: &str = "submission.py";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Slack on top of the stdout ceiling for the result blob itself.
const BLOB_SLACK_BYTES: usize = 1024 * 1024;
const STDERR_CAP_BYTES: usize = 64 * 1024;

/// Grace period between SIGTERM and SIGKILL when tearing down the isolate.
const KILL_GRACE: Duration = Duration::from_millis(200);

/// Process-mode isolate launcher.
#[derive(Clone, Debug)]
pub struct ProcessIsolate {
    runner_path: PathBuf,
}

impl ProcessIsolate {
    pub fn new(runner_path: Option<PathBuf>) -> Result<Self> {
        let runner_path = match runner_path {
            Some(path) => path,
            None => default_runner_path()?,
        };
        Ok(Self { runner_path })
    }

    /// Run one submission to completion, timeout, or death.
    pub fn run(
        &self,
        source: &str,
        cases: &[TestCase],
        target_callable: Option<&str>,
        policy: &ExecutionPolicy,
    ) -> RunReport {
        let instance_id = uuid::Uuid::new_v4().to_string();
        match self.launch(source, cases, target_callable, policy, &instance_id) {
            Ok(report) => report,
            Err(err) => {
                log::error!("isolate {instance_id} could not be started: {err}");
                RunReport {
                    outcome: ExecutionOutcome::fault(
                        ExecutionStatus::InfrastructureError,
                        "execution environment could not be started",
                    ),
                    tests: BatchReport::not_run(cases.len(), "execution environment unavailable"),
                }
            }
        }
    }

    fn launch(
        &self,
        source: &str,
        cases: &[TestCase],
        target_callable: Option<&str>,
        policy: &ExecutionPolicy,
        instance_id: &str,
    ) -> Result<RunReport> {
        let workspace = Workspace::create(source, cases, target_callable, policy, instance_id)?;
        let started = Instant::now();

        let mut child = spawn_runner(&self.runner_path, workspace.path(), policy)?;
        log::debug!(
            "isolate {instance_id} spawned (pid {}, runner {})",
            child.id(),
            self.runner_path.display()
        );

        // Drain both pipes on their own threads so a chatty runner can never
        // fill a pipe and deadlock against the wait loop.
        let stdout_pipe = child.stdout.take().ok_or_else(|| {
            SandboxError::Process("runner stdout pipe missing".to_string())
        })?;
        let stderr_pipe = child.stderr.take().ok_or_else(|| {
            SandboxError::Process("runner stderr pipe missing".to_string())
        })?;
        let stdout_limit = policy.max_output_bytes + BLOB_SLACK_BYTES;
        let stdout_reader =
            std::thread::spawn(move || read_bounded(stdout_pipe, stdout_limit));
        let stderr_reader =
            std::thread::spawn(move || read_bounded(stderr_pipe, STDERR_CAP_BYTES));

        let timed_out = wait_with_deadline(&mut child, policy.wall_timeout);
        let elapsed = started.elapsed().min(policy.wall_timeout);

        let exit_status = child
            .wait()
            .map_err(|e| SandboxError::Process(format!("wait(runner): {e}")))?;
        let (stdout_bytes, _) = stdout_reader.join().unwrap_or_default();
        let (stderr_bytes, _) = stderr_reader.join().unwrap_or_default();
        let stderr_text = String::from_utf8_lossy(&stderr_bytes).into_owned();

        if timed_out {
            log::info!("isolate {instance_id} exceeded wall timeout, terminated");
            let mut outcome = ExecutionOutcome::fault(
                ExecutionStatus::Timeout,
                format!(
                    "execution timed out after {}ms",
                    policy.wall_timeout.as_millis()
                ),
            );
            outcome.stdout = String::from_utf8_lossy(&stdout_bytes).into_owned();
            outcome.execution_time = elapsed;
            return Ok(RunReport {
                outcome,
                tests: BatchReport::not_run(cases.len(), "wall-clock timeout"),
            });
        }

        if let Some(mut report) = parse_result_blob(&stdout_bytes) {
            report.outcome.execution_time = elapsed;
            return Ok(report);
        }

        // No parseable blob: classify from the exit status.
        let (status, error) = classify_silent_exit(&exit_status, &stderr_text);
        log::warn!("isolate {instance_id} died without a result blob: {error}");
        let mut outcome = ExecutionOutcome::fault(status, error);
        outcome.execution_time = elapsed;
        Ok(RunReport {
            outcome,
            tests: BatchReport::not_run(cases.len(), "execution aborted"),
        })
    }
}

/// Throwaway per-execution workspace holding the read-only inputs.
struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    fn create(
        source: &str,
        cases: &[TestCase],
        target_callable: Option<&str>,
        policy: &ExecutionPolicy,
        instance_id: &str,
    ) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("gradebox-{instance_id}-"))
            .tempdir()
            .map_err(|e| SandboxError::Workspace(format!("tempdir: {e}")))?;

        let manifest = RunnerManifest {
            policy: policy.clone(),
            target_callable: target_callable.map(str::to_string),
            cases: cases.to_vec(),
        };
        let manifest_json = serde_json::to_vec(&manifest)
            .map_err(|e| SandboxError::Workspace(format!("serialize manifest: {e}")))?;

        write_read_only(&dir.path().join(SUBMISSION_FILE), source.as_bytes())?;
        write_read_only(&dir.path().join(MANIFEST_FILE), &manifest_json)?;

        // The directory itself is locked down too; restored before cleanup.
        let _ = std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o555));

        Ok(Self { dir })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // Unlink needs a writable directory.
        let _ = std::fs::set_permissions(self.dir.path(), std::fs::Permissions::from_mode(0o755));
    }
}

fn write_read_only(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = std::fs::File::create(path)
        .map_err(|e| SandboxError::Workspace(format!("create {}: {e}", path.display())))?;
    file.write_all(contents)
        .map_err(|e| SandboxError::Workspace(format!("write {}: {e}", path.display())))?;
    drop(file);
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o444))
        .map_err(|e| SandboxError::Workspace(format!("chmod {}: {e}", path.display())))?;
    Ok(())
}

/// Default runner location: a `gradebox-runner` sibling of this executable.
fn default_runner_path() -> Result<PathBuf> {
    let current = std::env::current_exe()
        .map_err(|e| SandboxError::Runner(format!("current_exe: {e}")))?;
    let dir = current
        .parent()
        .ok_or_else(|| SandboxError::Runner("executable has no parent directory".to_string()))?;
    Ok(dir.join("gradebox-runner"))
}

fn spawn_runner(runner_path: &Path, workspace: &Path, policy: &ExecutionPolicy) -> Result<Child> {
    let mut cmd = Command::new(runner_path);
    cmd.arg("--workspace")
        .arg(workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_clear();

    let cpu_secs = policy.cpu_time_limit.as_secs().max(1);
    let memory_limit = policy.memory_limit;
    let stack_limit = policy.stack_limit;

    // Pre-exec runs in the forked child. Only async-signal-safe calls here.
    unsafe {
        cmd.pre_exec(move || {
            // Own session: the host kills the whole group on timeout.
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            // Die with the host rather than outliving it.
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong);

            // Network denial. Unprivileged user+net namespaces when the
            // kernel allows; the runner carries no network code either way,
            // so failure here degrades rather than aborts.
            let _ = libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET);

            set_rlimit(libc::RLIMIT_CPU, cpu_secs, cpu_secs + 1)?;
            set_rlimit(libc::RLIMIT_AS, memory_limit, memory_limit)?;
            set_rlimit(libc::RLIMIT_STACK, stack_limit, stack_limit)?;
            set_rlimit(libc::RLIMIT_CORE, 0, 0)?;
            set_rlimit(libc::RLIMIT_NPROC, 16, 16)?;
            set_rlimit(libc::RLIMIT_NOFILE, 64, 64)?;
            set_rlimit(libc::RLIMIT_FSIZE, 1024 * 1024, 1024 * 1024)?;
            Ok(())
        });
    }

    cmd.spawn()
        .map_err(|e| SandboxError::Process(format!("spawn runner: {e}")))
}

fn set_rlimit(
    resource: libc::__rlimit_resource_t,
    soft: u64,
    hard: u64,
) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Poll until exit or deadline. On expiry the runner's process group gets
/// SIGTERM, a short grace period, then SIGKILL. Returns whether the
/// deadline fired.
fn wait_with_deadline(child: &mut Child, wall_timeout: Duration) -> bool {
    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return false,
            Ok(None) => {}
            Err(err) => log::warn!("try_wait(runner): {err}"),
        }
        if started.elapsed() > wall_timeout {
            terminate_group(child.id() as i32);
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn terminate_group(pid: i32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // Negative pid addresses the whole group created by setsid.
    if kill(Pid::from_raw(-pid), Signal::SIGTERM).is_err() {
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    }
    std::thread::sleep(KILL_GRACE);
    if kill(Pid::from_raw(-pid), Signal::SIGKILL).is_err() {
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

/// The runner's contract: the result blob is the last non-empty stdout line.
fn parse_result_blob(stdout: &[u8]) -> Option<RunReport> {
    let text = String::from_utf8_lossy(stdout);
    let line = text.lines().rev().find(|line| !line.trim().is_empty())?;
    serde_json::from_str(line).ok()
}

fn classify_silent_exit(
    exit_status: &std::process::ExitStatus,
    stderr_text: &str,
) -> (ExecutionStatus, String) {
    match exit_status.signal() {
        Some(libc::SIGKILL) => (
            ExecutionStatus::MemoryExceeded,
            "execution environment was killed (memory limit exceeded)".to_string(),
        ),
        Some(libc::SIGXCPU) => (
            ExecutionStatus::Timeout,
            "CPU time limit exceeded".to_string(),
        ),
        Some(signal) => (
            ExecutionStatus::RuntimeError,
            format!("execution environment terminated by signal {signal}: {stderr_text}"),
        ),
        None => (
            ExecutionStatus::RuntimeError,
            format!(
                "execution environment exited with status {} without a result: {stderr_text}",
                exit_status.code().unwrap_or(-1)
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{CaseInput, Expected};
    use serde_json::json;

    #[test]
    fn manifest_round_trips_with_predicates() {
        let manifest = RunnerManifest {
            policy: ExecutionPolicy::default(),
            target_callable: Some("add".to_string()),
            cases: vec![TestCase {
                input: CaseInput::Positional(vec![json!(2), json!(3)]),
                expected: Expected::Predicate("lambda x: x == 5".to_string()),
                timeout_override: None,
                description: "adds".to_string(),
            }],
        };
        let bytes = serde_json::to_vec(&manifest).unwrap();
        let back: RunnerManifest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.target_callable.as_deref(), Some("add"));
        assert!(matches!(back.cases[0].expected, Expected::Predicate(_)));
    }

    #[test]
    fn workspace_files_are_read_only() {
        let policy = ExecutionPolicy::default();
        let workspace =
            Workspace::create("def f():\n    pass\n", &[], None, &policy, "test").unwrap();
        let meta = std::fs::metadata(workspace.path().join(SUBMISSION_FILE)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o444);
        let meta = std::fs::metadata(workspace.path().join(MANIFEST_FILE)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o444);
    }

    #[test]
    fn workspace_cleans_up_on_drop() {
        let policy = ExecutionPolicy::default();
        let path;
        {
            let workspace =
                Workspace::create("x = 1\n", &[], None, &policy, "cleanup").unwrap();
            path = workspace.path().to_path_buf();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn result_blob_is_last_non_empty_line() {
        let report = RunReport {
            outcome: ExecutionOutcome::success("hi\n".to_string(), Duration::from_millis(5), 0),
            tests: BatchReport::from_details(Vec::new()),
        };
        let blob = serde_json::to_string(&report).unwrap();
        let stdout = format!("stray diagnostic\n{blob}\n");
        let parsed = parse_result_blob(stdout.as_bytes()).expect("blob should parse");
        assert_eq!(parsed.outcome.status, ExecutionStatus::Success);

        assert!(parse_result_blob(b"no json here\n").is_none());
        assert!(parse_result_blob(b"").is_none());
    }

    #[test]
    fn missing_runner_reports_infrastructure_error() {
        let isolate = ProcessIsolate::new(Some(PathBuf::from(
            "/nonexistent/gradebox-runner",
        )))
        .unwrap();
        let report = isolate.run(
            "def f():\n    pass\n",
            &[TestCase {
                input: CaseInput::Positional(vec![]),
                expected: Expected::Value(json!(null)),
                timeout_override: None,
                description: String::new(),
            }],
            Some("f"),
            &ExecutionPolicy::default(),
        );
        assert_eq!(
            report.outcome.status,
            ExecutionStatus::InfrastructureError
        );
        assert_eq!(report.tests.total, 1);
        assert_eq!(report.tests.passed, 0);
    }
}
