/// Isolated execution of validated submissions.
///
/// Two strategies, one outcome shape: a dedicated runner process (preferred
/// for untrusted code) and an in-process worker raced against a deadline
/// (fallback when isolation infrastructure is unavailable).
pub mod inprocess;
pub mod interp;
pub mod process;
pub mod rlimits;

use crate::config::policy::ExecutionPolicy;
use crate::config::types::{Result, RunReport, TestCase};
use process::ProcessIsolate;
use std::path::PathBuf;

/// Execution strategy selected by deployment configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationMode {
    /// Spawn the dedicated runner program per submission.
    Process,
    /// Run on a worker thread inside this process. Lower guarantees;
    /// intended for local testing and other low-stakes callers.
    InProcess,
}

/// Mode-dispatching front of the execution subsystem.
#[derive(Clone, Debug)]
pub struct IsolatedRunner {
    mode: IsolationMode,
    isolate: Option<ProcessIsolate>,
}

impl IsolatedRunner {
    pub fn new(mode: IsolationMode, runner_path: Option<PathBuf>) -> Result<Self> {
        let isolate = match mode {
            IsolationMode::Process => Some(ProcessIsolate::new(runner_path)?),
            IsolationMode::InProcess => None,
        };
        Ok(Self { mode, isolate })
    }

    pub fn mode(&self) -> IsolationMode {
        self.mode
    }

    /// Execute one validated submission against its batch. Always returns a
    /// well-formed report; submission faults are carried as data.
    pub fn run(
        &self,
        source: &str,
        cases: &[TestCase],
        target_callable: Option<&str>,
        policy: &ExecutionPolicy,
    ) -> RunReport {
        match (&self.mode, &self.isolate) {
            (IsolationMode::Process, Some(isolate)) => {
                isolate.run(source, cases, target_callable, policy)
            }
            _ => inprocess::run(source, cases, target_callable, policy),
        }
    }
}
