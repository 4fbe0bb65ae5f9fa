/// In-process fallback strategy.
///
/// For low-stakes use without isolation infrastructure: the submission runs
/// in an embedded interpreter on a dedicated worker thread, raced against a
/// channel timeout. Cancellation is a receive deadline, not a signal - if
/// the worker is still going when the deadline fires it is abandoned (it
/// holds no locks the caller needs) and `Timeout` is reported, so the
/// caller never blocks indefinitely on an uncooperative submission.
///
/// Guarantees here are deliberately weaker than process mode: the worker
/// shares the host address space, `RLIMIT_CPU` is not applied (SIGXCPU
/// would take down the host), and an abandoned worker keeps burning its
/// thread until the interpreter next yields.
use crate::config::policy::ExecutionPolicy;
use crate::config::types::{
    BatchReport, ExecutionOutcome, ExecutionStatus, RunReport, TestCase,
};
use crate::exec::rlimits::{LimitScope, ResourceLimiter};
use crate::harness;
use crossbeam_channel::{bounded, RecvTimeoutError};

/// Run a submission on a worker thread with a wall-clock deadline.
pub fn run(
    source: &str,
    cases: &[TestCase],
    target_callable: Option<&str>,
    policy: &ExecutionPolicy,
) -> RunReport {
    let (sender, receiver) = bounded::<RunReport>(1);

    // Rlimits are process-wide, so the scope lives on the caller side of
    // the race: release is then guaranteed even when the worker is
    // abandoned at the deadline. Memory and stack ceilings only.
    let _limits = match ResourceLimiter::apply(policy, LimitScope::MemoryOnly) {
        Ok(guard) => Some(guard),
        Err(err) => {
            log::warn!("resource limits unavailable for in-process execution: {err}");
            None
        }
    };

    let worker_source = source.to_owned();
    let worker_cases = cases.to_vec();
    let worker_target = target_callable.map(str::to_owned);
    let worker_policy = policy.clone();

    let worker = std::thread::Builder::new()
        .name("gradebox-worker".to_string())
        .spawn(move || {
            let report = harness::run_submission(
                &worker_source,
                &worker_cases,
                worker_target.as_deref(),
                &worker_policy,
            );
            // Receiver may have given up already; nothing to do then.
            let _ = sender.send(report);
        });

    let worker = match worker {
        Ok(handle) => handle,
        Err(err) => {
            log::error!("failed to spawn worker thread: {err}");
            return RunReport {
                outcome: ExecutionOutcome::fault(
                    ExecutionStatus::InfrastructureError,
                    "worker thread could not be started",
                ),
                tests: BatchReport::not_run(cases.len(), "execution environment unavailable"),
            };
        }
    };

    match receiver.recv_timeout(policy.wall_timeout) {
        Ok(report) => {
            let _ = worker.join();
            report
        }
        Err(RecvTimeoutError::Timeout) => {
            // Abandon the worker; it is detached by dropping the handle.
            log::info!(
                "in-process execution exceeded wall timeout of {}ms, worker abandoned",
                policy.wall_timeout.as_millis()
            );
            drop(worker);
            let mut outcome = ExecutionOutcome::fault(
                ExecutionStatus::Timeout,
                format!(
                    "execution timed out after {}ms",
                    policy.wall_timeout.as_millis()
                ),
            );
            outcome.execution_time = policy.wall_timeout;
            RunReport {
                outcome,
                tests: BatchReport::not_run(cases.len(), "wall-clock timeout"),
            }
        }
        Err(RecvTimeoutError::Disconnected) => {
            // Worker died without sending - a panic inside the harness.
            let _ = worker.join();
            RunReport {
                outcome: ExecutionOutcome::fault(
                    ExecutionStatus::InfrastructureError,
                    "worker terminated unexpectedly",
                ),
                tests: BatchReport::not_run(cases.len(), "execution aborted"),
            }
        }
    }
}
