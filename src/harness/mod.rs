/// Test harness: loads a submission once into a restricted interpreter and
/// drives it through the test batch, strictly in order.
///
/// Per-case failures are demoted to failed results and never abort the
/// batch; only process-fatal faults (memory, and the host-enforced wall
/// timeout) stop early, with the remainder reported as not run. Both the
/// runner program and the in-process fallback funnel through
/// [`run_submission`], so the two strategies produce one outcome shape.
pub mod checker;

use crate::config::policy::ExecutionPolicy;
use crate::config::types::{
    BatchReport, ExecutionOutcome, ExecutionStatus, Expected, RunReport, TestCase, TestResult,
};
use crate::exec::interp::{
    build_case_args, build_interpreter, exception_details, install_import_hook,
    install_output_capture, py_to_json, seed_restricted_namespace,
};
use crate::utils::output::OutputBuffer;
use rustpython_vm::{
    compiler::Mode, scope::Scope, AsObject, PyObjectRef, PyResult, VirtualMachine,
};
use std::sync::Arc;
use std::time::Instant;

/// Cap on captured stderr; diagnostics only, independent of the policy
/// stdout ceiling.
const STDERR_CAP: usize = 16 * 1024;

/// Execute one submission against its batch. Returns a well-formed report
/// on every path; faults are data, not errors.
pub fn run_submission(
    source: &str,
    cases: &[TestCase],
    target_callable: Option<&str>,
    policy: &ExecutionPolicy,
) -> RunReport {
    let policy = Arc::new(policy.clone());
    let stdout = OutputBuffer::new(policy.max_output_bytes);
    let stderr = OutputBuffer::new(STDERR_CAP);
    let started = Instant::now();

    let interp = build_interpreter();
    let (status, error, details) = interp.enter(|vm| {
        install_import_hook(vm, &policy);
        install_output_capture(vm, stdout.clone(), stderr.clone());

        let scope = vm.new_scope_with_builtins();
        seed_restricted_namespace(vm, &scope, &policy);

        // Load the submission once; definitions persist across the batch.
        if let Err(load_error) = load_submission(vm, &scope, source) {
            let (status, message) = match load_error {
                LoadError::Compile(message) => (ExecutionStatus::RuntimeError, message),
                LoadError::Memory(message) => (ExecutionStatus::MemoryExceeded, message),
                LoadError::Raise(message) => (ExecutionStatus::RuntimeError, message),
            };
            let details = not_run_details(0, cases, "submission failed to load");
            return (status, message, details);
        }

        let target = target_callable.and_then(|name| resolve_callable(vm, &scope, name));

        let mut details = Vec::with_capacity(cases.len());
        let mut fatal: Option<(ExecutionStatus, String)> = None;

        for (index, case) in cases.iter().enumerate() {
            if fatal.is_some() {
                break;
            }

            let result = match (&target, target_callable) {
                (Some(func), _) => {
                    run_case(vm, func, case, index, &policy, &mut fatal)
                }
                (None, Some(name)) => {
                    TestResult::failed(index, format!("callable '{name}' not found"))
                }
                (None, None) => {
                    TestResult::failed(index, "no target callable specified")
                }
            };
            details.push(result);
        }

        match fatal {
            Some((status, message)) => {
                let remaining = not_run_details(details.len(), cases, &message);
                details.extend(remaining);
                (status, message, details)
            }
            None => (ExecutionStatus::Success, String::new(), details),
        }
    });

    let outcome = ExecutionOutcome {
        status,
        stdout: stdout.into_string(),
        error,
        execution_time: started.elapsed(),
        memory_used: peak_rss_bytes(),
    };

    RunReport {
        outcome,
        tests: BatchReport::from_details(details),
    }
}

enum LoadError {
    Compile(String),
    Memory(String),
    Raise(String),
}

fn load_submission(vm: &VirtualMachine, scope: &Scope, source: &str) -> Result<(), LoadError> {
    let code = vm
        .compile(source, Mode::Exec, "<submission>".to_owned())
        .map_err(|err| LoadError::Compile(format!("syntax error: {err}")))?;

    vm.run_code_obj(code, scope.clone()).map_err(|exc| {
        let details = exception_details(vm, &exc);
        if details.is_memory_error() {
            LoadError::Memory(format!("memory limit exceeded during load: {}", details.message))
        } else {
            LoadError::Raise(format!(
                "submission raised during load: {}\n{}",
                details.summary(),
                details.traceback
            ))
        }
    })?;
    Ok(())
}

/// Look up a name in the submission namespace. Missing or non-callable
/// resolution is reported per case, not thrown out of the batch.
fn resolve_callable(vm: &VirtualMachine, scope: &Scope, name: &str) -> Option<PyObjectRef> {
    let globals: PyObjectRef = scope.globals.as_object().to_owned();
    let found = vm
        .call_method(&globals, "get", (vm.ctx.new_str(name),))
        .ok()?;
    if vm.is_none(&found) {
        None
    } else {
        Some(found)
    }
}

fn run_case(
    vm: &VirtualMachine,
    func: &PyObjectRef,
    case: &TestCase,
    index: usize,
    policy: &ExecutionPolicy,
    fatal: &mut Option<(ExecutionStatus, String)>,
) -> TestResult {
    let case_started = Instant::now();

    let invocation = build_case_args(vm, &case.input).and_then(|args| func.call(args, vm));
    let elapsed = case_started.elapsed();

    match invocation {
        Ok(result) => {
            let actual = py_to_json(vm, &result);
            let budget = case.timeout_override.unwrap_or(policy.wall_timeout);
            if elapsed > budget {
                return TestResult {
                    case_index: index,
                    passed: false,
                    actual: Some(actual),
                    error: Some(format!(
                        "exceeded per-case time limit of {}ms",
                        budget.as_millis()
                    )),
                    execution_time: elapsed,
                };
            }

            let (passed, error) = match &case.expected {
                Expected::Value(expected) => {
                    if checker::values_match(&actual, expected) {
                        (true, None)
                    } else {
                        (false, Some(format!("expected {expected}, got {actual}")))
                    }
                }
                Expected::Predicate(expr) => match apply_predicate(vm, expr, &result) {
                    Ok(true) => (true, None),
                    Ok(false) => (false, Some("predicate returned false".to_string())),
                    Err(message) => (false, Some(message)),
                },
            };

            TestResult {
                case_index: index,
                passed,
                actual: Some(actual),
                error,
                execution_time: elapsed,
            }
        }
        Err(exc) => {
            let details = exception_details(vm, &exc);
            if details.is_memory_error() {
                *fatal = Some((
                    ExecutionStatus::MemoryExceeded,
                    "memory limit exceeded".to_string(),
                ));
            }
            let label = if case.description.is_empty() {
                String::new()
            } else {
                format!(" [{}]", case.description)
            };
            TestResult {
                case_index: index,
                passed: false,
                actual: None,
                error: Some(format!("{}{label}", details.summary())),
                execution_time: elapsed,
            }
        }
    }
}

/// Compile a predicate expression, evaluate it to a callable, and apply it
/// to the actual result. Any failure is reported as a checker error.
fn apply_predicate(
    vm: &VirtualMachine,
    expr: &str,
    actual: &PyObjectRef,
) -> Result<bool, String> {
    let compiled = vm
        .compile(expr, Mode::Eval, "<checker>".to_owned())
        .map_err(|err| format!("checker error: {err}"))?;

    let scope = vm.new_scope_with_builtins();
    let predicate = vm
        .run_code_obj(compiled, scope)
        .map_err(|exc| format!("checker error: {}", exception_details(vm, &exc).summary()))?;

    let verdict: PyResult<PyObjectRef> = predicate.call((actual.clone(),), vm);
    let verdict =
        verdict.map_err(|exc| format!("checker error: {}", exception_details(vm, &exc).summary()))?;

    verdict
        .try_to_bool(vm)
        .map_err(|exc| format!("checker error: {}", exception_details(vm, &exc).summary()))
}

fn not_run_details(start: usize, cases: &[TestCase], reason: &str) -> Vec<TestResult> {
    (start..cases.len())
        .map(|i| TestResult::failed(i, format!("not run: {reason}")))
        .collect()
}

/// Peak resident set of this process, from the kernel's accounting.
fn peak_rss_bytes() -> u64 {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return 0;
    }
    // ru_maxrss is reported in kilobytes on Linux.
    (usage.ru_maxrss as u64) * 1024
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn case(input: serde_json::Value, expected: Expected) -> TestCase {
        TestCase {
            input: serde_json::from_value(input).unwrap(),
            expected,
            timeout_override: None,
            description: String::new(),
        }
    }

    fn run(source: &str, cases: Vec<TestCase>, target: Option<&str>) -> RunReport {
        run_submission(source, &cases, target, &ExecutionPolicy::default())
    }

    #[test]
    fn add_function_passes_keyword_case() {
        let report = run(
            "def add(a, b):\n    return a + b\n",
            vec![case(json!({"a": 2, "b": 3}), Expected::Value(json!(5)))],
            Some("add"),
        );
        assert_eq!(report.outcome.status, ExecutionStatus::Success);
        assert_eq!(report.tests.passed, 1);
        assert_eq!(report.tests.details[0].actual, Some(json!(5)));
    }

    #[test]
    fn positional_and_single_inputs_are_supported() {
        let report = run(
            "def add(a, b):\n    return a + b\ndef double(x):\n    return 2 * x\n",
            vec![
                case(json!([2, 3]), Expected::Value(json!(5))),
                case(json!([10, -4]), Expected::Value(json!(6))),
            ],
            Some("add"),
        );
        assert_eq!(report.tests.passed, 2);

        let report = run(
            "def double(x):\n    return 2 * x\n",
            vec![case(json!(21), Expected::Value(json!(42)))],
            Some("double"),
        );
        assert_eq!(report.tests.passed, 1);
    }

    #[test]
    fn results_preserve_case_order_and_length() {
        let cases: Vec<TestCase> = (0..4)
            .map(|i| case(json!([i, i]), Expected::Value(json!(i * 2))))
            .collect();
        let report = run("def add(a, b):\n    return a + b\n", cases, Some("add"));
        assert_eq!(report.tests.total, 4);
        assert_eq!(report.tests.details.len(), 4);
        for (i, detail) in report.tests.details.iter().enumerate() {
            assert_eq!(detail.case_index, i);
        }
    }

    #[test]
    fn missing_callable_fails_cases_without_aborting() {
        let report = run(
            "def add(a, b):\n    return a + b\n",
            vec![
                case(json!([1, 2]), Expected::Value(json!(3))),
                case(json!([3, 4]), Expected::Value(json!(7))),
            ],
            Some("subtract"),
        );
        // The batch itself completes; every case records the lookup failure.
        assert_eq!(report.outcome.status, ExecutionStatus::Success);
        assert_eq!(report.tests.total, 2);
        assert_eq!(report.tests.passed, 0);
        for detail in &report.tests.details {
            assert!(detail
                .error
                .as_deref()
                .unwrap()
                .contains("callable 'subtract' not found"));
        }
    }

    #[test]
    fn per_case_exception_does_not_abort_batch() {
        let source = "def f(x):\n    if x == 0:\n        raise ValueError('zero')\n    return x\n";
        let report = run(
            source,
            vec![
                case(json!([0]), Expected::Value(json!(0))),
                case(json!([7]), Expected::Value(json!(7))),
            ],
            Some("f"),
        );
        assert_eq!(report.outcome.status, ExecutionStatus::Success);
        assert_eq!(report.tests.passed, 1);
        assert_eq!(report.tests.failed, 1);
        assert!(report.tests.details[0]
            .error
            .as_deref()
            .unwrap()
            .contains("ValueError"));
        assert!(report.tests.details[1].passed);
    }

    #[test]
    fn float_tolerance_applies_to_results() {
        let report = run(
            "def f():\n    return 0.1 + 0.2\n",
            vec![case(json!([]), Expected::Value(json!(0.3)))],
            Some("f"),
        );
        assert_eq!(report.tests.passed, 1);
    }

    #[test]
    fn predicate_checker_distinguishes_sign() {
        let source = "def f(x):\n    return x\n";
        let predicate = || Expected::Predicate("lambda x: x > 0".to_string());
        let report = run(
            source,
            vec![
                case(json!([5]), predicate()),
                case(json!([-5]), predicate()),
            ],
            Some("f"),
        );
        assert_eq!(report.tests.passed, 1);
        assert!(report.tests.details[0].passed);
        assert!(!report.tests.details[1].passed);
    }

    #[test]
    fn load_failure_marks_batch_not_run() {
        let report = run(
            "raise RuntimeError('broken at import time')\n",
            vec![case(json!([1]), Expected::Value(json!(1)))],
            Some("f"),
        );
        assert_eq!(report.outcome.status, ExecutionStatus::RuntimeError);
        assert!(report.outcome.error.contains("broken at import time"));
        assert_eq!(report.tests.total, 1);
        assert_eq!(report.tests.passed, 0);
        assert!(report.tests.details[0]
            .error
            .as_deref()
            .unwrap()
            .starts_with("not run"));
    }

    #[test]
    fn stdout_is_captured_and_truncated() {
        let mut policy = ExecutionPolicy::default();
        policy.max_output_bytes = 32;
        let report = run_submission(
            "for i in range(100):\n    print('spam')\n",
            &[],
            None,
            &policy,
        );
        assert_eq!(report.outcome.status, ExecutionStatus::Success);
        assert!(report.outcome.stdout.starts_with("spam"));
        assert!(report
            .outcome
            .stdout
            .ends_with(crate::utils::output::TRUNCATION_MARKER));
    }

    #[test]
    fn state_persists_across_cases_within_a_batch() {
        let source = "calls = []\ndef f(x):\n    calls.append(x)\n    return len(calls)\n";
        let report = run(
            source,
            vec![
                case(json!([10]), Expected::Value(json!(1))),
                case(json!([20]), Expected::Value(json!(2))),
            ],
            Some("f"),
        );
        assert_eq!(report.tests.passed, 2);
    }

    #[test]
    fn runtime_import_denial_is_reported_per_case() {
        // `json` passes static validation only when allow-listed; a module
        // outside the allow list is refused by the import hook at runtime.
        let source = "def f():\n    import secrets\n    return 1\n";
        let report = run(source, vec![case(json!([]), Expected::Value(json!(1)))], Some("f"));
        assert_eq!(report.tests.passed, 0);
        assert!(report.tests.details[0]
            .error
            .as_deref()
            .unwrap()
            .contains("not permitted"));
    }

    #[test]
    fn identical_runs_are_idempotent() {
        let source = "def add(a, b):\n    return a + b\n";
        let cases = vec![
            case(json!([1, 1]), Expected::Value(json!(2))),
            case(json!([2, 2]), Expected::Value(json!(5))),
        ];
        let first = run(source, cases.clone(), Some("add"));
        let second = run(source, cases, Some("add"));
        assert_eq!(first.tests.passed, second.tests.passed);
        assert_eq!(first.tests.failed, second.tests.failed);
    }
}
