/// External entry points for the grading caller.
///
/// `SandboxService` holds the shared immutable policy and the configured
/// execution strategy. It is stateless per call and safe to share across
/// threads; concurrent submissions each get their own isolate.
use crate::analysis;
use crate::config::policy::ExecutionPolicy;
use crate::config::settings::SandboxSettings;
use crate::config::types::{
    BatchReport, ExecutionOutcome, ExecutionStatus, Result, RunReport,
};
use crate::exec::IsolatedRunner;
use crate::report::{
    build_response, rejection_response, ExecuteRequest, ExecuteResponse, ValidationReport,
};
use std::sync::Arc;
use std::time::Duration;

pub struct SandboxService {
    policy: Arc<ExecutionPolicy>,
    runner: IsolatedRunner,
    max_wall_timeout: Duration,
    max_memory_limit: u64,
}

impl SandboxService {
    pub fn new(settings: SandboxSettings) -> Result<Self> {
        let runner = IsolatedRunner::new(settings.isolation_mode, settings.runner_path)?;
        Ok(Self {
            policy: Arc::new(settings.policy),
            runner,
            max_wall_timeout: settings.max_wall_timeout,
            max_memory_limit: settings.max_memory_limit,
        })
    }

    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        Self::new(SandboxSettings::from_env())
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    /// Pre-flight check without executing anything.
    pub fn validate(&self, source: &str) -> ValidationReport {
        let issues = analysis::validate(source, &self.policy);
        ValidationReport {
            is_valid: issues.is_empty(),
            issues,
        }
    }

    /// Execute a submission request end to end: static vetting, isolated
    /// execution, result assembly. Always returns a well-formed response;
    /// an internal fault degrades to `InfrastructureError` rather than
    /// propagating out.
    pub fn execute(&self, request: &ExecuteRequest) -> ExecuteResponse {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.execute_inner(request)
        }));
        match outcome {
            Ok(response) => response,
            Err(_) => {
                log::error!("internal panic during execution; degrading to infrastructure error");
                build_response(&RunReport {
                    outcome: ExecutionOutcome::fault(
                        ExecutionStatus::InfrastructureError,
                        "internal error",
                    ),
                    tests: BatchReport::not_run(request.test_cases.len(), "internal error"),
                })
            }
        }
    }

    fn execute_inner(&self, request: &ExecuteRequest) -> ExecuteResponse {
        // Reject before any isolate is started; static rejection is cheap
        // and terminal.
        let issues = analysis::validate(&request.source, &self.policy);
        if !issues.is_empty() {
            log::info!("submission rejected by static validation ({} issues)", issues.len());
            return rejection_response(&issues, request.test_cases.len());
        }

        let policy = self.policy.with_overrides(
            &request.policy_overrides,
            self.max_wall_timeout,
            self.max_memory_limit,
        );

        let report = self.runner.run(
            &request.source,
            &request.test_cases,
            request.target_callable.as_deref(),
            &policy,
        );
        build_response(&report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{CaseInput, Expected, IssueKind, TestCase};
    use crate::exec::IsolationMode;
    use serde_json::json;

    fn in_process_service() -> SandboxService {
        let mut settings = SandboxSettings::default();
        settings.isolation_mode = IsolationMode::InProcess;
        settings.policy.memory_limit = 4 * 1024 * 1024 * 1024;
        settings.max_memory_limit = 4 * 1024 * 1024 * 1024;
        SandboxService::new(settings).expect("service construction")
    }

    fn request(source: &str, cases: Vec<TestCase>, target: Option<&str>) -> ExecuteRequest {
        ExecuteRequest {
            source: source.to_string(),
            test_cases: cases,
            target_callable: target.map(str::to_string),
            policy_overrides: Default::default(),
        }
    }

    fn case(input: serde_json::Value, expected: serde_json::Value) -> TestCase {
        TestCase {
            input: serde_json::from_value::<CaseInput>(input).unwrap(),
            expected: Expected::Value(expected),
            timeout_override: None,
            description: String::new(),
        }
    }

    #[test]
    fn validation_endpoint_reports_issues_without_executing() {
        let service = in_process_service();
        let report = service.validate("import os\n");
        assert!(!report.is_valid);
        assert_eq!(report.issues[0].kind, IssueKind::BlockedImport);

        let report = service.validate("def add(a, b):\n    return a + b\n");
        assert!(report.is_valid);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn blocked_import_never_reaches_execution() {
        let service = in_process_service();
        let response = service.execute(&request(
            "import os\ndef f():\n    return os.system('ls')\n",
            vec![case(json!([]), json!(0))],
            Some("f"),
        ));
        assert_eq!(response.status, ExecutionStatus::SecurityViolation);
        assert_eq!(response.test_results.passed, 0);
        assert_eq!(response.test_results.total, 1);
        // No execution happened: no stdout, and the error names the module.
        assert!(response.stdout.is_empty());
        assert!(response.error.contains("os"));
    }

    #[test]
    fn rejected_submission_never_launches_isolate() {
        // A runner path that cannot exist: had the isolate been launched,
        // the response would be infrastructure_error. Static rejection
        // winning proves no launch was attempted.
        let mut settings = SandboxSettings::default();
        settings.isolation_mode = IsolationMode::Process;
        settings.runner_path = Some(std::path::PathBuf::from("/nonexistent/gradebox-runner"));
        let service = SandboxService::new(settings).expect("service construction");

        let response = service.execute(&request(
            "import os\n",
            vec![case(json!([]), json!(null))],
            Some("f"),
        ));
        assert_eq!(response.status, ExecutionStatus::SecurityViolation);
    }

    #[test]
    fn blocked_callable_is_rejected() {
        let service = in_process_service();
        let response = service.execute(&request(
            "def f():\n    return eval('1+1')\n",
            vec![case(json!([]), json!(2))],
            Some("f"),
        ));
        assert_eq!(response.status, ExecutionStatus::SecurityViolation);
        assert!(response.error.contains("eval"));
    }

    #[test]
    fn add_function_end_to_end() {
        let service = in_process_service();
        let response = service.execute(&request(
            "def add(a, b):\n    return a + b\n",
            vec![case(json!({"a": 2, "b": 3}), json!(5))],
            Some("add"),
        ));
        assert_eq!(response.status, ExecutionStatus::Success);
        assert_eq!(response.test_results.passed, 1);
        assert_eq!(response.test_results.details[0].actual, Some(json!(5)));
    }

    #[test]
    fn wall_timeout_override_is_honored() {
        let service = in_process_service();
        let mut req = request(
            "def f():\n    while True:\n        pass\n",
            vec![case(json!([]), json!(null))],
            Some("f"),
        );
        req.policy_overrides.wall_timeout = Some(Duration::from_secs(1));

        let started = std::time::Instant::now();
        let response = service.execute(&req);
        assert_eq!(response.status, ExecutionStatus::Timeout);
        assert_eq!(response.test_results.passed, 0);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
