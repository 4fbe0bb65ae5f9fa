/// Result reporting: the external wire shapes returned to the grading
/// caller, assembled purely from the execution outcome and batch report.
use crate::config::policy::PolicyOverrides;
use crate::config::types::{
    BatchReport, ExecutionOutcome, ExecutionStatus, RunReport, TestCase, TestResult,
    ValidationIssue,
};
use serde::{Deserialize, Serialize};

/// Request submitted by the external grading collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub source: String,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub target_callable: Option<String>,
    #[serde(default)]
    pub policy_overrides: PolicyOverrides,
}

/// Per-case detail in the response, times flattened to milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestDetail {
    pub case_index: usize,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: f64,
}

impl From<&TestResult> for TestDetail {
    fn from(result: &TestResult) -> Self {
        Self {
            case_index: result.case_index,
            passed: result.passed,
            actual: result.actual.clone(),
            error: result.error.clone(),
            execution_time_ms: result.execution_time.as_secs_f64() * 1000.0,
        }
    }
}

/// Aggregate test summary in the response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub details: Vec<TestDetail>,
}

impl From<&BatchReport> for TestSummary {
    fn from(report: &BatchReport) -> Self {
        Self {
            total: report.total,
            passed: report.passed,
            failed: report.failed,
            details: report.details.iter().map(TestDetail::from).collect(),
        }
    }
}

/// Response returned for every execute call, well-formed on every path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub error: String,
    pub execution_time_ms: f64,
    pub memory_used_mb: f64,
    pub test_results: TestSummary,
}

/// Response of the validation-only endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
}

/// Assemble the final response. Pure: no I/O, no side effects.
pub fn build_response(report: &RunReport) -> ExecuteResponse {
    let RunReport { outcome, tests } = report;
    ExecuteResponse {
        status: outcome.status.clone(),
        stdout: outcome.stdout.clone(),
        error: outcome.error.clone(),
        execution_time_ms: outcome.execution_time.as_secs_f64() * 1000.0,
        memory_used_mb: outcome.memory_used as f64 / (1024.0 * 1024.0),
        test_results: TestSummary::from(tests),
    }
}

/// Response for a submission rejected before execution.
pub fn rejection_response(issues: &[ValidationIssue], case_count: usize) -> ExecuteResponse {
    let detail = issues
        .iter()
        .map(|issue| issue.detail.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    let report = RunReport {
        outcome: ExecutionOutcome::fault(
            ExecutionStatus::SecurityViolation,
            format!("security issues found: {detail}"),
        ),
        tests: BatchReport::not_run(case_count, "submission rejected"),
    };
    build_response(&report)
}
