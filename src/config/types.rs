/// Core types shared across the sandbox: status taxonomy, test-case model,
/// outcome/report structures, and the crate error type.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Status of one whole submission run - closed taxonomy.
///
/// Serialized forms are the wire strings consumed by the grading caller.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Submission loaded and the batch ran to completion.
    #[serde(rename = "success")]
    Success,
    /// Submission raised during load, or the isolate died with a
    /// diagnosable non-limit cause.
    #[serde(rename = "runtime_error")]
    RuntimeError,
    /// Wall-clock limit exceeded; the isolate was forcibly terminated.
    #[serde(rename = "timeout")]
    Timeout,
    /// Memory ceiling hit (MemoryError inside the interpreter, or the
    /// isolate was killed without producing a result).
    #[serde(rename = "memory_limit")]
    MemoryExceeded,
    /// Static validation rejected the submission; nothing was executed.
    #[serde(rename = "security_violation")]
    SecurityViolation,
    /// The sandbox itself failed (isolate could not be started, internal
    /// fault). Not the submission's fault.
    #[serde(rename = "infrastructure_error")]
    InfrastructureError,
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        ExecutionStatus::Success
    }
}

impl ExecutionStatus {
    /// Faults that abort the remainder of a batch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Timeout
                | ExecutionStatus::MemoryExceeded
                | ExecutionStatus::InfrastructureError
        )
    }
}

/// Classification of a static-analysis finding - closed set.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum IssueKind {
    #[serde(rename = "blocked_import")]
    BlockedImport,
    #[serde(rename = "blocked_callable")]
    BlockedCallable,
    #[serde(rename = "blocked_attribute")]
    BlockedAttribute,
    #[serde(rename = "syntax_error")]
    SyntaxError,
}

/// One finding produced by the static validator.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub detail: String,
}

impl ValidationIssue {
    pub fn new(kind: IssueKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Arguments for one test case invocation.
///
/// Mirrors the caller's JSON shape: an array is positional arguments, an
/// object is keyword arguments, anything else is a single raw argument.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CaseInput {
    Positional(Vec<serde_json::Value>),
    Keyword(BTreeMap<String, serde_json::Value>),
    Single(serde_json::Value),
}

impl Default for CaseInput {
    fn default() -> Self {
        CaseInput::Positional(Vec::new())
    }
}

/// Expected outcome of a test case.
///
/// `Value` compares with exact equality plus a 1e-9 tolerance for numeric
/// leaves. `Predicate` carries a Python expression evaluating to a callable
/// that is compiled inside the isolate and applied to the actual result;
/// the distinction survives serialization across the runner boundary.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Expected {
    Value(serde_json::Value),
    Predicate(String),
}

/// One test case supplied by the grading caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub input: CaseInput,
    pub expected: Expected,
    /// Optional per-case time budget, tighter than the policy wall timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_override: Option<Duration>,
    #[serde(default)]
    pub description: String,
}

/// Result of one submission run: module load plus the whole batch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    /// Submission stdout, truncated to the policy output ceiling.
    pub stdout: String,
    /// Human-readable fault description; empty on success.
    pub error: String,
    pub execution_time: Duration,
    /// Peak resident set observed for the execution unit, in bytes.
    pub memory_used: u64,
}

impl ExecutionOutcome {
    pub fn success(stdout: String, execution_time: Duration, memory_used: u64) -> Self {
        Self {
            status: ExecutionStatus::Success,
            stdout,
            error: String::new(),
            execution_time,
            memory_used,
        }
    }

    pub fn fault(status: ExecutionStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            error: error.into(),
            execution_time: Duration::ZERO,
            memory_used: 0,
        }
    }
}

/// Per-case verdict, index-aligned with the input batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestResult {
    pub case_index: usize,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time: Duration,
}

impl TestResult {
    pub fn failed(case_index: usize, error: impl Into<String>) -> Self {
        Self {
            case_index,
            passed: false,
            actual: None,
            error: Some(error.into()),
            execution_time: Duration::ZERO,
        }
    }
}

/// Aggregated batch verdict. `total == details.len()` and
/// `passed + failed == total` hold by construction.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub details: Vec<TestResult>,
}

impl BatchReport {
    /// Build a report from collected per-case results, preserving order.
    pub fn from_details(details: Vec<TestResult>) -> Self {
        let total = details.len();
        let passed = details.iter().filter(|r| r.passed).count();
        Self {
            total,
            passed,
            failed: total - passed,
            details,
        }
    }

    /// Report for a batch that never ran (static rejection, launch failure).
    pub fn not_run(case_count: usize, reason: &str) -> Self {
        let details = (0..case_count)
            .map(|i| TestResult::failed(i, format!("not run: {reason}")))
            .collect();
        Self::from_details(details)
    }
}

/// Result blob emitted by the runner program as its final stdout line, and
/// the shape handed back by the in-process worker. One per submission run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub outcome: ExecutionOutcome,
    pub tests: BatchReport,
}

/// Sandbox error type. Submission misbehavior is not an error here - it is
/// data in the outcome; these are faults of the sandbox machinery itself.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Resource limit error: {0}")]
    ResourceLimit(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Runner error: {0}")]
    Runner(String),
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_strings_are_stable() {
        let cases = [
            (ExecutionStatus::Success, "\"success\""),
            (ExecutionStatus::RuntimeError, "\"runtime_error\""),
            (ExecutionStatus::Timeout, "\"timeout\""),
            (ExecutionStatus::MemoryExceeded, "\"memory_limit\""),
            (ExecutionStatus::SecurityViolation, "\"security_violation\""),
            (
                ExecutionStatus::InfrastructureError,
                "\"infrastructure_error\"",
            ),
        ];
        for (status, expected) in cases {
            assert_eq!(serde_json::to_string(&status).unwrap(), expected);
        }
    }

    #[test]
    fn case_input_shapes_from_json() {
        let positional: CaseInput = serde_json::from_str("[2, 3]").unwrap();
        assert!(matches!(positional, CaseInput::Positional(ref v) if v.len() == 2));

        let keyword: CaseInput = serde_json::from_str(r#"{"a": 2, "b": 3}"#).unwrap();
        assert!(matches!(keyword, CaseInput::Keyword(ref m) if m.len() == 2));

        let single: CaseInput = serde_json::from_str("7").unwrap();
        assert!(matches!(single, CaseInput::Single(_)));
    }

    #[test]
    fn expected_predicate_survives_round_trip() {
        let expected = Expected::Predicate("lambda x: x > 0".to_string());
        let json = serde_json::to_string(&expected).unwrap();
        assert!(json.contains("predicate"));
        let back: Expected = serde_json::from_str(&json).unwrap();
        assert_eq!(back, expected);
    }

    #[test]
    fn batch_report_counts_are_consistent() {
        let details = vec![
            TestResult {
                case_index: 0,
                passed: true,
                actual: Some(serde_json::json!(5)),
                error: None,
                execution_time: Duration::from_millis(1),
            },
            TestResult::failed(1, "boom"),
        ];
        let report = BatchReport::from_details(details);
        assert_eq!(report.total, 2);
        assert_eq!(report.passed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.total, report.details.len());
    }

    #[test]
    fn not_run_report_marks_every_case() {
        let report = BatchReport::not_run(3, "submission rejected");
        assert_eq!(report.total, 3);
        assert_eq!(report.passed, 0);
        for (i, detail) in report.details.iter().enumerate() {
            assert_eq!(detail.case_index, i);
            assert!(!detail.passed);
            assert!(detail.error.as_deref().unwrap().starts_with("not run"));
        }
    }
}
