//! gradebox: sandboxed execution of untrusted learner submissions.
//!
//! Submissions are run against test cases behind defense-in-depth layers:
//! static vetting of the syntax tree before anything executes, resource
//! ceilings scoped to one execution, and an isolated execution context with
//! a host-enforced wall-clock timeout.
//!
//! # Architecture
//!
//! - [`analysis`]: static admission check over the parsed submission
//! - [`config`]: execution policy, deployment settings, shared types
//! - [`exec`]: isolation strategies (runner process, in-process fallback),
//!   rlimit scoping, embedded interpreter plumbing
//! - [`harness`]: per-case test driving and output comparison
//! - [`report`]: wire shapes returned to the grading caller
//! - [`api`]: the service facade tying the pipeline together
//!
//! # Design principles
//!
//! 1. **Fail closed** - unparseable code is rejected, not waved through
//! 2. **Host as authority** - timeouts are enforced outside the isolate
//! 3. **Faults are data** - submission misbehavior becomes a structured
//!    outcome, never a crash of the service
//! 4. **Nothing shared** - a fresh interpreter per submission; the only
//!    cross-execution state is the immutable policy

// Static admission check
pub mod analysis;

// Configuration & policy
pub mod config;

// Isolated execution
pub mod exec;

// Test harness
pub mod harness;

// Result reporting
pub mod report;

// Service facade
pub mod api;

// Bounded output collection
pub mod utils;

// Re-export commonly used types for convenience
pub use api::SandboxService;
pub use config::policy::{ExecutionPolicy, PolicyOverrides};
pub use config::settings::SandboxSettings;
pub use config::types::{
    BatchReport, CaseInput, ExecutionOutcome, ExecutionStatus, Expected, IssueKind, Result,
    RunReport, SandboxError, TestCase, TestResult, ValidationIssue,
};
pub use exec::IsolationMode;
pub use report::{ExecuteRequest, ExecuteResponse, ValidationReport};
