//! Fixed entry program executed inside the process-mode isolate.
//!
//! Reads the submission and manifest from the workspace prepared by the
//! host, applies the resource-limit scope, runs the batch, and emits one
//! JSON result blob as the final stdout line. Diagnostics go to stderr;
//! submission stdout is captured inside the interpreter and travels in the
//! blob, never on this process's stdout.
use anyhow::{Context, Result};
use clap::Parser;
use gradebox::exec::process::{RunnerManifest, MANIFEST_FILE, SUBMISSION_FILE};
use gradebox::exec::rlimits::{LimitScope, ResourceLimiter};
use gradebox::harness;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "gradebox isolate runner", long_about = None)]
struct Cli {
    /// Workspace directory containing the submission and manifest
    #[arg(long)]
    workspace: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let source = std::fs::read_to_string(cli.workspace.join(SUBMISSION_FILE))
        .context("reading submission")?;
    let manifest_bytes =
        std::fs::read(cli.workspace.join(MANIFEST_FILE)).context("reading manifest")?;
    let manifest: RunnerManifest =
        serde_json::from_slice(&manifest_bytes).context("parsing manifest")?;

    // Ceilings for the whole run; this process is throwaway, so the restore
    // on drop is hygiene rather than necessity.
    let _limits = ResourceLimiter::apply(&manifest.policy, LimitScope::Full)
        .context("applying resource limits")?;

    let report = harness::run_submission(
        &source,
        &manifest.cases,
        manifest.target_callable.as_deref(),
        &manifest.policy,
    );

    let blob = serde_json::to_string(&report).context("serializing result")?;
    println!("{blob}");
    Ok(())
}
