use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio_util::sync::CancellationToken;

use crate::config::{CompileFailurePolicy, SandboxConfig};

use super::process::{self, Captured, Waited};
use super::report::TRUNCATED_NOTE;
use super::workspace::Workspace;

/// Result of the compilation stage
#[derive(Debug, PartialEq, Eq)]
pub enum CompileOutcome {
    Success(PathBuf),
    CompileError(String),
    Timeout,
    Aborted,
    LaunchFailure(String),
}

/// Compiles the workspace's source file into its artifact path
pub async fn compile(
    workspace: &Workspace,
    config: &SandboxConfig,
    cancel: &CancellationToken,
) -> CompileOutcome {
    let (capture, stderr) = match process::capture(config.output_limit.as_usize()) {
        Ok(pipe) => pipe,
        Err(e) => return CompileOutcome::LaunchFailure(format!("failed to open pipe: {e}")),
    };

    // The command owns the parent's copy of the stderr writer; dropping it
    // right after spawning lets the reader see EOF when the compiler exits.
    let spawned = {
        let mut cmd = process::command(&config.compiler);
        cmd.arg(workspace.source_path())
            .arg("-o")
            .arg(workspace.artifact_path())
            .args(&config.compiler_flags)
            .current_dir(workspace.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr);
        cmd.spawn()
    };

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            log::warn!("Failed to spawn compiler `{}`: {e}", config.compiler);
            return CompileOutcome::LaunchFailure(format!(
                "failed to start compiler `{}`: {e}",
                config.compiler
            ));
        }
    };
    let pid = child.id();

    let status = match process::wait_bounded(&mut child, config.compile_timeout.into(), cancel).await
    {
        Ok(Waited::Exited(status)) => status,
        Ok(Waited::TimedOut) => {
            log::info!(
                "Compilation exceeded {} ms, compiler killed",
                config.compile_timeout.0
            );
            return CompileOutcome::Timeout;
        }
        Ok(Waited::Aborted) => return CompileOutcome::Aborted,
        Err(e) => {
            return CompileOutcome::LaunchFailure(format!("failed to wait for compiler: {e}"));
        }
    };

    let diagnostics = match capture.finish(pid).await {
        Ok(captured) => diagnostics_text(captured),
        Err(e) => {
            log::error!("Failed to read compiler output: {e}");
            return CompileOutcome::LaunchFailure(format!("failed to read compiler output: {e}"));
        }
    };

    classify(
        config.compile_failure,
        status,
        diagnostics,
        workspace.artifact_path(),
    )
}

fn diagnostics_text(captured: Captured) -> String {
    if captured.truncated {
        format!("{}\n{TRUNCATED_NOTE}", captured.text)
    } else {
        captured.text
    }
}

/// Turns a finished compiler process into a [`CompileOutcome`]
fn classify(
    policy: CompileFailurePolicy,
    status: ExitStatus,
    diagnostics: String,
    artifact: &Path,
) -> CompileOutcome {
    let has_diagnostics = !diagnostics.trim().is_empty();
    let failed = match policy {
        CompileFailurePolicy::ExitStatus => !status.success(),
        CompileFailurePolicy::Stderr => has_diagnostics,
        CompileFailurePolicy::Either => !status.success() || has_diagnostics,
    };

    if failed {
        log::debug!("Compilation failed with {status}");
        if has_diagnostics {
            return CompileOutcome::CompileError(diagnostics);
        }
        return CompileOutcome::CompileError(format!("compiler exited with {status}"));
    }

    if !artifact.exists() {
        return CompileOutcome::CompileError("executable not created".to_string());
    }

    if has_diagnostics {
        log::debug!("Compilation succeeded with diagnostics:\n{diagnostics}");
    }
    CompileOutcome::Success(artifact.to_path_buf())
}
