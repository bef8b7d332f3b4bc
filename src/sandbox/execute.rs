use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio_util::sync::CancellationToken;

use crate::config::SandboxConfig;

use super::process::{self, Waited};
use super::{RunOutcome, Stage};

/// Runs a compiled artifact with `stdin_text` as its standard input
///
/// Standard output and standard error share one pipe, so the captured text
/// keeps the order in which the program wrote it. The program's own exit
/// code is reported, never treated as a sandbox failure.
pub async fn execute(
    artifact: &Path,
    workdir: &Path,
    stdin_text: &str,
    config: &SandboxConfig,
    cancel: &CancellationToken,
) -> RunOutcome {
    let (capture, output) = match process::capture(config.output_limit.as_usize()) {
        Ok(pipe) => pipe,
        Err(e) => {
            return RunOutcome::LaunchFailure {
                reason: format!("failed to open output pipe: {e}"),
            };
        }
    };

    let spawned = output.try_clone().and_then(|stdout| {
        let stdin = if stdin_text.is_empty() {
            Stdio::null()
        } else {
            Stdio::piped()
        };
        let mut cmd = process::command(artifact);
        cmd.current_dir(workdir)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(output);
        cmd.spawn()
    });

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            log::warn!("Failed to spawn {}: {e}", artifact.display());
            return RunOutcome::LaunchFailure {
                reason: format!("failed to start program: {e}"),
            };
        }
    };
    let pid = child.id();
    log::debug!("Started program {pid:?}");

    let feeder = child
        .stdin
        .take()
        .map(|stdin| tokio::spawn(feed_stdin(stdin, stdin_text.to_owned())));

    let started = Instant::now();
    let waited = process::wait_bounded(&mut child, config.run_timeout.into(), cancel).await;
    if let Some(feeder) = feeder {
        feeder.abort();
    }

    match waited {
        Ok(Waited::Exited(status)) => {
            log::debug!(
                "Program {pid:?} exited with {status} after {} ms",
                started.elapsed().as_millis()
            );
            match capture.finish(pid).await {
                Ok(captured) => RunOutcome::Output {
                    text: captured.text,
                    exit_code: status.code(),
                    truncated: captured.truncated,
                },
                Err(e) => RunOutcome::LaunchFailure {
                    reason: format!("failed to read program output: {e}"),
                },
            }
        }
        Ok(Waited::TimedOut) => {
            log::info!(
                "Program exceeded {} ms, process group killed",
                config.run_timeout.0
            );
            RunOutcome::Timeout {
                stage: Stage::Run,
                limit_ms: config.run_timeout.0,
            }
        }
        Ok(Waited::Aborted) => RunOutcome::Aborted { stage: Stage::Run },
        Err(e) => RunOutcome::LaunchFailure {
            reason: format!("failed to wait for program: {e}"),
        },
    }
}

/// Writes all of `text` and closes the pipe so the program sees EOF
async fn feed_stdin(mut stdin: ChildStdin, text: String) {
    match stdin.write_all(text.as_bytes()).await {
        Ok(()) => {}
        // the program exited or closed stdin without reading everything
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
            log::debug!("Program closed stdin early");
        }
        Err(e) => log::warn!("Failed to write program stdin: {e}"),
    }
}
