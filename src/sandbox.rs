mod compile;
mod execute;
mod process;
mod report;
mod workspace;

pub use compile::CompileOutcome;
pub use workspace::{Workspace, WorkspaceError};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::SandboxConfig;

/// Source and input captured when the user triggers a run
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub source_text: String,
    #[serde(default)]
    pub stdin_text: String,
}

impl ExecutionRequest {
    pub fn new(source_text: impl Into<String>, stdin_text: impl Into<String>) -> Self {
        Self {
            source_text: source_text.into(),
            stdin_text: stdin_text.into(),
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Compile,
    Run,
}

/// Terminal result of one run, rendered for the user by its `Display` impl
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The program ran to completion, whatever its exit code
    Output {
        text: String,
        /// `None` when the program was terminated by a signal
        exit_code: Option<i32>,
        truncated: bool,
    },
    CompileError {
        diagnostic: String,
    },
    Timeout {
        stage: Stage,
        limit_ms: u64,
    },
    Aborted {
        stage: Stage,
    },
    LaunchFailure {
        reason: String,
    },
    EmptySource,
}

/// Compiles and runs user code, one request at a time per call
///
/// Each call owns a fresh [`Workspace`], so concurrent calls never share
/// files; serialising runs is left to [`crate::worker`].
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Main entry point for running a request
    ///
    /// Never fails: every error becomes a [`RunOutcome`] variant. The
    /// workspace is removed before returning on every path, and by its
    /// destructor if this future panics or is dropped.
    pub async fn run(&self, request: &ExecutionRequest, cancel: &CancellationToken) -> RunOutcome {
        if request.source_text.trim().is_empty() {
            return RunOutcome::EmptySource;
        }

        let workspace = match Workspace::acquire(&self.config.scratch_dir(), &self.config.source_name)
        {
            Ok(workspace) => workspace,
            Err(e) => {
                log::error!("{e}");
                return RunOutcome::LaunchFailure {
                    reason: e.to_string(),
                };
            }
        };

        let outcome = self.run_in(&workspace, request, cancel).await;

        if let Err(e) = workspace.release() {
            log::warn!("{e}");
        }
        outcome
    }

    async fn run_in(
        &self,
        workspace: &Workspace,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        if let Err(e) = workspace.write_source(&request.source_text).await {
            log::error!("{e}");
            return RunOutcome::LaunchFailure {
                reason: e.to_string(),
            };
        }

        // Step 1: Compile the source code
        let artifact = match compile::compile(workspace, &self.config, cancel).await {
            CompileOutcome::Success(artifact) => artifact,
            CompileOutcome::CompileError(diagnostic) => {
                return RunOutcome::CompileError { diagnostic };
            }
            CompileOutcome::Timeout => {
                return RunOutcome::Timeout {
                    stage: Stage::Compile,
                    limit_ms: self.config.compile_timeout.0,
                };
            }
            CompileOutcome::Aborted => {
                return RunOutcome::Aborted {
                    stage: Stage::Compile,
                };
            }
            CompileOutcome::LaunchFailure(reason) => {
                return RunOutcome::LaunchFailure { reason };
            }
        };

        // Step 2: Run the artifact
        execute::execute(
            &artifact,
            workspace.path(),
            &request.stdin_text,
            &self.config,
            cancel,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox_in(dir: &tempfile::TempDir) -> Sandbox {
        Sandbox::new(SandboxConfig {
            scratch_dir: Some(dir.path().to_path_buf()),
            ..SandboxConfig::default()
        })
    }

    #[tokio::test]
    async fn test_empty_source_creates_no_workspace() {
        let scratch = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(&scratch);
        let token = CancellationToken::new();

        for source in ["", "  \n\t"] {
            let outcome = sandbox.run(&ExecutionRequest::new(source, "1"), &token).await;
            assert_eq!(outcome, RunOutcome::EmptySource);
        }
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_compiler_is_launch_failure() {
        let scratch = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(SandboxConfig {
            compiler: "kodetron-no-such-compiler".to_string(),
            scratch_dir: Some(scratch.path().to_path_buf()),
            ..SandboxConfig::default()
        });
        let token = CancellationToken::new();

        let outcome = sandbox
            .run(&ExecutionRequest::new("int main(){}", ""), &token)
            .await;

        let RunOutcome::LaunchFailure { reason } = outcome else {
            panic!("expected launch failure, got {outcome:?}");
        };
        assert!(reason.contains("kodetron-no-such-compiler"));
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unusable_scratch_dir_is_launch_failure() {
        let sandbox = Sandbox::new(SandboxConfig {
            scratch_dir: Some("/nonexistent/kodetron".into()),
            ..SandboxConfig::default()
        });
        let token = CancellationToken::new();

        let outcome = sandbox
            .run(&ExecutionRequest::new("int main(){}", ""), &token)
            .await;

        assert!(matches!(outcome, RunOutcome::LaunchFailure { .. }));
    }

    #[test]
    fn test_request_stdin_defaults_to_empty() {
        let request: ExecutionRequest =
            serde_json::from_str(r#"{ "source_text": "int main(){}" }"#).unwrap();
        assert_eq!(request, ExecutionRequest::new("int main(){}", ""));
    }
}
