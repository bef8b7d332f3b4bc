use std::fmt;

use super::{RunOutcome, Stage};

/// Appended to output or diagnostics cut at the configured limit
pub(super) const TRUNCATED_NOTE: &str = "[output truncated]";

impl RunOutcome {
    /// Short verdict shown next to the output panel
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Output { .. } => "Finished",
            RunOutcome::CompileError { .. } => "Compilation Error",
            RunOutcome::Timeout { .. } => "Time Limit Exceeded",
            RunOutcome::Aborted { .. } => "Aborted",
            RunOutcome::LaunchFailure { .. } => "System Error",
            RunOutcome::EmptySource => "Empty Source",
        }
    }

    /// Whether the sandbox, rather than the user's program, stopped the run
    pub fn is_sandbox_failure(&self) -> bool {
        !matches!(self, RunOutcome::Output { .. })
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Compile => f.write_str("compilation"),
            Stage::Run => f.write_str("execution"),
        }
    }
}

/// The single human-readable string the output panel receives
impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Output {
                text,
                exit_code,
                truncated,
            } => {
                f.write_str(text)?;
                if *truncated {
                    write!(f, "\n{TRUNCATED_NOTE}")?;
                }
                match exit_code {
                    Some(0) => Ok(()),
                    Some(code) => write!(f, "\n[program exited with code {code}]"),
                    None => write!(f, "\n[program terminated by a signal]"),
                }
            }
            RunOutcome::CompileError { diagnostic } => {
                write!(f, "Compilation Error:\n{diagnostic}")
            }
            RunOutcome::Timeout { stage, limit_ms } => {
                write!(f, "Time Limit Exceeded: {stage} did not finish within {limit_ms} ms")
            }
            RunOutcome::Aborted { stage } => write!(f, "Aborted during {stage}"),
            RunOutcome::LaunchFailure { reason } => write!(f, "System Error: {reason}"),
            RunOutcome::EmptySource => f.write_str("Nothing to run: the source is empty"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn output(text: &str, exit_code: Option<i32>, truncated: bool) -> RunOutcome {
        RunOutcome::Output {
            text: text.to_string(),
            exit_code,
            truncated,
        }
    }

    #[test]
    fn test_clean_output_is_rendered_verbatim() {
        assert_eq!(output("42", Some(0), false).to_string(), "42");
        assert_eq!(output("", Some(0), false).to_string(), "");
    }

    #[test]
    fn test_program_failure_is_marked() {
        assert_eq!(
            output("partial\n", Some(3), false).to_string(),
            "partial\n\n[program exited with code 3]"
        );
        assert_eq!(
            output("", None, false).to_string(),
            "\n[program terminated by a signal]"
        );
        assert_eq!(
            output("yyyy", Some(0), true).to_string(),
            "yyyy\n[output truncated]"
        );
    }

    #[test]
    fn test_sandbox_failures_are_rendered() {
        let timeout = RunOutcome::Timeout {
            stage: Stage::Run,
            limit_ms: 5000,
        };
        assert_eq!(
            timeout.to_string(),
            "Time Limit Exceeded: execution did not finish within 5000 ms"
        );

        let compile = RunOutcome::CompileError {
            diagnostic: "main.cpp:1:1: error".to_string(),
        };
        assert_eq!(compile.to_string(), "Compilation Error:\nmain.cpp:1:1: error");

        let aborted = RunOutcome::Aborted {
            stage: Stage::Compile,
        };
        assert_eq!(aborted.to_string(), "Aborted during compilation");
    }

    #[test]
    fn test_labels_separate_program_and_sandbox_failures() {
        assert_eq!(output("", Some(1), false).label(), "Finished");
        assert!(!output("", Some(1), false).is_sandbox_failure());
        assert_eq!(RunOutcome::EmptySource.label(), "Empty Source");
        assert!(RunOutcome::EmptySource.is_sandbox_failure());
    }

    #[test]
    fn test_outcome_serialization() {
        let value = serde_json::to_value(RunOutcome::Timeout {
            stage: Stage::Compile,
            limit_ms: 4000,
        })
        .unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "kind": "timeout", "stage": "compile", "limit_ms": 4000 })
        );
    }
}
