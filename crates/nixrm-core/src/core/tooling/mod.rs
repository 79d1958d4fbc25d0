//! CLI-facing diagnostics, progress reporting, and outcome shaping.

pub mod diagnostics;
pub mod outcome;
pub mod progress;

use serde_json::{json, Value};

use super::errors::{PipelineError, RewriteError, TransferError};
use super::pipeline::RunSummary;
use outcome::ExecutionOutcome;

const CANCELLED_EXIT: i32 = 130;

/// Shapes the result of a run into the envelope the binary prints.
pub fn outcome_from_run(result: Result<RunSummary, PipelineError>) -> ExecutionOutcome {
    match result {
        Ok(summary) => {
            let message = if summary.dry_run {
                format!(
                    "would send {} of {} objects ({} bytes) to {}",
                    summary.missing.len(),
                    summary.objects,
                    summary.missing_bytes,
                    summary.host
                )
            } else {
                format!(
                    "{} exited with {}",
                    summary.command,
                    summary.exit_code.unwrap_or_default()
                )
            };
            let exit_code = summary.exit_code;
            let details = serde_json::to_value(&summary).unwrap_or(Value::Null);
            let outcome = ExecutionOutcome::success(message, details);
            match exit_code {
                Some(code) => outcome.with_exit_code(code),
                None => outcome,
            }
        }
        Err(err) => {
            let mut details = json!({
                "code": err.code(),
                "stage": err.stage().as_str(),
            });
            if let Some(object) = err.object() {
                details["object"] = Value::String(object.to_string());
            }
            if let Some(file) = err.file() {
                details["file"] = Value::String(file.to_string());
            }
            if let Some(hint) = hint(&err) {
                details["hint"] = Value::String(hint.to_string());
            }
            let outcome = if err.is_user_error() {
                ExecutionOutcome::user_error(err.to_string(), details)
            } else {
                ExecutionOutcome::failure(err.to_string(), details)
            };
            if matches!(err, PipelineError::Cancelled(_)) {
                outcome.with_exit_code(CANCELLED_EXIT)
            } else {
                outcome
            }
        }
    }
}

fn hint(err: &PipelineError) -> Option<&'static str> {
    match err {
        PipelineError::Rewrite(RewriteError::Mapping(_)) => {
            Some("choose a --remap root with exactly as many characters as --store")
        }
        PipelineError::Rewrite(RewriteError::AmbiguousReference { .. }) => {
            Some("the file embeds a store hash without a name; it cannot be relocated safely")
        }
        PipelineError::Transfer(TransferError::VerificationMismatch { .. }, _) => {
            Some("the remote root holds a different copy of this object; clear it or pick another --remap")
        }
        PipelineError::Transfer(TransferError::Connect { .. }, _) => {
            Some("check that `ssh <host>` works non-interactively")
        }
        PipelineError::Launch(super::errors::LaunchError::NoCommand { .. }) => {
            Some("pass the program explicitly with -c <command>")
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{LaunchError, Stage};
    use crate::core::remote::TransferReport;
    use nixrm_domain::MappingError;
    use outcome::CommandStatus;

    fn summary(exit_code: Option<i32>) -> RunSummary {
        RunSummary {
            primary: "abcd-hello".into(),
            host: "box".into(),
            remote_root: "/tmp/nixrm".into(),
            objects: 2,
            replacements: 3,
            present: 1,
            missing: vec!["wxyz-glibc".into()],
            missing_bytes: 10,
            transfer: TransferReport::default(),
            command: "hello".into(),
            dry_run: exit_code.is_none(),
            exit_code,
        }
    }

    #[test]
    fn remote_status_becomes_the_exit_code() {
        let outcome = outcome_from_run(Ok(summary(Some(42))));
        assert_eq!(outcome.status, CommandStatus::Ok);
        assert_eq!(outcome.exit_code(), 42);

        let dry = outcome_from_run(Ok(summary(None)));
        assert_eq!(dry.exit_code(), 0);
        assert!(dry.message.starts_with("would send 1 of 2 objects"));
    }

    #[test]
    fn errors_map_to_user_failure_or_cancel_codes() {
        let mapping = outcome_from_run(Err(PipelineError::Rewrite(RewriteError::Mapping(
            MappingError::NotAbsolute("tmp".into()),
        ))));
        assert_eq!(mapping.status, CommandStatus::UserError);
        assert_eq!(mapping.exit_code(), 1);
        assert_eq!(mapping.details["code"], "NRM201");
        assert!(mapping.details["hint"].is_string());

        let dropped = outcome_from_run(Err(PipelineError::Launch(LaunchError::SessionDropped {
            host: "box".into(),
        })));
        assert_eq!(dropped.exit_code(), 2);
        assert_eq!(dropped.details["stage"], "launch");

        let cancelled = outcome_from_run(Err(PipelineError::Cancelled(Stage::Transfer)));
        assert_eq!(cancelled.exit_code(), 130);
    }
}
