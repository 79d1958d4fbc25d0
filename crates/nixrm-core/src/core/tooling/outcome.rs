use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the binary reports for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: CommandStatus,
    pub message: String,
    #[serde(default)]
    pub details: Value,
    /// Overrides the status-derived exit code: the remote command's own code,
    /// or 130 after an interrupt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_override: Option<i32>,
}

impl ExecutionOutcome {
    fn new(status: CommandStatus, message: impl Into<String>, details: Value) -> Self {
        Self {
            status,
            message: message.into(),
            details,
            exit_override: None,
        }
    }

    pub fn success(message: impl Into<String>, details: Value) -> Self {
        Self::new(CommandStatus::Ok, message, details)
    }

    pub fn user_error(message: impl Into<String>, details: Value) -> Self {
        Self::new(CommandStatus::UserError, message, details)
    }

    pub fn failure(message: impl Into<String>, details: Value) -> Self {
        Self::new(CommandStatus::Failure, message, details)
    }

    #[must_use]
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_override = Some(code);
        self
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.exit_override.unwrap_or(match self.status {
            CommandStatus::Ok => 0,
            CommandStatus::UserError => 1,
            CommandStatus::Failure => 2,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CommandStatus {
    Ok,
    UserError,
    Failure,
}

impl CommandStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::UserError => "user-error",
            Self::Failure => "failure",
        }
    }
}
