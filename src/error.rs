//! Error taxonomy for the session engine.
//!
//! Only connection-level and validation-level problems are returned as `Err`
//! from the engine. Step-level failures (timeouts, non-zero exits, stalled
//! prompts, cancellation) are captured into `StepResult`s; the variants below
//! render the error text those results carry.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The remote connection could not be established. No step was attempted.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The interactive channel could not be opened on an established connection.
    #[error("failed to open interactive channel: {0}")]
    Channel(String),

    /// A one-shot remote command could not be executed at all.
    #[error("failed to execute remote command: {0}")]
    Exec(String),

    /// No channel output arrived for the inactivity window while a command
    /// was in flight.
    #[error("timed out after {limit:?} without output")]
    Timeout { step: String, limit: Duration },

    /// The command finished with a non-zero exit status.
    #[error("exited with status {code}")]
    StepExecution { step: String, code: i32 },

    /// An application prompt received neither a configured nor an external
    /// answer in time.
    #[error("prompt not answered within {limit:?}: {prompt}")]
    PromptResolution {
        step: String,
        prompt: String,
        limit: Duration,
    },

    /// The caller aborted the session.
    #[error("cancelled")]
    Aborted,

    /// A step definition is unusable; raised before anything is dispatched.
    #[error("invalid step '{step}': {reason}")]
    Validation { step: String, reason: String },

    /// The engine thread went away without producing results.
    #[error("session engine stopped unexpectedly: {0}")]
    EngineStopped(String),
}

impl EngineError {
    pub fn validation(step: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            step: step.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error prevents any step from running.
    pub fn is_fatal_before_start(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Channel(_) | Self::Validation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_level_errors_render_result_text() {
        let timeout = EngineError::Timeout {
            step: "build".to_string(),
            limit: Duration::from_secs(30),
        };
        assert_eq!(timeout.to_string(), "timed out after 30s without output");

        let short = EngineError::PromptResolution {
            step: "release".to_string(),
            prompt: "Enter release name:".to_string(),
            limit: Duration::from_millis(250),
        };
        assert_eq!(
            short.to_string(),
            "prompt not answered within 250ms: Enter release name:"
        );

        let exit = EngineError::StepExecution {
            step: "build".to_string(),
            code: 2,
        };
        assert_eq!(exit.to_string(), "exited with status 2");

        assert_eq!(EngineError::Aborted.to_string(), "cancelled");
    }

    #[test]
    fn validation_names_the_step() {
        let err = EngineError::validation("deploy", "command is empty");
        assert_eq!(err.to_string(), "invalid step 'deploy': command is empty");
        assert!(err.is_fatal_before_start());
    }

    #[test]
    fn step_errors_are_not_fatal_before_start() {
        assert!(!EngineError::Aborted.is_fatal_before_start());
        assert!(EngineError::Connection("refused".into()).is_fatal_before_start());
    }
}
