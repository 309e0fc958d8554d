use crate::events::EventDetails;
use std::fmt;
use thiserror::Error;

/// Wraps a raw collaborator-side error (cloud SDK, kube client, HTTP) behind
/// a message that is always safe to log, keeping SDK error types out of the
/// engine's public API.
#[derive(Debug, Clone)]
pub struct CommandError {
    pub message: String,
    pub raw_error: Option<String>,
}

impl CommandError {
    pub fn new(message: String, raw_error: Option<String>) -> Self {
        CommandError { message, raw_error }
    }

    pub fn new_from_safe_message(message: String) -> Self {
        CommandError {
            message,
            raw_error: None,
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.raw_error {
            Some(raw) => write!(f, "{} (cause: {raw})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for CommandError {}

/// Error kinds from the replacement engine's error taxonomy. Every variant
/// carries the `EventDetails` active when it was raised, so a single error
/// can be correlated back to the component/stage that produced it.
#[derive(Debug, Error)]
pub enum RollerError {
    #[error("{event_details}: invalid argument: {command_error}")]
    InvalidArgument {
        event_details: EventDetails,
        command_error: CommandError,
    },

    #[error("{event_details}: upstream call failed: {command_error}")]
    UpstreamError {
        event_details: EventDetails,
        command_error: CommandError,
    },

    #[error("{event_details}: not found: {command_error}")]
    NotFound {
        event_details: EventDetails,
        command_error: CommandError,
    },

    #[error("{event_details}: consistency error: {command_error}")]
    ConsistencyError {
        event_details: EventDetails,
        command_error: CommandError,
    },

    #[error("{event_details}: health prerequisite not met: {command_error}")]
    HealthPrerequisite {
        event_details: EventDetails,
        command_error: CommandError,
    },

    #[error("{event_details}: timed out waiting for replacement instances: {command_error}")]
    ReplacementTimeout {
        event_details: EventDetails,
        command_error: CommandError,
    },

    #[error("{event_details}: timed out verifying instance health: {command_error}")]
    VerifyTimeout {
        event_details: EventDetails,
        command_error: CommandError,
    },

    #[error("{event_details}: timed out waiting for the ASG to drain: {command_error}")]
    DrainTimeout {
        event_details: EventDetails,
        command_error: CommandError,
    },

    #[error("fatal startup error: {command_error}")]
    Fatal { command_error: CommandError },
}

impl RollerError {
    pub fn invalid_argument(event_details: EventDetails, message: impl Into<String>) -> Box<Self> {
        Box::new(RollerError::InvalidArgument {
            event_details,
            command_error: CommandError::new_from_safe_message(message.into()),
        })
    }

    pub fn upstream(event_details: EventDetails, command_error: CommandError) -> Box<Self> {
        Box::new(RollerError::UpstreamError {
            event_details,
            command_error,
        })
    }

    pub fn not_found(event_details: EventDetails, message: impl Into<String>) -> Box<Self> {
        Box::new(RollerError::NotFound {
            event_details,
            command_error: CommandError::new_from_safe_message(message.into()),
        })
    }

    pub fn consistency(event_details: EventDetails, message: impl Into<String>) -> Box<Self> {
        Box::new(RollerError::ConsistencyError {
            event_details,
            command_error: CommandError::new_from_safe_message(message.into()),
        })
    }

    pub fn health_prerequisite(event_details: EventDetails, message: impl Into<String>) -> Box<Self> {
        Box::new(RollerError::HealthPrerequisite {
            event_details,
            command_error: CommandError::new_from_safe_message(message.into()),
        })
    }

    pub fn replacement_timeout(event_details: EventDetails, message: impl Into<String>) -> Box<Self> {
        Box::new(RollerError::ReplacementTimeout {
            event_details,
            command_error: CommandError::new_from_safe_message(message.into()),
        })
    }

    pub fn verify_timeout(event_details: EventDetails, message: impl Into<String>) -> Box<Self> {
        Box::new(RollerError::VerifyTimeout {
            event_details,
            command_error: CommandError::new_from_safe_message(message.into()),
        })
    }

    pub fn drain_timeout(event_details: EventDetails, message: impl Into<String>) -> Box<Self> {
        Box::new(RollerError::DrainTimeout {
            event_details,
            command_error: CommandError::new_from_safe_message(message.into()),
        })
    }

    pub fn fatal(message: impl Into<String>) -> Box<Self> {
        Box::new(RollerError::Fatal {
            command_error: CommandError::new_from_safe_message(message.into()),
        })
    }
}
