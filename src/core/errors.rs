use std::fmt;
use thiserror::Error;

/// Unified error type for the conveyor engine.
///
/// Task-level failures are not represented here: a task function that fails
/// is recorded in the registry as `TaskStatus::Error` and never surfaces as an
/// `Err` from the executor API. See [`crate::TaskFailure`].
#[derive(Debug, Error)]
pub enum ConveyorError {
    /// Configuration errors (unknown mode strings, invalid sizes)
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Argument binding errors detected before a task runs
    #[error("Binding failed for {function}: {message}")]
    Binding {
        function: String,
        message: String,
        parameter: Option<String>,
    },

    /// Lifecycle misuse (submitting after start, binding context twice, ...)
    #[error("Registration error: {message}")]
    Registration { message: String },

    /// A function reference that no registered task function answers to
    #[error("Task function not registered: {name}")]
    FunctionNotFound { name: String },

    /// Filesystem and pipe errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Wire protocol errors between parent and worker processes
    #[error("IPC error: {message}")]
    Ipc { message: String },

    /// Worker process management errors
    #[error("Worker error: {worker} - {message}")]
    Worker { worker: String, message: String },

    /// Stage queue errors
    #[error("Channel error: {channel} - {message}")]
    Channel {
        channel: String,
        message: String,
        operation: Option<String>,
    },

    /// Report export errors
    #[error("Report error: {message}")]
    Report { message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ConveyorError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
            expected: None,
            actual: None,
        }
    }

    /// Create a configuration error naming the offending field and value
    pub fn configuration_field<S, F, E, A>(message: S, field: F, expected: E, actual: A) -> Self
    where
        S: Into<String>,
        F: Into<String>,
        E: Into<String>,
        A: Into<String>,
    {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
            expected: Some(expected.into()),
            actual: Some(actual.into()),
        }
    }

    /// Create a binding error
    pub fn binding<F: Into<String>, M: Into<String>>(function: F, message: M) -> Self {
        Self::Binding {
            function: function.into(),
            message: message.into(),
            parameter: None,
        }
    }

    /// Create a binding error for a specific parameter
    pub fn binding_param<F, M, P>(function: F, message: M, parameter: P) -> Self
    where
        F: Into<String>,
        M: Into<String>,
        P: Into<String>,
    {
        Self::Binding {
            function: function.into(),
            message: message.into(),
            parameter: Some(parameter.into()),
        }
    }

    /// Create a registration (lifecycle) error
    pub fn registration<S: Into<String>>(message: S) -> Self {
        Self::Registration {
            message: message.into(),
        }
    }

    /// Create a function-not-found error
    pub fn function_not_found<S: Into<String>>(name: S) -> Self {
        Self::FunctionNotFound { name: name.into() }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an IPC error
    pub fn ipc<S: Into<String>>(message: S) -> Self {
        Self::Ipc {
            message: message.into(),
        }
    }

    /// Create a worker error
    pub fn worker<W: Into<String>, M: Into<String>>(worker: W, message: M) -> Self {
        Self::Worker {
            worker: worker.into(),
            message: message.into(),
        }
    }

    /// Create a channel error
    pub fn channel<S: Into<String>, M: Into<String>>(channel: S, message: M) -> Self {
        Self::Channel {
            channel: channel.into(),
            message: message.into(),
            operation: None,
        }
    }

    /// Create a report error
    pub fn report<S: Into<String>>(message: S) -> Self {
        Self::Report {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Binding { .. } => "binding",
            Self::Registration { .. } => "registration",
            Self::FunctionNotFound { .. } => "function",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Ipc { .. } => "ipc",
            Self::Worker { .. } => "worker",
            Self::Channel { .. } => "channel",
            Self::Report { .. } => "report",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ConveyorError>;

impl From<std::io::Error> for ConveyorError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for ConveyorError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for ConveyorError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<csv::Error> for ConveyorError {
    fn from(err: csv::Error) -> Self {
        Self::serialization("csv", err)
    }
}

/// Marker used in log lines so operators can grep for a failing subsystem
pub struct Category<'a>(pub &'a ConveyorError);

impl fmt::Display for Category<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.category(), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ConveyorError::configuration("bad mode");
        assert!(matches!(err, ConveyorError::Configuration { .. }));
        assert_eq!(err.category(), "configuration");
    }

    #[test]
    fn test_binding_error_carries_parameter() {
        let err = ConveyorError::binding_param("math::add", "bound twice", "x");
        if let ConveyorError::Binding { parameter, .. } = &err {
            assert_eq!(parameter.as_deref(), Some("x"));
        } else {
            panic!("Expected binding error");
        }
        assert_eq!(err.to_string(), "Binding failed for math::add: bound twice");
    }

    #[test]
    fn test_category_display() {
        let err = ConveyorError::function_not_found("missing::fn");
        assert_eq!(
            Category(&err).to_string(),
            "[function] Task function not registered: missing::fn"
        );
    }
}
