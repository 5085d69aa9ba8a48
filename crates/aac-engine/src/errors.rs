use aac_backend::BackendError;
use aac_surrogate::SurrogateError;
use aac_types::{ConfigId, SpaceError};
use thiserror::Error;

/// Main error type of a tuning run. Only fatal and backend errors reach the
/// caller; data problems are handled where they are detected.
#[derive(Error, Debug)]
pub enum TunerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Surrogate error: {0}")]
    Surrogate(#[from] SurrogateError),

    #[error("Parameter space error: {0}")]
    Space(#[from] SpaceError),

    #[error("Experiment has no benchmark instances")]
    NoInstances,

    #[error("Invalid initial incumbent {config_id}: {reason}")]
    InvalidIncumbent { config_id: ConfigId, reason: String },

    #[error("Unknown {kind} strategy: {name}")]
    UnknownStrategy { kind: &'static str, name: String },

    #[error("Unknown candidate: {0}")]
    UnknownCandidate(ConfigId),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for tuning operations
pub type TunerResult<T> = Result<T, TunerError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::errors::TunerError::Config(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::errors::TunerError::Internal(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let backend_error = BackendError::ConfigNotFound {
            config_id: ConfigId(4),
        };
        let err: TunerError = backend_error.into();
        match err {
            TunerError::Backend(_) => (),
            _ => panic!("Expected Backend error"),
        }
    }

    #[test]
    fn test_macros() {
        let err = config_error!("min_runs must be positive, got {}", 0);
        assert!(err.to_string().contains("min_runs"));
        let err = internal_error!("candidate {} vanished", 3);
        assert!(matches!(err, TunerError::Internal(_)));
    }
}
