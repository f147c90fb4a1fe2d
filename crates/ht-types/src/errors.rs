use thiserror::Error;

/// Main error type for the Hypertune system
#[derive(Error, Debug)]
pub enum HtError {
    #[error("Invalid model: {reason}")]
    InvalidModel { reason: String },

    #[error("Duplicate configuration: {digest}")]
    DuplicateConfiguration { digest: String },

    #[error("Unknown parameters requested, call `update_space` first. Unknown: {names:?}")]
    UnknownParameter { names: Vec<String> },

    #[error("Search space exhausted after {attempts} attempts")]
    ExhaustedSearchSpace { attempts: usize },

    #[error("Oversized model: {size} parameters exceeds the limit of {limit}")]
    OversizedModel { size: u64, limit: u64 },

    #[error("Too many consecutive oversized models ({count})")]
    TooManyOversizedModels { count: usize },

    #[error("Multi-objective is not supported, found: {objectives}")]
    MultiObjectiveUnsupported { objectives: String },

    #[error("Trial not found: {trial_id}")]
    TrialNotFound { trial_id: String },

    #[error("Training error: {0}")]
    Training(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Remote storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl HtError {
    /// Errors the tuner loop absorbs and retries past.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidModel { .. }
                | Self::DuplicateConfiguration { .. }
                | Self::OversizedModel { .. }
                | Self::Training(_)
                | Self::Storage(_)
        )
    }

    /// Errors that end trial generation without failing the search.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::ExhaustedSearchSpace { .. })
    }
}

/// Result type alias for Hypertune operations
pub type HtResult<T> = Result<T, HtError>;

/// Helper trait for converting string errors
pub trait IntoHtError {
    fn into_ht_error(self) -> HtError;
}

impl IntoHtError for String {
    fn into_ht_error(self) -> HtError {
        HtError::Internal(self)
    }
}

impl IntoHtError for &str {
    fn into_ht_error(self) -> HtError {
        HtError::Internal(self.to_string())
    }
}

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::HtError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::HtError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::HtError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = HtError::OversizedModel {
            size: 1200,
            limit: 4,
        };

        assert!(error.to_string().contains("Oversized model"));
        assert!(error.to_string().contains("1200"));
        assert!(error.to_string().contains('4'));
    }

    #[test]
    fn test_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let ht_error: HtError = io_error.into();

        match ht_error {
            HtError::Io(_) => (),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_error_classification() {
        assert!(HtError::InvalidModel { reason: "bad".into() }.is_recoverable());
        assert!(HtError::OversizedModel { size: 10, limit: 1 }.is_recoverable());
        assert!(!HtError::TooManyOversizedModels { count: 5 }.is_recoverable());
        assert!(!HtError::UnknownParameter { names: vec!["x".into()] }.is_recoverable());
        assert!(HtError::ExhaustedSearchSpace { attempts: 3 }.is_exhaustion());
        assert!(!HtError::Config("x".into()).is_exhaustion());
    }

    #[test]
    fn test_macros() {
        let validation_err = validation_error!("Invalid value: {}", 42);
        assert!(matches!(validation_err, HtError::Validation(_)));
        let _internal_err = internal_error!("Something went wrong");
        let config_err = config_error!("Missing required field: {}", "objective");
        assert_eq!(
            config_err.to_string(),
            "Configuration error: Missing required field: objective"
        );
    }
}
