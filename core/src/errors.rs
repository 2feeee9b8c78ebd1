/// Error types for the Herald notification engine.
use thiserror::Error;

/// Core error type for dispatch and template operations.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("template not found: {code}:{channel}:{locale}")]
    TemplateNotFound {
        code: String,
        channel: String,
        locale: String,
    },

    #[error("template schema missing required fields: {}", missing.join(", "))]
    SchemaError { missing: Vec<String> },

    #[error("template rendering failed: {0}")]
    RenderFailed(String),

    #[error("no adapter registered for route: {0}")]
    AdapterNotFound(String),

    #[error("delivery failed via {adapter}: {reason}")]
    DeliveryFailed { adapter: String, reason: String },

    #[error("{failed} of {total} deliveries failed: {}", errors.join("; "))]
    DeliveryAggregate {
        failed: usize,
        total: usize,
        errors: Vec<String>,
    },

    #[error("link builder error: {0}")]
    BuilderError(String),

    #[error("secret not resolved for {0}")]
    SecretUnavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    ConfigError(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DispatchError {
    /// Convenience constructor for the `not_found` sentinel.
    pub fn not_found(what: impl Into<String>) -> Self {
        DispatchError::NotFound(what.into())
    }

    /// True for any lookup-miss variant. Stores propagate these verbatim;
    /// callers that treat a miss as "absent" match on this.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DispatchError::NotFound(_)
                | DispatchError::DefinitionNotFound(_)
                | DispatchError::TemplateNotFound { .. }
        )
    }

    /// True when the error came from the ambient context being cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DispatchError::Cancelled)
    }
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_matching() {
        assert!(DispatchError::not_found("definition welcome").is_not_found());
        assert!(DispatchError::DefinitionNotFound("welcome".into()).is_not_found());
        assert!(DispatchError::TemplateNotFound {
            code: "welcome".into(),
            channel: "email".into(),
            locale: "en".into(),
        }
        .is_not_found());
        assert!(!DispatchError::Cancelled.is_not_found());
    }

    #[test]
    fn schema_error_lists_missing_fields() {
        let err = DispatchError::SchemaError {
            missing: vec!["user.name".into(), "amount".into()],
        };
        let text = err.to_string();
        assert!(text.contains("user.name"));
        assert!(text.contains("amount"));
    }
}
