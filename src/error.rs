use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "resources./api/sessions.interval_ms", "payload.items")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "request_coordinator", "schema_validator")
    pub source: Option<String>,
    /// Endpoint the failing operation was working against
    pub endpoint: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
            endpoint: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the synchronization runtime.
///
/// `Clone` because a single in-flight fetch outcome is handed to every
/// deduplicated waiter of that fetch.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Network transport error: {message}{}", format_context(.context))]
    Transport {
        message: String,
        status: Option<u16>,
        context: ErrorContext,
    },

    #[error("Request to {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Circuit breaker open for {endpoint}, retry after {retry_after_ms}ms")]
    CircuitOpen { endpoint: String, retry_after_ms: u64 },

    #[error("Rate limit exceeded for {endpoint}, retry after {retry_after_ms}ms")]
    RateLimited { endpoint: String, retry_after_ms: u64 },

    #[error("Synchronization disabled by kill switch")]
    Disabled,

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if let Some(ref endpoint) = ctx.endpoint {
        parts.push(format!("endpoint: {}", endpoint));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new transport error with structured context
    pub fn transport_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Transport {
            message: msg.into(),
            status: None,
            context,
        }
    }

    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Transport { context, .. }
            | Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Transient failures are counted and retried on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::Timeout { .. })
    }

    /// Fast-fail errors that never reached the network.
    pub fn is_short_circuit(&self) -> bool {
        matches!(
            self,
            Error::CircuitOpen { .. } | Error::RateLimited { .. } | Error::Disabled
        )
    }

    /// Retry hint carried by fast-fail errors.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Error::CircuitOpen { retry_after_ms, .. } | Error::RateLimited { retry_after_ms, .. } => {
                Some(*retry_after_ms)
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::configuration_with_context(
            e.to_string(),
            ErrorContext::new().with_source("config_loader"),
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::runtime_with_context(e.to_string(), ErrorContext::new().with_source("io"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_formatting() {
        let err = Error::validation_with_context(
            "items must be an array",
            ErrorContext::new()
                .with_field_path("payload.items")
                .with_source("schema_validator"),
        );
        let msg = err.to_string();
        assert!(msg.contains("items must be an array"));
        assert!(msg.contains("field: payload.items"));
        assert!(msg.contains("source: schema_validator"));
    }

    #[test]
    fn test_retry_hints() {
        let err = Error::CircuitOpen {
            endpoint: "/api/sessions".into(),
            retry_after_ms: 1500,
        };
        assert!(err.is_short_circuit());
        assert!(!err.is_transient());
        assert_eq!(err.retry_after_ms(), Some(1500));

        let timeout = Error::Timeout {
            endpoint: "/api/sessions".into(),
            timeout_ms: 2000,
        };
        assert!(timeout.is_transient());
        assert_eq!(timeout.retry_after_ms(), None);
    }
}
