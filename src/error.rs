use crate::error_kind::ErrorKind;
use std::time::Duration;
use thiserror::Error;

/// Structured error context for provider calls and runtime failures.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Provider operation that failed (e.g., "start_instance")
    pub operation: Option<String>,
    /// Resource the operation targeted (image id, instance id, subscription id)
    pub resource: Option<String>,
    /// Component that raised the error (e.g., "throttler", "reconciler", "config")
    pub source: Option<String>,
    /// Free-form details (provider error code, expected value, ...)
    pub details: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Unified error type for the provisioning runtime.
///
/// Provider failures are split along the lines the throttler cares about (retry or not),
/// the remaining variants cover local misuse and teardown.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Transient provider error: {message}{}", format_context(.context))]
    Transient {
        message: String,
        context: ErrorContext,
        /// Provider-requested backoff, if it sent one.
        retry_after: Option<Duration>,
    },

    #[error("Task timed out after {} ms{}", millis(.timeout), format_context(.context))]
    Timeout {
        timeout: Duration,
        context: ErrorContext,
    },

    #[error("Quota exceeded: {message}{}", format_context(.context))]
    Quota {
        message: String,
        context: ErrorContext,
    },

    #[error("Fatal provider error: {message}{}", format_context(.context))]
    Fatal {
        message: String,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Disposed: {0}")]
    Disposed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),
}

fn millis(d: &Duration) -> u128 {
    d.as_millis()
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref op) = ctx.operation {
        parts.push(format!("operation: {}", op));
    }
    if let Some(ref resource) = ctx.resource {
        parts.push(format!("resource: {}", resource));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient {
            message: msg.into(),
            context: ErrorContext::new(),
            retry_after: None,
        }
    }

    /// Transient failure carrying the provider's backoff hint.
    pub fn throttled(msg: impl Into<String>, retry_after: Duration) -> Self {
        Error::Transient {
            message: msg.into(),
            context: ErrorContext::new(),
            retry_after: Some(retry_after),
        }
    }

    pub fn timeout(timeout: Duration) -> Self {
        Error::Timeout {
            timeout,
            context: ErrorContext::new(),
        }
    }

    pub fn quota(msg: impl Into<String>) -> Self {
        Error::Quota {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    /// Builds an error of the given kind, used by connectors after classifying a provider reply.
    pub fn from_kind(kind: ErrorKind, msg: impl Into<String>) -> Self {
        match kind {
            ErrorKind::Transient => Error::transient(msg),
            ErrorKind::Timeout => Error::Timeout {
                timeout: Duration::ZERO,
                context: ErrorContext::new().with_details(msg.into()),
            },
            ErrorKind::Quota => Error::quota(msg),
            ErrorKind::Fatal => Error::fatal(msg),
        }
    }

    /// Attaches context to variants that carry one; other variants are returned unchanged.
    pub fn with_context(mut self, ctx: ErrorContext) -> Self {
        match &mut self {
            Error::Transient { context, .. }
            | Error::Timeout { context, .. }
            | Error::Quota { context, .. }
            | Error::Fatal { context, .. }
            | Error::Configuration { context, .. } => *context = ctx,
            _ => {}
        }
        self
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Transient { context, .. }
            | Error::Timeout { context, .. }
            | Error::Quota { context, .. }
            | Error::Fatal { context, .. }
            | Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Classification used by the retry policy and the error provider.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transient { .. } => ErrorKind::Transient,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Quota { .. } => ErrorKind::Quota,
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().retryable()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
