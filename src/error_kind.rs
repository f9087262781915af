//! Provider failure classification.
//!
//! Every failure that reaches the throttler or the cloud client is classified into one of
//! four kinds. The kind decides whether the throttler retries the task internally and whether
//! the failure is surfaced to the orchestration host through the error provider.
//!
//! | Code  | Kind        | Retried | Meaning                                          |
//! |-------|-------------|---------|--------------------------------------------------|
//! | E1001 | `transient` | yes     | Network blip or provider throttling              |
//! | E1002 | `timeout`   | no      | Task exceeded its deadline                       |
//! | E2001 | `quota`     | no      | Provider rejected the call due to account limits |
//! | E9001 | `fatal`     | no      | Unexpected or unclassified failure               |
//!
//! ## Example
//!
//! ```rust
//! use cloud_provisioner::error_kind::ErrorKind;
//!
//! let kind = ErrorKind::from_provider_code("TooManyRequests").unwrap();
//! assert_eq!(kind, ErrorKind::Transient);
//! assert!(kind.retryable());
//! assert_eq!(ErrorKind::from_http_status(403), ErrorKind::Fatal);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a provider or runtime failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// E1001: network blip or provider-side throttling
    Transient,
    /// E1002: the task did not complete before its deadline
    Timeout,
    /// E2001: account or subscription limits reached
    Quota,
    /// E9001: anything the connector could not classify
    Fatal,
}

impl ErrorKind {
    /// Returns the stable code string (e.g., `"E1001"`).
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transient => "E1001",
            Self::Timeout => "E1002",
            Self::Quota => "E2001",
            Self::Fatal => "E9001",
        }
    }

    /// Returns the snake_case name used in logs and serialized error records.
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::Quota => "quota",
            Self::Fatal => "fatal",
        }
    }

    /// Only transient failures are retried by the throttler.
    ///
    /// Timeouts are terminal: a mutating call that timed out may still land on the provider,
    /// and replaying it would duplicate the side effect.
    #[inline]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Maps a provider error code to a kind.
    ///
    /// Accepts the kind names themselves plus the error codes commonly returned by cloud
    /// management APIs (`TooManyRequests`, `QuotaExceeded`, ...).
    pub fn from_provider_code(provider_code: &str) -> Option<Self> {
        let kind = match provider_code {
            "transient" | "TooManyRequests" | "RetryableError" | "ServerBusy"
            | "ServiceUnavailable" | "InternalServerError" | "NetworkError" => Self::Transient,
            "timeout" | "GatewayTimeout" | "OperationTimedOut" | "RequestTimeout" => {
                Self::Timeout
            }
            "quota" | "QuotaExceeded" | "OperationNotAllowed" | "SkuNotAvailable"
            | "SubscriptionLimitReached" => Self::Quota,
            "fatal" | "AuthorizationFailed" | "InvalidAuthenticationToken" | "ResourceNotFound"
            | "InvalidParameter" => Self::Fatal,
            _ => return None,
        };
        Some(kind)
    }

    /// Maps a provider error code to a kind, defaulting to [`ErrorKind::Fatal`].
    pub fn from_error_class(error_class: &str) -> Self {
        Self::from_provider_code(error_class).unwrap_or(Self::Fatal)
    }

    /// Maps an HTTP status returned by the provider to the most likely kind.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            408 | 504 => Self::Timeout,
            409 => Self::Quota,
            429 | 500 | 502 | 503 => Self::Transient,
            _ => Self::Fatal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(ErrorKind::Transient.retryable());
        assert!(!ErrorKind::Timeout.retryable());
        assert!(!ErrorKind::Quota.retryable());
        assert!(!ErrorKind::Fatal.retryable());
    }

    #[test]
    fn provider_codes_map_to_kinds() {
        assert_eq!(
            ErrorKind::from_provider_code("TooManyRequests"),
            Some(ErrorKind::Transient)
        );
        assert_eq!(
            ErrorKind::from_provider_code("QuotaExceeded"),
            Some(ErrorKind::Quota)
        );
        assert_eq!(
            ErrorKind::from_provider_code("GatewayTimeout"),
            Some(ErrorKind::Timeout)
        );
        assert_eq!(ErrorKind::from_provider_code("SomethingElse"), None);
        assert_eq!(ErrorKind::from_error_class("SomethingElse"), ErrorKind::Fatal);
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(ErrorKind::from_http_status(429), ErrorKind::Transient);
        assert_eq!(ErrorKind::from_http_status(503), ErrorKind::Transient);
        assert_eq!(ErrorKind::from_http_status(504), ErrorKind::Timeout);
        assert_eq!(ErrorKind::from_http_status(409), ErrorKind::Quota);
        assert_eq!(ErrorKind::from_http_status(401), ErrorKind::Fatal);
    }

    #[test]
    fn codes_and_names_are_stable() {
        assert_eq!(ErrorKind::Quota.code(), "E2001");
        assert_eq!(ErrorKind::Timeout.to_string(), "timeout");
        assert_eq!(
            serde_json::to_string(&ErrorKind::Transient).unwrap(),
            "\"transient\""
        );
    }
}
