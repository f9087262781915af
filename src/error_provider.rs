//! Session error state reported to the orchestration host.
//!
//! The cloud client keeps at most one [`ErrorRecord`] per [`ErrorKind`]. Every update
//! replaces the whole set: a kind missing from the update is considered resolved and
//! cleared. The host reads a single [`ErrorInfo`] summary.

use crate::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Message used when more than one kind of error is active.
pub const DEFAULT_ERROR_MESSAGE: &str = "Unable to initialize cloud client. See details";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Unix milliseconds; records without one are ordered by position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<u64>,
}

impl ErrorRecord {
    /// A record stamped with the current time.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            timestamp_ms: Some(now_ms()),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_timestamp_ms(mut self, timestamp_ms: Option<u64>) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Whether `self` should replace `other` of the same kind.
    fn supersedes(&self, other: &ErrorRecord) -> bool {
        match (self.timestamp_ms, other.timestamp_ms) {
            (Some(new), Some(old)) => new >= old,
            _ => true,
        }
    }
}

impl From<&Error> for ErrorRecord {
    fn from(err: &Error) -> Self {
        let record = ErrorRecord::new(err.kind(), err.to_string());
        match err.context().and_then(|c| c.resource.clone()) {
            Some(resource) => record.with_details(format!("resource: {}", resource)),
            None => record,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// What the host displays for the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

pub trait UpdatableErrorProvider: Send + Sync {
    /// Replaces the active error set with `errors`, newest record per kind.
    fn update_errors(&self, errors: Vec<ErrorRecord>);

    /// `None` while no error is active.
    fn error_info(&self) -> Option<ErrorInfo>;
}

/// Error set keyed by kind.
#[derive(Debug)]
pub struct CloudErrorMap {
    default_message: String,
    errors: RwLock<BTreeMap<ErrorKind, ErrorRecord>>,
}

impl Default for CloudErrorMap {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_MESSAGE)
    }
}

impl CloudErrorMap {
    pub fn new(default_message: impl Into<String>) -> Self {
        Self {
            default_message: default_message.into(),
            errors: RwLock::new(BTreeMap::new()),
        }
    }

    /// Adds one record without touching other kinds.
    pub fn record(&self, record: ErrorRecord) {
        let mut errors = self.errors.write().unwrap_or_else(PoisonError::into_inner);
        merge(&mut errors, record);
    }

    pub fn clear(&self, kind: ErrorKind) -> Option<ErrorRecord> {
        self.errors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind)
    }

    pub fn clear_all(&self) {
        self.errors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn has_errors(&self) -> bool {
        !self
            .errors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

fn merge(errors: &mut BTreeMap<ErrorKind, ErrorRecord>, record: ErrorRecord) {
    match errors.get(&record.kind) {
        Some(existing) if !record.supersedes(existing) => {}
        _ => {
            errors.insert(record.kind, record);
        }
    }
}

impl UpdatableErrorProvider for CloudErrorMap {
    fn update_errors(&self, errors: Vec<ErrorRecord>) {
        let mut next = BTreeMap::new();
        for record in errors {
            merge(&mut next, record);
        }
        *self.errors.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn error_info(&self) -> Option<ErrorInfo> {
        let errors = self.errors.read().unwrap_or_else(PoisonError::into_inner);
        let mut records = errors.values();
        match (records.next(), records.next()) {
            (None, _) => None,
            (Some(only), None) => Some(ErrorInfo {
                message: only.message.clone(),
                details: only.details.clone(),
            }),
            _ => Some(ErrorInfo {
                message: self.default_message.clone(),
                details: Some(
                    errors
                        .values()
                        .map(|r| format!("[{}] {}: {}", r.kind.code(), r.kind.name(), r.message))
                        .collect::<Vec<_>>()
                        .join("\n"),
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorContext;

    #[test]
    fn empty_map_has_no_info() {
        let map = CloudErrorMap::default();
        assert!(map.error_info().is_none());
        assert!(!map.has_errors());
    }

    #[test]
    fn single_error_is_reported_verbatim() {
        let map = CloudErrorMap::default();
        map.update_errors(vec![
            ErrorRecord::new(ErrorKind::Quota, "cores exhausted").with_details("region westeurope")
        ]);
        assert_eq!(
            map.error_info(),
            Some(ErrorInfo {
                message: "cores exhausted".into(),
                details: Some("region westeurope".into()),
            })
        );
    }

    #[test]
    fn newest_record_per_kind_wins() {
        let map = CloudErrorMap::default();
        map.update_errors(vec![
            ErrorRecord::new(ErrorKind::Fatal, "new").with_timestamp_ms(Some(20)),
            ErrorRecord::new(ErrorKind::Fatal, "old").with_timestamp_ms(Some(10)),
        ]);
        assert_eq!(map.errors().len(), 1);
        assert_eq!(map.errors()[0].message, "new");

        map.record(ErrorRecord::new(ErrorKind::Fatal, "stale").with_timestamp_ms(Some(5)));
        assert_eq!(map.errors()[0].message, "new");
        map.record(ErrorRecord::new(ErrorKind::Fatal, "untimed").with_timestamp_ms(None));
        assert_eq!(map.errors()[0].message, "untimed");
    }

    #[test]
    fn update_clears_resolved_kinds() {
        let map = CloudErrorMap::default();
        map.update_errors(vec![
            ErrorRecord::new(ErrorKind::Fatal, "auth failed"),
            ErrorRecord::new(ErrorKind::Timeout, "slow"),
        ]);
        let info = map.error_info().unwrap();
        assert_eq!(info.message, DEFAULT_ERROR_MESSAGE);
        let details = info.details.unwrap();
        assert!(details.contains("E9001"));
        assert!(details.contains("slow"));

        map.update_errors(vec![ErrorRecord::new(ErrorKind::Timeout, "slow")]);
        assert_eq!(map.error_info().unwrap().message, "slow");

        map.update_errors(Vec::new());
        assert!(map.error_info().is_none());
    }

    #[test]
    fn record_from_error_keeps_resource() {
        let err = Error::fatal("listing failed")
            .with_context(ErrorContext::new().with_resource("img-1"));
        let record = ErrorRecord::from(&err);
        assert_eq!(record.kind, ErrorKind::Fatal);
        assert_eq!(record.details.as_deref(), Some("resource: img-1"));
        assert!(record.timestamp_ms.is_some());
    }
}
