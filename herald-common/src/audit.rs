//! Audit logging for work item lifecycle events
//!
//! Structured events for compliance and operator review, emitted through
//! `tracing` with an `event` field naming the lifecycle step.
//!
//! ## Audit Events
//!
//! - `MessageEnqueued`: a producer stored a mail item
//! - `DeliveryAttempt`: the delivery worker recorded an attempt outcome
//! - `MessagePromoted`: an operator moved a deferred item back into a tier
//! - `AddressSuppressed`: an address was added to the suppression list
//!
//! ## PII Redaction
//!
//! Sender and recipient addresses can be redacted through `AuditConfig`.

use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

/// Audit logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditConfig {
    /// Enable audit logging for lifecycle events
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Redact sender addresses
    #[serde(default)]
    pub redact_sender: bool,

    /// Redact recipient addresses
    #[serde(default)]
    pub redact_recipients: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact_sender: false,
            redact_recipients: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

static AUDIT_CONFIG: OnceLock<Arc<AuditConfig>> = OnceLock::new();

/// Initialize audit logging with configuration. Later calls are ignored.
pub fn init(config: AuditConfig) {
    AUDIT_CONFIG.get_or_init(|| Arc::new(config));
}

/// Get the current audit configuration
#[must_use]
pub fn config() -> Arc<AuditConfig> {
    AUDIT_CONFIG
        .get()
        .cloned()
        .unwrap_or_else(|| Arc::new(AuditConfig::default()))
}

/// Redact the local part of an address if redaction is enabled
#[must_use]
pub fn redact_email(email: &str, redact: bool) -> String {
    if !redact {
        return email.to_string();
    }

    email
        .split_once('@')
        .map_or_else(|| "[REDACTED]".to_string(), |(_, domain)| format!("[REDACTED]@{domain}"))
}

/// Log a stored mail item.
pub fn log_enqueued(item_id: &str, sender: &str, recipient: &str, priority: &str) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::INFO,
        event = "MessageEnqueued",
        item_id = %item_id,
        sender = %redact_email(sender, config.redact_sender),
        recipient = %redact_email(recipient, config.redact_recipients),
        priority = %priority,
        "Audit: Message enqueued"
    );
}

/// Log the outcome of one delivery attempt.
///
/// `result` is one of `Success`, `Suppressed` or `Failure`; `detail` carries
/// the transport's explanation for failures.
pub fn log_attempt(item_id: &str, recipient: &str, result: &str, detail: &str) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::INFO,
        event = "DeliveryAttempt",
        item_id = %item_id,
        recipient = %redact_email(recipient, config.redact_recipients),
        result = %result,
        detail = %detail,
        "Audit: Delivery attempt"
    );
}

pub fn log_promoted(item_id: &str, priority: &str) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::INFO,
        event = "MessagePromoted",
        item_id = %item_id,
        priority = %priority,
        "Audit: Deferred message promoted"
    );
}

pub fn log_suppressed(address: &str) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::WARN,
        event = "AddressSuppressed",
        address = %redact_email(address, config.redact_recipients),
        "Audit: Address added to suppression list"
    );
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_redact_email() {
        assert_eq!(
            redact_email("user@example.com", true),
            "[REDACTED]@example.com"
        );
        assert_eq!(redact_email("user@example.com", false), "user@example.com");
        assert_eq!(redact_email("invalid", true), "[REDACTED]");
        assert_eq!(redact_email("invalid", false), "invalid");
    }

    #[test]
    fn test_default_config() {
        let config = AuditConfig::default();
        assert!(config.enabled);
        assert!(!config.redact_sender);
        assert!(!config.redact_recipients);
    }

    #[test]
    fn test_audit_disabled() {
        init(AuditConfig {
            enabled: false,
            redact_sender: false,
            redact_recipients: false,
        });

        log_enqueued("id", "from@example.com", "to@example.com", "medium");
        log_attempt("id", "to@example.com", "Failure", "connection refused");
        log_promoted("id", "high");
        log_suppressed("bounce@example.com");
    }
}
