//! Retry classification for failed calls.
//!
//! [`classify`] is a pure function of an error's name and message. It performs
//! no I/O and keeps no state; callers layer their own retry policy on top.

use crate::error::{ErrorDescriptor, ErrorKind};

/// Suggested follow-up for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    /// Re-issue after a short delay.
    RetryAfterBackoff,
    /// The link dropped; re-issue once a connection is back.
    Reconnect,
    /// No instance was eligible; wait for one to start.
    WaitForCapacity,
    /// Key material is out of sync; retrying will not help.
    RotateKeys,
    /// The request itself is wrong.
    FixRequest,
}

/// Verdict for one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub retryable: bool,
    pub remediation: Option<Remediation>,
}

impl Classification {
    const fn retry(remediation: Remediation) -> Self {
        Self {
            retryable: true,
            remediation: Some(remediation),
        }
    }

    const fn fatal(remediation: Option<Remediation>) -> Self {
        Self {
            retryable: false,
            remediation,
        }
    }
}

/// Pluggable classifier. Implementations must be deterministic.
pub trait RetryPredictor: Send + Sync {
    fn classify(&self, name: &str, message: &str) -> Classification;
}

// Runtime kinds, matched on the descriptor name.
const NAME_RULES: &[(ErrorKind, Classification)] = &[
    (ErrorKind::Transport, Classification::retry(Remediation::Reconnect)),
    (ErrorKind::Routing, Classification::retry(Remediation::WaitForCapacity)),
    (ErrorKind::Timeout, Classification::retry(Remediation::RetryAfterBackoff)),
    (ErrorKind::Decryption, Classification::fatal(Some(Remediation::RotateKeys))),
    (ErrorKind::Codec, Classification::fatal(Some(Remediation::FixRequest))),
    (ErrorKind::Auth, Classification::fatal(None)),
    (ErrorKind::Config, Classification::fatal(None)),
    (ErrorKind::Cancelled, Classification::fatal(None)),
    (ErrorKind::Internal, Classification::fatal(None)),
];

// Application errors, matched case-insensitively on the message.
const MESSAGE_RULES: &[(&str, Classification)] = &[
    ("connection reset", Classification::retry(Remediation::Reconnect)),
    ("connection refused", Classification::retry(Remediation::Reconnect)),
    ("broken pipe", Classification::retry(Remediation::Reconnect)),
    ("temporarily unavailable", Classification::retry(Remediation::RetryAfterBackoff)),
    ("try again", Classification::retry(Remediation::RetryAfterBackoff)),
    ("timed out", Classification::retry(Remediation::RetryAfterBackoff)),
    ("rate limit", Classification::retry(Remediation::RetryAfterBackoff)),
    ("too many requests", Classification::retry(Remediation::RetryAfterBackoff)),
    ("invalid argument", Classification::fatal(Some(Remediation::FixRequest))),
];

/// Table-driven default predictor.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternClassifier;

impl RetryPredictor for PatternClassifier {
    fn classify(&self, name: &str, message: &str) -> Classification {
        if let Some(kind) = ErrorKind::from_name(name) {
            return NAME_RULES
                .iter()
                .find(|(k, _)| *k == kind)
                .map(|(_, c)| *c)
                .unwrap_or(Classification::fatal(None));
        }
        let message = message.to_ascii_lowercase();
        MESSAGE_RULES
            .iter()
            .find(|(pattern, _)| message.contains(pattern))
            .map(|(_, c)| *c)
            .unwrap_or(Classification::fatal(None))
    }
}

/// Classify with the default pattern table.
pub fn classify(desc: &ErrorDescriptor) -> Classification {
    PatternClassifier.classify(&desc.name, &desc.message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_kinds() {
        let c = classify(&ErrorDescriptor::runtime(ErrorKind::Transport, "link closed"));
        assert!(c.retryable);
        assert_eq!(c.remediation, Some(Remediation::Reconnect));

        assert!(classify(&ErrorDescriptor::runtime(ErrorKind::Routing, "none")).retryable);
        assert!(classify(&ErrorDescriptor::runtime(ErrorKind::Timeout, "30s")).retryable);

        let c = classify(&ErrorDescriptor::runtime(ErrorKind::Decryption, "no key"));
        assert!(!c.retryable);
        assert_eq!(c.remediation, Some(Remediation::RotateKeys));
    }

    #[test]
    fn runtime_name_wins_over_message() {
        // a decryption failure stays fatal even if its message looks transient
        let c = classify(&ErrorDescriptor::runtime(ErrorKind::Decryption, "try again"));
        assert!(!c.retryable);
    }

    #[test]
    fn application_messages() {
        assert!(classify(&ErrorDescriptor::new("DbError", "Connection reset by peer")).retryable);
        assert!(!classify(&ErrorDescriptor::new("NotFound", "no such user")).retryable);
        let c = classify(&ErrorDescriptor::new("ValueError", "invalid argument: x"));
        assert_eq!(c.remediation, Some(Remediation::FixRequest));
    }

    #[test]
    fn deterministic() {
        let d = ErrorDescriptor::new("Flaky", "service temporarily unavailable");
        assert_eq!(classify(&d), classify(&d));
    }
}
