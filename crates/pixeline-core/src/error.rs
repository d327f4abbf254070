//! Terminal start-up error for external services

use std::time::Duration;

/// Raised when a connect-style operation cannot complete at start-up.
///
/// Propagates out of start-up; the worker never runs without its
/// dependencies.
#[derive(Debug)]
pub enum ConnectionError {
    /// Every attempt failed
    Exhausted {
        service: String,
        attempts: u32,
        last_error: String,
    },
    /// Shutdown was requested before a connection was established
    Cancelled { service: String, attempts: u32 },
}

impl ConnectionError {
    pub fn new(service: &str, attempts: u32, last_error: impl std::fmt::Display) -> Self {
        Self::Exhausted {
            service: service.to_string(),
            attempts,
            last_error: last_error.to_string(),
        }
    }

    pub fn cancelled(service: &str, attempts: u32) -> Self {
        Self::Cancelled {
            service: service.to_string(),
            attempts,
        }
    }

    pub fn service(&self) -> &str {
        match self {
            Self::Exhausted { service, .. } | Self::Cancelled { service, .. } => service,
        }
    }

    /// Attempts started before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted {
                service,
                attempts,
                last_error,
            } => write!(
                f,
                "failed to connect to {service} after {attempts} attempts: {last_error}"
            ),
            Self::Cancelled { service, .. } => {
                write!(f, "shutdown requested while connecting to {service}")
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Fixed-delay retry settings for connect-style operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 7,
            delay: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_service() {
        let err = ConnectionError::new("Redis", 3, "connection refused");
        let msg = format!("{err}");
        assert!(msg.contains("Redis"));
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("connection refused"));
        assert!(!err.is_cancelled());
    }

    #[test]
    fn cancelled_display() {
        let err = ConnectionError::cancelled("RabbitMQ", 0);
        assert!(err.is_cancelled());
        assert_eq!(err.service(), "RabbitMQ");
        assert_eq!(err.attempts(), 0);
        assert!(format!("{err}").contains("shutdown"));
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.delay, Duration::from_secs(10));
    }
}
