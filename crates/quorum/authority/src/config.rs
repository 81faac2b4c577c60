//! Authorization limits

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default maximum nesting of delegated permissions.
pub const DEFAULT_MAX_AUTHORITY_DEPTH: u16 = 6;

/// Default maximum transaction delay: 45 days.
pub const DEFAULT_MAX_TRANSACTION_DELAY_SECS: u32 = 45 * 24 * 3600;

/// Chain-wide authorization limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    /// Maximum depth of permission delegation the checker follows
    pub max_authority_depth: u16,
    /// Delays at or above this are treated as unbounded
    pub max_transaction_delay_secs: u32,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            max_authority_depth: DEFAULT_MAX_AUTHORITY_DEPTH,
            max_transaction_delay_secs: DEFAULT_MAX_TRANSACTION_DELAY_SECS,
        }
    }
}

impl AuthorizationConfig {
    /// Maximum transaction delay as a duration.
    pub fn max_transaction_delay(&self) -> Duration {
        Duration::from_secs(u64::from(self.max_transaction_delay_secs))
    }

    /// Clamp a provided delay: anything at or past the maximum satisfies every wait.
    pub fn effective_delay(&self, provided_delay: Duration) -> Duration {
        if provided_delay >= self.max_transaction_delay() {
            Duration::MAX
        } else {
            provided_delay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_delay_saturates() {
        let config = AuthorizationConfig::default();
        assert_eq!(config.effective_delay(Duration::from_secs(10)), Duration::from_secs(10));
        assert_eq!(config.effective_delay(config.max_transaction_delay()), Duration::MAX);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AuthorizationConfig =
            serde_json::from_str(r#"{"max_authority_depth": 3}"#).unwrap();
        assert_eq!(config.max_authority_depth, 3);
        assert_eq!(config.max_transaction_delay_secs, DEFAULT_MAX_TRANSACTION_DELAY_SECS);
    }
}
