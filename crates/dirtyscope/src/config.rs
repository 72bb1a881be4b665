#![forbid(unsafe_code)]

//! Scope configuration.

/// Default digest iteration budget.
pub const DEFAULT_TTL: usize = 10;

/// Configuration for a [`Scope`](crate::Scope).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "json", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "json", serde(default))]
pub struct ScopeConfig {
    /// Number of dirty passes a digest may run before a further dirty pass
    /// aborts it with [`ScopeError::NonConvergence`](crate::ScopeError).
    /// Default: 10
    pub ttl: usize,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_TTL }
    }
}

impl ScopeConfig {
    /// Set the iteration budget.
    #[must_use]
    pub fn with_ttl(mut self, ttl: usize) -> Self {
        self.ttl = ttl;
        self
    }

    pub(crate) fn sanitized(&self) -> Self {
        let mut config = self.clone();
        if config.ttl == 0 {
            config.ttl = DEFAULT_TTL;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_budget_is_ten() {
        assert_eq!(ScopeConfig::default().ttl, 10);
    }

    #[test]
    fn zero_ttl_falls_back_to_default() {
        let config = ScopeConfig::default().with_ttl(0).sanitized();
        assert_eq!(config.ttl, DEFAULT_TTL);
        assert_eq!(ScopeConfig::default().with_ttl(3).sanitized().ttl, 3);
    }

    #[cfg(feature = "json")]
    #[test]
    fn deserializes_with_defaults() {
        let config: ScopeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ScopeConfig::default());
        let config: ScopeConfig = serde_json::from_str(r#"{"ttl": 4}"#).unwrap();
        assert_eq!(config.ttl, 4);
    }
}
