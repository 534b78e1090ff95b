use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::error::HttpError;
use dashmap::DashMap;
use std::sync::Arc;

/// Named circuit breakers shared by every client built on the same registry.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose breakers fall back to `config` when created without one.
    #[must_use]
    pub fn with_default_config(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config: config,
        }
    }

    #[must_use]
    pub fn default_config(&self) -> &CircuitBreakerConfig {
        &self.default_config
    }

    /// Breaker called `name`, created on first use.
    ///
    /// `config` only applies when the breaker does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns a `validation` error when the breaker has to be created and
    /// its configuration is out of range. Nothing is registered in that case.
    pub fn get_or_create(
        &self,
        name: &str,
        config: Option<&CircuitBreakerConfig>,
    ) -> Result<Arc<CircuitBreaker>, HttpError> {
        if let Some(existing) = self.breakers.get(name) {
            return Ok(Arc::clone(existing.value()));
        }
        let config = config.unwrap_or(&self.default_config);
        config.validate()?;
        let entry = self.breakers.entry(name.to_owned()).or_insert_with(|| {
            tracing::debug!(breaker = name, "creating circuit breaker");
            Arc::new(CircuitBreaker::new(name, config.clone()))
        });
        Ok(Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(name).map(|(_, breaker)| breaker)
    }

    /// Breaker names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|b| b.key().clone()).collect();
        names.sort();
        names
    }

    pub fn reset_all(&self) {
        for breaker in &self.breakers {
            breaker.reset();
        }
    }

    /// Stats for every breaker, sorted by name.
    #[must_use]
    pub fn stats(&self) -> Vec<(String, CircuitBreakerStats)> {
        let mut stats: Vec<_> = self
            .breakers
            .iter()
            .map(|b| (b.key().clone(), b.stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::resilience::CircuitState;
    use std::time::Duration;

    #[test]
    fn test_same_name_same_breaker() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.get_or_create("GET https://api.example.com/users", None).unwrap();
        let b = registry.get_or_create("GET https://api.example.com/users", None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_config_applies_on_creation_only() {
        let registry = CircuitBreakerRegistry::with_default_config(CircuitBreakerConfig {
            reset_timeout: Duration::from_secs(5),
            ..CircuitBreakerConfig::default()
        });
        let custom = CircuitBreakerConfig {
            reset_timeout: Duration::from_secs(1),
            ..CircuitBreakerConfig::default()
        };

        let defaulted = registry.get_or_create("a", None).unwrap();
        assert_eq!(defaulted.config().reset_timeout, Duration::from_secs(5));

        let first = registry.get_or_create("b", Some(&custom)).unwrap();
        let again = registry.get_or_create("b", None).unwrap();
        assert_eq!(first.config().reset_timeout, Duration::from_secs(1));
        assert_eq!(again.config().reset_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_names_reset_and_remove() {
        let registry = CircuitBreakerRegistry::new();
        registry.get_or_create("b", None).unwrap().force_open();
        registry.get_or_create("a", None).unwrap();

        assert_eq!(registry.names(), vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(registry.stats()[1].1.state, CircuitState::Open);

        registry.reset_all();
        assert_eq!(registry.get("b").unwrap().state(), CircuitState::Closed);

        assert!(registry.remove("a").is_some());
        assert!(registry.get("a").is_none());
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_out_of_range_config_is_rejected() {
        let registry = CircuitBreakerRegistry::new();
        for failure_threshold in [f64::NAN, 0.0, 1.5] {
            let config = CircuitBreakerConfig {
                failure_threshold,
                ..CircuitBreakerConfig::default()
            };
            let err = registry.get_or_create("bad", Some(&config)).unwrap_err();
            assert_eq!(err.code(), ErrorCode::Validation);
        }
        assert!(registry.is_empty());

        let broken_default = CircuitBreakerRegistry::with_default_config(CircuitBreakerConfig {
            minimum_requests: 0,
            ..CircuitBreakerConfig::default()
        });
        assert!(broken_default.get_or_create("a", None).is_err());
    }
}
