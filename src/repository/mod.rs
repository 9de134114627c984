//! Read-only access to the active strategy and exchange connection.

use std::sync::Arc;

use crate::config::{Config, StrategyConfig};

/// Credentials of the exchange account a strategy trades on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
}

pub trait StrategyRepository: Send + Sync {
    /// The strategy to run, if one is marked active.
    fn active_strategy(&self) -> Option<StrategyConfig>;

    /// Credentials to trade with, if fully configured.
    fn active_connection(&self) -> Option<ConnectionCredentials>;
}

/// Repository backed by the loaded configuration.
pub struct ConfigRepository {
    config: Arc<Config>,
}

impl ConfigRepository {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl StrategyRepository for ConfigRepository {
    fn active_strategy(&self) -> Option<StrategyConfig> {
        let strategy = &self.config.strategy;
        strategy.active.then(|| strategy.clone())
    }

    fn active_connection(&self) -> Option<ConnectionCredentials> {
        let bybit = &self.config.bybit;
        match (&bybit.api_key, &bybit.api_secret) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => Some(ConnectionCredentials {
                api_key: key.clone(),
                api_secret: secret.clone(),
                testnet: bybit.testnet,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(active: bool, key: Option<&str>) -> Arc<Config> {
        let raw = serde_json::json!({
            "bybit": { "api_key": key, "api_secret": "secret" },
            "strategy": { "active": active, "name": "scalp" }
        });
        Arc::new(serde_json::from_value(raw).unwrap())
    }

    #[test]
    fn test_inactive_strategy_is_hidden() {
        assert!(ConfigRepository::new(config(false, Some("key"))).active_strategy().is_none());
        let active = ConfigRepository::new(config(true, Some("key"))).active_strategy().unwrap();
        assert_eq!(active.name, "scalp");
    }

    #[test]
    fn test_connection_requires_both_credentials() {
        assert!(ConfigRepository::new(config(true, None)).active_connection().is_none());
        assert!(ConfigRepository::new(config(true, Some(""))).active_connection().is_none());

        let creds = ConfigRepository::new(config(true, Some("key"))).active_connection().unwrap();
        assert_eq!(creds.api_key, "key");
        assert!(!creds.testnet);
    }
}
