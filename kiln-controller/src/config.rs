//! Controller configuration
//!
//! All settings come from environment variables with sensible defaults for
//! single-node development (in-memory store, executor on localhost).

use std::time::Duration;

use kiln_core::domain::image::DOCKER_HUB;

use crate::controller::ControllerConfig;
use crate::repository::DEFAULT_CHANGE_RETENTION;
use crate::retry::Backoff;

/// Which store backend to use
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres { database_url: String },
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to
    pub bind_addr: String,

    pub store: StoreBackend,

    /// Number of most recent changes the store keeps for watchers
    pub change_retention: usize,

    /// Namespace to reconcile; empty means all namespaces
    pub watch_namespace: String,

    /// Executor base URL (e.g., "http://localhost:9090")
    pub executor_url: String,

    /// Registry used for image references without one
    pub default_registry: String,

    /// Number of keyed reconcile workers
    pub workers: usize,

    /// How often all non-terminal builds are re-queued
    pub resync_interval: Duration,

    /// How often an idle watch polls the change log
    pub watch_poll_interval: Duration,

    /// Maximum time a build may stay Pending
    pub pending_timeout: Duration,

    /// Maximum time a build may stay Running
    pub running_timeout: Duration,

    /// Re-reads allowed after a compare-and-swap conflict
    pub conflict_retries: u32,

    /// Attempts for operations failing with transient errors
    pub transient_retries: u32,
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - KILN_BIND_ADDR (default: 0.0.0.0:8080)
    /// - KILN_STORE (memory | postgres, default: memory)
    /// - DATABASE_URL (required when KILN_STORE=postgres)
    /// - KILN_CHANGE_RETENTION (default: 10000)
    /// - KILN_WATCH_NAMESPACE (default: all namespaces)
    /// - KILN_EXECUTOR_URL (default: http://localhost:9090)
    /// - KILN_DEFAULT_REGISTRY (default: docker.io)
    /// - KILN_WORKERS (default: 4)
    /// - KILN_RESYNC_INTERVAL (seconds, default: 30)
    /// - KILN_WATCH_POLL_INTERVAL (seconds, default: 1)
    /// - KILN_PENDING_TIMEOUT (seconds, default: 600)
    /// - KILN_RUNNING_TIMEOUT (seconds, default: 3600)
    /// - KILN_CONFLICT_RETRIES (default: 3)
    /// - KILN_TRANSIENT_RETRIES (default: 5)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let store = match lookup("KILN_STORE").as_deref() {
            None | Some("memory") => StoreBackend::Memory,
            Some("postgres") => {
                let database_url = lookup("DATABASE_URL").ok_or_else(|| {
                    anyhow::anyhow!("DATABASE_URL must be set when KILN_STORE=postgres")
                })?;
                StoreBackend::Postgres { database_url }
            }
            Some(other) => anyhow::bail!("unknown KILN_STORE backend: {}", other),
        };

        let secs = |name: &str, default: Duration| {
            lookup(name)
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        Ok(Self {
            bind_addr: lookup("KILN_BIND_ADDR").unwrap_or(defaults.bind_addr),
            store,
            change_retention: lookup("KILN_CHANGE_RETENTION")
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(defaults.change_retention),
            watch_namespace: lookup("KILN_WATCH_NAMESPACE").unwrap_or_default(),
            executor_url: lookup("KILN_EXECUTOR_URL").unwrap_or(defaults.executor_url),
            default_registry: lookup("KILN_DEFAULT_REGISTRY").unwrap_or(defaults.default_registry),
            workers: lookup("KILN_WORKERS")
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(defaults.workers),
            resync_interval: secs("KILN_RESYNC_INTERVAL", defaults.resync_interval),
            watch_poll_interval: secs("KILN_WATCH_POLL_INTERVAL", defaults.watch_poll_interval),
            pending_timeout: secs("KILN_PENDING_TIMEOUT", defaults.pending_timeout),
            running_timeout: secs("KILN_RUNNING_TIMEOUT", defaults.running_timeout),
            conflict_retries: lookup("KILN_CONFLICT_RETRIES")
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(defaults.conflict_retries),
            transient_retries: lookup("KILN_TRANSIENT_RETRIES")
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(defaults.transient_retries),
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if !self.executor_url.starts_with("http://") && !self.executor_url.starts_with("https://") {
            anyhow::bail!("executor_url must start with http:// or https://");
        }

        if self.change_retention == 0 {
            anyhow::bail!("change_retention must be greater than 0");
        }

        if self.default_registry.is_empty() {
            anyhow::bail!("default_registry cannot be empty");
        }

        if self.workers == 0 {
            anyhow::bail!("workers must be greater than 0");
        }

        if self.resync_interval.as_secs() == 0 {
            anyhow::bail!("resync_interval must be greater than 0");
        }

        if self.watch_poll_interval.as_secs() == 0 {
            anyhow::bail!("watch_poll_interval must be greater than 0");
        }

        if self.pending_timeout.as_secs() == 0 || self.running_timeout.as_secs() == 0 {
            anyhow::bail!("phase timeouts must be greater than 0");
        }

        if self.transient_retries == 0 {
            anyhow::bail!("transient_retries must be greater than 0");
        }

        Ok(())
    }

    /// Settings for the build controller
    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            namespace: self.watch_namespace.clone(),
            workers: self.workers,
            resync_interval: self.resync_interval,
            pending_timeout: self.pending_timeout,
            running_timeout: self.running_timeout,
            conflict_retries: self.conflict_retries,
            transient_backoff: Backoff::new(self.transient_retries),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            store: StoreBackend::Memory,
            change_retention: DEFAULT_CHANGE_RETENTION,
            watch_namespace: String::new(),
            executor_url: "http://localhost:9090".to_string(),
            default_registry: DOCKER_HUB.to_string(),
            workers: 4,
            resync_interval: Duration::from_secs(30),
            watch_poll_interval: Duration::from_secs(1),
            pending_timeout: Duration::from_secs(600),
            running_timeout: Duration::from_secs(3600),
            conflict_retries: 3,
            transient_retries: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_vars(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.conflict_retries, 3);
        assert_eq!(config.store, StoreBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_vars() {
        let config = from_vars(&[
            ("KILN_STORE", "postgres"),
            ("DATABASE_URL", "postgres://kiln@localhost/kiln"),
            ("KILN_WORKERS", "8"),
            ("KILN_PENDING_TIMEOUT", "60"),
            ("KILN_WATCH_NAMESPACE", "ci"),
            ("KILN_CHANGE_RETENTION", "500"),
        ])
        .unwrap();

        assert_eq!(
            config.store,
            StoreBackend::Postgres {
                database_url: "postgres://kiln@localhost/kiln".to_string()
            }
        );
        assert_eq!(config.workers, 8);
        assert_eq!(config.pending_timeout, Duration::from_secs(60));
        assert_eq!(config.running_timeout, Duration::from_secs(3600));
        assert_eq!(config.controller().namespace, "ci");
        assert_eq!(config.change_retention, 500);
    }

    #[test]
    fn test_postgres_requires_database_url() {
        assert!(from_vars(&[("KILN_STORE", "postgres")]).is_err());
        assert!(from_vars(&[("KILN_STORE", "etcd")]).is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.executor_url = "executor:9090".to_string();
        assert!(config.validate().is_err());

        config.executor_url = "http://executor:9090".to_string();
        config.workers = 0;
        assert!(config.validate().is_err());

        config.workers = 4;
        config.change_retention = 0;
        assert!(config.validate().is_err());
    }
}
