// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for helmsman-controller.

use std::net::SocketAddr;
use std::time::Duration;

use crate::heartbeat::HeartbeatConfig;
use crate::reaper::ReaperConfig;
use crate::reconciler::ReconcilerConfig;

/// Storage backend selected by the database URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// `postgres://` or `postgresql://`.
    Postgres,
    /// `sqlite:`.
    Sqlite,
}

/// Controller configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL; its scheme selects the backend.
    pub database_url: String,
    /// Backend implied by `database_url`.
    pub backend: Backend,
    /// Address the HTTP API binds to.
    pub bind_addr: SocketAddr,
    /// Endpoint recorded in this controller's heartbeat.
    pub advertise_url: String,
    /// Heartbeat timeout for runners and controllers.
    pub runner_timeout: Duration,
    /// How long a runner stays reserved before the reservation expires.
    pub reservation_timeout: Duration,
    /// Reconciler tick interval.
    pub reconcile_interval: Duration,
    /// Maximum artefact chunk size in bytes.
    pub artefact_chunk_size: usize,
    /// Database pool size.
    pub db_max_connections: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("HELMSMAN_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("HELMSMAN_DATABASE_URL"))?;
        let backend = if database_url.starts_with("postgres://")
            || database_url.starts_with("postgresql://")
        {
            Backend::Postgres
        } else if database_url.starts_with("sqlite:") {
            Backend::Sqlite
        } else {
            return Err(ConfigError::Invalid(
                "HELMSMAN_DATABASE_URL",
                "expected a postgres:// or sqlite: URL",
            ));
        };

        let bind_addr: SocketAddr = std::env::var("HELMSMAN_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8892".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("HELMSMAN_BIND_ADDR", "expected host:port"))?;

        let advertise_url = std::env::var("HELMSMAN_ADVERTISE_URL")
            .unwrap_or_else(|_| format!("http://{bind_addr}"));

        let runner_timeout = Duration::from_secs(parse_var(
            "HELMSMAN_RUNNER_TIMEOUT_SECS",
            10,
            "expected a positive number of seconds",
        )?);
        let reservation_timeout = Duration::from_secs(parse_var(
            "HELMSMAN_RESERVATION_TIMEOUT_SECS",
            120,
            "expected a positive number of seconds",
        )?);
        let reconcile_interval = Duration::from_millis(parse_var(
            "HELMSMAN_RECONCILE_INTERVAL_MS",
            1000,
            "expected a positive number of milliseconds",
        )?);
        let artefact_chunk_size = parse_var(
            "HELMSMAN_ARTEFACT_CHUNK_SIZE",
            1024 * 1024,
            "expected a positive number of bytes",
        )?;
        let db_max_connections = parse_var(
            "HELMSMAN_DB_MAX_CONNECTIONS",
            10,
            "expected a positive number",
        )?;

        Ok(Self {
            database_url,
            backend,
            bind_addr,
            advertise_url,
            runner_timeout,
            reservation_timeout,
            reconcile_interval,
            artefact_chunk_size,
            db_max_connections,
        })
    }

    /// Heartbeat cadence: a quarter of the timeout.
    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: self.runner_timeout / 4,
        }
    }

    /// Reaper cadences and timeouts.
    pub fn reaper(&self) -> ReaperConfig {
        ReaperConfig {
            interval: self.runner_timeout / 4,
            heartbeat_timeout: self.runner_timeout,
            reservation_interval: self.reservation_timeout,
        }
    }

    /// Reconciler cadence and reservation timeout.
    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: self.reconcile_interval,
            reservation_timeout: self.reservation_timeout,
        }
    }
}

fn parse_var<T>(name: &'static str, default: T, expected: &'static str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) if value > T::default() => Ok(value),
            _ => Err(ConfigError::Invalid(name, expected)),
        },
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    /// An environment variable has an unusable value.
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::sync::Mutex;

    use super::*;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "HELMSMAN_DATABASE_URL",
        "HELMSMAN_BIND_ADDR",
        "HELMSMAN_ADVERTISE_URL",
        "HELMSMAN_RUNNER_TIMEOUT_SECS",
        "HELMSMAN_RESERVATION_TIMEOUT_SECS",
        "HELMSMAN_RECONCILE_INTERVAL_MS",
        "HELMSMAN_ARTEFACT_CHUNK_SIZE",
        "HELMSMAN_DB_MAX_CONNECTIONS",
    ];

    /// Clears the controller's variables and restores them on drop.
    struct EnvGuard {
        vars: Vec<(&'static str, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let vars = VARS.iter().map(|k| (*k, env::var(k).ok())).collect();
            for key in VARS {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe { env::remove_var(key) };
            }
            Self { vars }
        }

        fn set(&self, key: &str, value: &str) {
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..) {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(key, v),
                        None => env::remove_var(key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let env = EnvGuard::clean();
        env.set("HELMSMAN_DATABASE_URL", "sqlite::memory:");

        let config = Config::from_env().unwrap();
        assert_eq!(config.backend, Backend::Sqlite);
        assert_eq!(config.bind_addr, "127.0.0.1:8892".parse().unwrap());
        assert_eq!(config.advertise_url, "http://127.0.0.1:8892");
        assert_eq!(config.runner_timeout, Duration::from_secs(10));
        assert_eq!(config.reservation_timeout, Duration::from_secs(120));
        assert_eq!(config.reconcile_interval, Duration::from_secs(1));
        assert_eq!(config.artefact_chunk_size, 1024 * 1024);
        assert_eq!(config.db_max_connections, 10);
        assert_eq!(config.heartbeat().interval, Duration::from_millis(2500));
        assert_eq!(config.reaper().heartbeat_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let env = EnvGuard::clean();
        env.set("HELMSMAN_DATABASE_URL", "postgres://localhost/helmsman");
        env.set("HELMSMAN_BIND_ADDR", "0.0.0.0:9000");
        env.set("HELMSMAN_ADVERTISE_URL", "http://controller-0:9000");
        env.set("HELMSMAN_RUNNER_TIMEOUT_SECS", "4");
        env.set("HELMSMAN_RECONCILE_INTERVAL_MS", "250");

        let config = Config::from_env().unwrap();
        assert_eq!(config.backend, Backend::Postgres);
        assert_eq!(config.advertise_url, "http://controller-0:9000");
        assert_eq!(config.reaper().interval, Duration::from_secs(1));
        assert_eq!(config.reconciler().interval, Duration::from_millis(250));
    }

    #[test]
    fn test_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _env = EnvGuard::clean();
        assert_eq!(
            Config::from_env().unwrap_err(),
            ConfigError::Missing("HELMSMAN_DATABASE_URL")
        );
    }

    #[test]
    fn test_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let env = EnvGuard::clean();
        env.set("HELMSMAN_DATABASE_URL", "mysql://localhost/helmsman");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("HELMSMAN_DATABASE_URL", _))
        ));

        env.set("HELMSMAN_DATABASE_URL", "sqlite::memory:");
        env.set("HELMSMAN_RUNNER_TIMEOUT_SECS", "0");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("HELMSMAN_RUNNER_TIMEOUT_SECS", _))
        ));

        env.set("HELMSMAN_RUNNER_TIMEOUT_SECS", "ten");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("HELMSMAN_RUNNER_TIMEOUT_SECS", _))
        ));
    }
}
