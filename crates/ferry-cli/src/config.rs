//! Configuration loaded from `FERRY_*` environment variables

use std::env;
use std::str::FromStr;
use std::time::Duration;

use ferry_persist::StoreConfig;
use ferry_queue::DEFAULT_QUEUE;

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Sqlite,
    Postgres,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Memory => "memory",
            Backend::Sqlite => "sqlite",
            Backend::Postgres => "postgres",
        }
    }

    pub fn is_sql(&self) -> bool {
        !matches!(self, Backend::Memory)
    }
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            "sqlite" => Ok(Backend::Sqlite),
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            other => Err(ConfigError::Invalid(format!(
                "FERRY_BACKEND must be memory, sqlite or postgres, got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FerryConfig {
    /// Queue backend (env: FERRY_BACKEND, default: memory)
    pub backend: Backend,
    /// Connection URL (env: FERRY_DATABASE_URL)
    pub database_url: Option<String>,
    /// Queues to register (env: FERRY_QUEUES, default: jobs)
    pub queues: Vec<String>,
    /// Default queue (env: FERRY_DEFAULT_QUEUE, default: first listed queue)
    pub default_queue: String,
    /// Reservation staleness window (env: FERRY_STALE_RESERVATION_SECS)
    pub stale_reservation: Option<Duration>,
    /// Worker poll interval (env: FERRY_POLL_INTERVAL_MS, default: 1000)
    pub poll_interval: Duration,
    /// Pool size (env: FERRY_MAX_CONNECTIONS, default: 5)
    pub max_connections: u32,
    /// Age after which completed rows are pruned (env: FERRY_PRUNE_AFTER_SECS, default: 7 days)
    pub prune_after: Duration,
}

impl FerryConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let backend = get("FERRY_BACKEND")
            .map(|v| v.parse::<Backend>())
            .transpose()?
            .unwrap_or(Backend::Memory);

        let queues: Vec<String> = get("FERRY_QUEUES")
            .unwrap_or_else(|| "jobs".to_string())
            .split(',')
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
        if queues.is_empty() {
            return Err(ConfigError::Invalid("FERRY_QUEUES lists no queues".to_string()));
        }
        if queues.iter().any(|q| q == DEFAULT_QUEUE) {
            return Err(ConfigError::Invalid(format!(
                "FERRY_QUEUES may not contain the reserved name '{DEFAULT_QUEUE}'"
            )));
        }

        let default_queue = match get("FERRY_DEFAULT_QUEUE") {
            Some(name) if queues.contains(&name) => name,
            Some(name) => {
                return Err(ConfigError::Invalid(format!(
                    "FERRY_DEFAULT_QUEUE '{name}' is not listed in FERRY_QUEUES"
                )))
            }
            None => queues[0].clone(),
        };

        let database_url = get("FERRY_DATABASE_URL");
        let stale_reservation = parse_number::<u64>(&get, "FERRY_STALE_RESERVATION_SECS")?
            .map(Duration::from_secs);

        if backend.is_sql() {
            if database_url.is_none() {
                return Err(ConfigError::MissingEnvVar("FERRY_DATABASE_URL".to_string()));
            }
            if stale_reservation.is_none() {
                return Err(ConfigError::MissingEnvVar(
                    "FERRY_STALE_RESERVATION_SECS".to_string(),
                ));
            }
        }

        Ok(Self {
            backend,
            database_url,
            queues,
            default_queue,
            stale_reservation,
            poll_interval: Duration::from_millis(
                parse_number(&get, "FERRY_POLL_INTERVAL_MS")?.unwrap_or(1000),
            ),
            max_connections: parse_number(&get, "FERRY_MAX_CONNECTIONS")?.unwrap_or(5),
            prune_after: Duration::from_secs(
                parse_number(&get, "FERRY_PRUNE_AFTER_SECS")?.unwrap_or(7 * 24 * 60 * 60),
            ),
        })
    }

    /// Connection settings for the SQL backends
    pub fn store_config(&self) -> Option<StoreConfig> {
        self.database_url
            .as_ref()
            .map(|url| StoreConfig::new(url.clone()).max_connections(self.max_connections))
    }
}

fn parse_number<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    get(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{key} must be a number, got '{raw}'")))
        })
        .transpose()
}
