//! Connection settings shared by the SQL stores

/// Store configuration options
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database URL (e.g., "sqlite:ferry.db", "sqlite::memory:" or "postgres://…")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode (SQLite only)
    pub wal_mode: bool,
    /// Busy timeout in seconds (SQLite only)
    pub busy_timeout_secs: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:ferry.db".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout_secs: 30,
        }
    }
}

impl StoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Create config for in-memory database (testing).
    ///
    /// Every connection to `sqlite::memory:` opens its own database, so the
    /// pool is pinned to one connection.
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
        }
    }

    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_config_uses_single_connection() {
        let config = StoreConfig::memory();
        assert_eq!(config.max_connections, 1);
        assert!(!config.wal_mode);
    }

    #[test]
    fn test_new_keeps_defaults() {
        let config = StoreConfig::new("postgres://localhost/ferry").max_connections(10);
        assert_eq!(config.url, "postgres://localhost/ferry");
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.busy_timeout_secs, 30);
    }
}
