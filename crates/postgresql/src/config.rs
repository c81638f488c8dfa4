use std::time::Duration;

use tokio_postgres::Config as PostgresConfig;

/// Configuration for the PostgreSQL replication connection
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection configuration
    pub postgres_config: PostgresConfig,

    /// How often the slot is polled for new changes while waiting for a message
    pub poll_interval: Duration,

    /// Maximum number of changes requested per poll (whole transactions are
    /// always returned even when they exceed it)
    pub batch_size: i32,
}

impl Config {
    /// Creates a new PostgreSQL config from a connection string
    ///
    /// # Arguments
    /// * `connection_string` - PostgreSQL connection string (e.g., "host=localhost user=postgres password=postgres dbname=testdb")
    ///
    /// # Errors
    /// Returns an error if the connection string cannot be parsed
    pub fn new(connection_string: &str) -> Result<Self, tokio_postgres::Error> {
        let postgres_config = connection_string.parse::<PostgresConfig>()?;

        Ok(Self {
            postgres_config,
            ..Self::default()
        })
    }

    /// Returns a reference to the PostgreSQL connection config
    pub fn postgres_config(&self) -> &PostgresConfig {
        &self.postgres_config
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut postgres_config = PostgresConfig::new();
        postgres_config
            .host("localhost")
            .user("postgres")
            .password("postgres")
            .dbname("postgres");

        Self {
            postgres_config,
            poll_interval: Duration::from_millis(200),
            batch_size: 1000,
        }
    }
}
