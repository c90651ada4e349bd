use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use sqlx::{
    pool::PoolConnection,
    postgres::{PgPool, PgPoolOptions},
    Error as SqlxError, Postgres,
};
use thiserror::Error;

use crate::config::Config;
use crate::metrics::consts::{FLAG_ACQUIRE_TIMEOUT_COUNTER, FLAG_DB_CONNECTION_TIME};
use crate::metrics::utils::{inc, timing_guard};

pub mod replica_router;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] SqlxError),
    #[error("Timed out while querying the {0} database")]
    Timeout(DatabaseTarget),
    #[error("The {0} database is unavailable")]
    Unavailable(DatabaseTarget),
}

impl StoreError {
    pub fn is_timeout(&self) -> bool {
        match self {
            StoreError::Timeout(_) => true,
            StoreError::Database(e) => is_timeout_error(e),
            _ => false,
        }
    }
}

/// Which of the two independent connections a query runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseTarget {
    Primary,
    Replica,
}

impl DatabaseTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseTarget::Primary => "primary",
            DatabaseTarget::Replica => "replica",
        }
    }
}

impl fmt::Display for DatabaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub statement_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub idle_in_transaction_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub size: u32,
    pub num_idle: usize,
    pub max_connections: u32,
}

/// A simple db wrapper, so the pools can be swapped for anything that hands out connections.
#[async_trait]
pub trait Client {
    async fn get_connection(&self) -> Result<PoolConnection<Postgres>, StoreError>;

    fn get_pool_stats(&self) -> Option<PoolStats>;
}

#[async_trait]
impl Client for PgPool {
    async fn get_connection(&self) -> Result<PoolConnection<Postgres>, StoreError> {
        let conn = self.acquire().await?;
        Ok(conn)
    }

    fn get_pool_stats(&self) -> Option<PoolStats> {
        Some(PoolStats {
            size: self.size(),
            num_idle: self.num_idle(),
            max_connections: self.options().get_max_connections(),
        })
    }
}

pub type PostgresClient = Arc<dyn Client + Send + Sync>;

fn pool_options(settings: &PoolSettings) -> PgPoolOptions {
    let statement_ms = settings.statement_timeout_ms;
    let lock_ms = settings.lock_timeout_ms;
    let idle_tx_ms = settings.idle_in_transaction_timeout_ms;

    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(settings.acquire_timeout)
        .test_before_acquire(true)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                // SET doesn't accept bind parameters
                sqlx::query(&format!("SET statement_timeout = '{statement_ms}ms'"))
                    .execute(&mut *conn)
                    .await?;
                sqlx::query(&format!("SET lock_timeout = '{lock_ms}ms'"))
                    .execute(&mut *conn)
                    .await?;
                sqlx::query(&format!(
                    "SET idle_in_transaction_session_timeout = '{idle_tx_ms}ms'"
                ))
                .execute(&mut *conn)
                .await?;
                Ok(())
            })
        })
}

pub async fn get_pool(url: &str, settings: &PoolSettings) -> Result<PgPool, SqlxError> {
    pool_options(settings).connect(url).await
}

/// Builds a pool without connecting, so the process can start while the database is down.
pub fn get_lazy_pool(url: &str, settings: &PoolSettings) -> Result<PgPool, SqlxError> {
    pool_options(settings).connect_lazy(url)
}

/// The primary takes every write; the replica takes reads that don't need to see this request's writes.
#[derive(Clone)]
pub struct DatabasePools {
    pub primary: PostgresClient,
    pub replica: PostgresClient,
}

impl DatabasePools {
    pub async fn from_config(config: &Config) -> Result<Self, SqlxError> {
        let settings = config.pool_settings();
        let (primary, replica) = if *config.continue_on_config_errors {
            (
                get_lazy_pool(&config.write_database_url, &settings)?,
                get_lazy_pool(&config.read_database_url, &settings)?,
            )
        } else {
            (
                get_pool(&config.write_database_url, &settings).await?,
                get_pool(&config.read_database_url, &settings).await?,
            )
        };

        Ok(DatabasePools {
            primary: Arc::new(primary),
            replica: Arc::new(replica),
        })
    }

    pub fn client(&self, target: DatabaseTarget) -> &PostgresClient {
        match target {
            DatabaseTarget::Primary => &self.primary,
            DatabaseTarget::Replica => &self.replica,
        }
    }

    /// Acquires a connection on `target`, recording acquisition time and pool timeouts.
    pub async fn connection(
        &self,
        target: DatabaseTarget,
        operation: &str,
    ) -> Result<PoolConnection<Postgres>, StoreError> {
        let labels = [
            ("pool".to_string(), target.as_str().to_string()),
            ("operation".to_string(), operation.to_string()),
        ];
        let _conn_timer = timing_guard(FLAG_DB_CONNECTION_TIME, &labels);

        match self.client(target).get_connection().await {
            Ok(conn) => Ok(conn),
            Err(StoreError::Database(SqlxError::PoolTimedOut)) => {
                inc(FLAG_ACQUIRE_TIMEOUT_COUNTER, &labels, 1);
                Err(StoreError::Timeout(target))
            }
            Err(e) => Err(e),
        }
    }
}

/// Backs `/_readiness`: fails when either connection can't serve a query.
#[async_trait]
pub trait ReadinessCheck {
    async fn check_ready(&self) -> Result<(), StoreError>;
}

pub type ReadinessHandle = Arc<dyn ReadinessCheck + Send + Sync>;

#[async_trait]
impl ReadinessCheck for DatabasePools {
    async fn check_ready(&self) -> Result<(), StoreError> {
        for target in [DatabaseTarget::Primary, DatabaseTarget::Replica] {
            let mut conn = self.connection(target, "readiness").await?;
            sqlx::query("SELECT 1").execute(&mut *conn).await?;
        }
        Ok(())
    }
}

/// Determines if a sqlx::Error represents a timeout-related failure
pub fn is_timeout_error(error: &SqlxError) -> bool {
    match error {
        SqlxError::PoolTimedOut => true,
        SqlxError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => true,
        SqlxError::Database(db_error) => {
            if let Some(code) = db_error.code() {
                // 57014: query_canceled (statement_timeout)
                // 55P03: lock_not_available (lock_timeout)
                // 25P03: idle_in_transaction_session_timeout
                matches!(code.as_ref(), "57014" | "55P03" | "25P03")
            } else {
                let msg = db_error.message().to_lowercase();
                msg.contains("timeout") || msg.contains("canceling")
            }
        }
        _ => false,
    }
}
