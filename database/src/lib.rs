//! MySQL access: the Slurm accounting DB (read only) and the chargeback table.
//!
//! Both repositories wrap one [`QueryExecutor`], which owns the pool and puts the configured
//! timeout on every single statement.
pub mod chargeback;
pub mod slurm;

use std::time::Duration;

use sqlx::{
    mysql::{MySqlArguments, MySqlPoolOptions, MySqlRow},
    query::Query,
    Executor as _, MySql, MySqlPool, Row as _,
};
use thiserror::Error;
use tracing::{info, instrument, warn};

pub use chargeback::ChargebackDb;
pub use slurm::SlurmDb;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("connecting to the {database} DB: {source}")]
    Connect {
        database: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("query on the {database} DB failed: {source}")]
    Query {
        database: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("{database} DB did not answer within {timeout:?}")]
    Timeout { database: &'static str, timeout: Duration },
    #[error("`{0}` is not a valid table name (only ASCII letters, digits and `_`)")]
    InvalidIdentifier(String),
    #[error("column `{column}`: {value} is out of range")]
    OutOfRange { column: &'static str, value: i64 },
}

impl DatabaseError {
    /// MySQL error 1062 (`ER_DUP_ENTRY`) on a unique key.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            DatabaseError::Query {
                source: sqlx::Error::Database(error),
                ..
            } => error.is_unique_violation(),
            _ => false,
        }
    }
}

/// Table names can't be bound as parameters, so whatever ends up in SQL text is checked here.
pub fn validate_identifier(name: &str) -> Result<&str, DatabaseError> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(DatabaseError::InvalidIdentifier(name.to_owned()))
    }
}

const STRICT_SQL_MODE: &str = "SET SESSION sql_mode = CONCAT_WS(',', @@sql_mode, 'STRICT_ALL_TABLES')";

pub type MySqlQuery<'q> = Query<'q, MySql, MySqlArguments>;

pub struct QueryExecutor {
    pool: MySqlPool,
    timeout: Duration,
    database: &'static str,
}

impl QueryExecutor {
    /// `database` only names the DB in logs and errors.
    ///
    /// Sessions run in strict mode, so a value too long for its column is an error instead of a
    /// truncation warning.
    #[instrument(skip(url))]
    pub async fn connect(url: &str, timeout: Duration, database: &'static str) -> Result<Self, DatabaseError> {
        info!("Connecting to the {database} DB");
        let pool = tokio::time::timeout(
            timeout,
            MySqlPoolOptions::new()
                .max_connections(4)
                .acquire_timeout(timeout)
                .after_connect(|conn, _meta| {
                    Box::pin(async move {
                        conn.execute(STRICT_SQL_MODE).await?;
                        Ok(())
                    })
                })
                .connect(url),
        )
        .await
        .map_err(|_| DatabaseError::Timeout { database, timeout })?
        .map_err(|source| DatabaseError::Connect { database, source })?;

        Ok(QueryExecutor { pool, timeout, database })
    }

    async fn bounded<T>(
        &self,
        future: impl std::future::Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, DatabaseError> {
        let database = self.database;
        tokio::time::timeout(self.timeout, future)
            .await
            .map_err(|_| DatabaseError::Timeout {
                database,
                timeout: self.timeout,
            })?
            .map_err(|source| DatabaseError::Query { database, source })
    }

    pub async fn fetch_all(&self, query: MySqlQuery<'_>) -> Result<Vec<MySqlRow>, DatabaseError> {
        self.bounded(query.fetch_all(&self.pool)).await
    }

    pub async fn fetch_optional(&self, query: MySqlQuery<'_>) -> Result<Option<MySqlRow>, DatabaseError> {
        self.bounded(query.fetch_optional(&self.pool)).await
    }

    /// Number of affected rows.
    pub async fn execute(&self, query: MySqlQuery<'_>) -> Result<u64, DatabaseError> {
        Ok(self.bounded(query.execute(&self.pool)).await?.rows_affected())
    }

    pub async fn close(&self) {
        info!("Closing connection to the {} DB", self.database);
        if tokio::time::timeout(self.timeout, self.pool.close()).await.is_err() {
            warn!("Failed to cleanly close the {} DB pool within {:?}", self.database, self.timeout);
        }
    }

    pub fn database(&self) -> &'static str {
        self.database
    }
}

/// Integer column, selected as `CAST(… AS SIGNED)`.
pub(crate) fn int_column<T: TryFrom<i64>>(
    row: &MySqlRow,
    column: &'static str,
    database: &'static str,
) -> Result<T, DatabaseError> {
    let value: i64 = row.try_get(column).map_err(|source| DatabaseError::Query { database, source })?;
    T::try_from(value).map_err(|_| DatabaseError::OutOfRange { column, value })
}

pub(crate) fn get_column<'r, T>(
    row: &'r MySqlRow,
    column: &'static str,
    database: &'static str,
) -> Result<T, DatabaseError>
where
    T: sqlx::Decode<'r, MySql> + sqlx::Type<MySql>,
{
    row.try_get(column).map_err(|source| DatabaseError::Query { database, source })
}
