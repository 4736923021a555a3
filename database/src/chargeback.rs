use std::time::Duration;

use async_trait::async_trait;
use chargeback_data::{
    job::{ChargebackRecord, JobResult, UsageRow},
    report::{ReportQuery, ReportTarget, Reporter, TargetType},
    store::ChargebackStore,
};
use color_eyre::Result;
use itertools::Itertools as _;
use sqlx::mysql::MySqlRow;
use tracing::{debug, info, instrument, warn};

use crate::{get_column, int_column, validate_identifier, DatabaseError, QueryExecutor};

const DATABASE: &str = "chargeback";

/// Columns of a full [`ChargebackRecord`], in the order [`ChargebackDb::record`] reads them.
const RECORD_COLUMNS: &str = "slurm_job_name, CAST(slurm_id_job AS SIGNED) AS slurm_id_job, time_start, time_end, \
     duration_sec, CAST(cpus_req AS SIGNED) AS cpus_req, CAST(exit_code AS SIGNED) AS exit_code, \
     CAST(user_id AS SIGNED) AS user_id, CAST(group_id AS SIGNED) AS group_id, user_name, group_name, nodelist, \
     CAST(node_alloc AS SIGNED) AS node_alloc, CAST(slurm_job_state AS SIGNED) AS slurm_job_state, job_result, \
     CAST(gpus_requested AS SIGNED) AS gpus_requested, CAST(gpus_used AS SIGNED) AS gpus_used, `partition`";

pub struct ChargebackDb {
    executor: QueryExecutor,
    table: String,
}

pub fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS `{table}` (
            slurm_id_job BIGINT UNSIGNED NOT NULL PRIMARY KEY,
            slurm_job_name VARCHAR(255) NOT NULL,
            time_start DATETIME NOT NULL,
            time_end DATETIME NOT NULL,
            duration_sec BIGINT NOT NULL,
            cpus_req INT UNSIGNED NOT NULL,
            exit_code INT NOT NULL,
            user_id INT UNSIGNED NOT NULL,
            group_id INT UNSIGNED NOT NULL,
            user_name VARCHAR(255) NOT NULL,
            group_name VARCHAR(255) NOT NULL,
            nodelist TEXT NOT NULL,
            node_alloc INT UNSIGNED NOT NULL,
            slurm_job_state INT UNSIGNED NOT NULL,
            job_result VARCHAR(16) NOT NULL,
            gpus_requested INT UNSIGNED NOT NULL,
            gpus_used INT UNSIGNED NOT NULL,
            `partition` VARCHAR(255) NOT NULL,
            KEY user_time_end (user_name, time_end),
            KEY group_time_end (group_name, time_end)
        )"
    )
}

pub fn insert_sql(table: &str) -> String {
    format!(
        "INSERT INTO `{table}` (slurm_job_name, slurm_id_job, time_start, time_end, duration_sec, cpus_req, \
         exit_code, user_id, group_id, user_name, group_name, nodelist, node_alloc, slurm_job_state, job_result, \
         gpus_requested, gpus_used, `partition`) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    )
}

/// `SELECT` of the three report columns. Parameters: target name, earliest `time_end`, then for
/// the month-range query the minimum duration and the earliest `time_start`.
pub fn usage_sql(table: &str, target: &ReportTarget, query: &ReportQuery) -> String {
    let target_column = match target.kind {
        TargetType::User => "user_name",
        TargetType::Group => "group_name",
    };
    let predicate = match query {
        ReportQuery::CompletedOnly { .. } => format!("AND job_result = '{}'", JobResult::Completed),
        ReportQuery::MonthRange { .. } => "AND duration_sec >= ? AND time_start >= ?".to_owned(),
    };
    format!(
        "SELECT job_result, CAST(gpus_used AS SIGNED) AS gpus_used, duration_sec FROM `{table}` \
         WHERE {target_column} = ? AND time_end >= ? {predicate}"
    )
}

impl ChargebackDb {
    pub async fn connect(url: &str, table: &str, timeout: Duration) -> Result<Self, DatabaseError> {
        let table = validate_identifier(table)?.to_owned();
        let executor = QueryExecutor::connect(url, timeout, DATABASE).await?;
        info!("Using chargeback table `{table}`");
        Ok(ChargebackDb { executor, table })
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn init_schema(&self) -> Result<(), DatabaseError> {
        let sql = create_table_sql(&self.table);
        self.executor.execute(sqlx::query(&sql)).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.executor.close().await
    }

    fn record(row: &MySqlRow) -> Result<ChargebackRecord, DatabaseError> {
        Ok(ChargebackRecord {
            job_name: get_column(row, "slurm_job_name", DATABASE)?,
            source_job_id: int_column(row, "slurm_id_job", DATABASE)?,
            start_time: get_column(row, "time_start", DATABASE)?,
            end_time: get_column(row, "time_end", DATABASE)?,
            duration_sec: get_column(row, "duration_sec", DATABASE)?,
            cpus_requested: int_column(row, "cpus_req", DATABASE)?,
            exit_code: int_column(row, "exit_code", DATABASE)?,
            user_id: int_column(row, "user_id", DATABASE)?,
            group_id: int_column(row, "group_id", DATABASE)?,
            user_name: get_column(row, "user_name", DATABASE)?,
            group_name: get_column(row, "group_name", DATABASE)?,
            node_list: get_column(row, "nodelist", DATABASE)?,
            nodes_allocated: int_column(row, "node_alloc", DATABASE)?,
            state_code: int_column(row, "slurm_job_state", DATABASE)?,
            job_result: Self::job_result(row)?,
            gpus_requested: int_column(row, "gpus_requested", DATABASE)?,
            gpus_used: int_column(row, "gpus_used", DATABASE)?,
            partition: get_column(row, "partition", DATABASE)?,
        })
    }

    fn job_result(row: &MySqlRow) -> Result<JobResult, DatabaseError> {
        let job_result: String = get_column(row, "job_result", DATABASE)?;
        Ok(job_result.parse().unwrap_or_else(|e| {
            warn!("{e}, counting it as UNKNOWN");
            JobResult::Unknown
        }))
    }

    fn usage_row(row: &MySqlRow) -> Result<UsageRow, DatabaseError> {
        Ok(UsageRow {
            job_result: Self::job_result(row)?,
            gpus_used: int_column(row, "gpus_used", DATABASE)?,
            duration_sec: get_column(row, "duration_sec", DATABASE)?,
        })
    }
}

#[async_trait]
impl ChargebackStore for ChargebackDb {
    async fn job_exists(&self, source_job_id: u64) -> Result<bool> {
        let sql = format!("SELECT 1 FROM `{}` WHERE slurm_id_job = ? LIMIT 1", self.table);
        Ok(self.executor.fetch_optional(sqlx::query(&sql).bind(source_job_id)).await?.is_some())
    }

    #[instrument(skip_all, fields(job = record.source_job_id), err)]
    async fn insert_job(&self, record: &ChargebackRecord) -> Result<bool> {
        let sql = insert_sql(&self.table);
        let query = sqlx::query(&sql)
            .bind(&record.job_name)
            .bind(record.source_job_id)
            .bind(record.start_time)
            .bind(record.end_time)
            .bind(record.duration_sec)
            .bind(record.cpus_requested)
            .bind(record.exit_code)
            .bind(record.user_id)
            .bind(record.group_id)
            .bind(&record.user_name)
            .bind(&record.group_name)
            .bind(&record.node_list)
            .bind(record.nodes_allocated)
            .bind(record.state_code)
            .bind(record.job_result.as_str())
            .bind(record.gpus_requested)
            .bind(record.gpus_used)
            .bind(&record.partition);
        match self.executor.execute(query).await {
            Ok(affected) => {
                debug!("Updated: '{affected}' rows");
                Ok(affected == 1)
            }
            // inserted by someone else since the exists check
            Err(e) if e.is_duplicate_key() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), err)]
    async fn query_usage(&self, target: &ReportTarget, query: &ReportQuery) -> Result<Vec<UsageRow>> {
        let sql = usage_sql(&self.table, target, query);
        let mut statement = sqlx::query(&sql).bind(&target.name).bind(query.since(Reporter::today()));
        if let ReportQuery::MonthRange { min_duration_sec, .. } = query {
            statement = statement.bind(*min_duration_sec).bind(query.min_start_time());
        }
        let rows = self.executor.fetch_all(statement).await?;
        Ok(rows.iter().map(Self::usage_row).try_collect()?)
    }

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<ChargebackRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM `{}` ORDER BY time_end DESC LIMIT ?", self.table);
        let limit = u64::try_from(limit).unwrap_or(u64::MAX);
        let rows = self.executor.fetch_all(sqlx::query(&sql).bind(limit)).await?;
        Ok(rows.iter().map(Self::record).try_collect()?)
    }

    async fn jobs_for_user(&self, username: &str, months: u32) -> Result<Vec<ChargebackRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM `{}` WHERE user_name = ? AND job_result = '{}' AND time_end >= ? \
             ORDER BY time_end DESC",
            self.table,
            JobResult::Completed
        );
        let since = ReportQuery::CompletedOnly { months }.since(Reporter::today());
        let rows = self.executor.fetch_all(sqlx::query(&sql).bind(username).bind(since)).await?;
        Ok(rows.iter().map(Self::record).try_collect()?)
    }

    async fn latest_group_for_user(&self, username: &str) -> Result<Option<String>> {
        let sql = format!("SELECT group_name FROM `{}` WHERE user_name = ? ORDER BY time_end DESC LIMIT 1", self.table);
        let row = self.executor.fetch_optional(sqlx::query(&sql).bind(username)).await?;
        Ok(row.map(|row| get_column(&row, "group_name", DATABASE)).transpose()?)
    }
}
