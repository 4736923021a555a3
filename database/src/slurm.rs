use std::{ops::RangeInclusive, time::Duration};

use async_trait::async_trait;
use chargeback_data::{identity::AccountAssociation, job::RawJobRecord, slurm::AccountingSource};
use color_eyre::Result;
use itertools::Itertools as _;
use sqlx::mysql::MySqlRow;
use tracing::{debug, info, instrument};

use crate::{get_column, int_column, validate_identifier, DatabaseError, QueryExecutor};

const DATABASE: &str = "Slurm accounting";

/// Read-only access to `slurm_acct_db`. Unsigned columns are cast to `SIGNED` so they all decode as `i64`.
pub struct SlurmDb {
    executor: QueryExecutor,
    jobs_sql: String,
    associations_sql: String,
}

pub fn jobs_sql(cluster_name: &str) -> Result<String, DatabaseError> {
    let table = format!("{}_job_table", validate_identifier(cluster_name)?);
    Ok(format!(
        "SELECT job_name, CAST(id_job AS SIGNED) AS id_job, CAST(time_start AS SIGNED) AS time_start, \
         CAST(time_end AS SIGNED) AS time_end, CAST(cpus_req AS SIGNED) AS cpus_req, \
         CAST(exit_code AS SIGNED) AS exit_code, CAST(id_user AS SIGNED) AS id_user, \
         CAST(id_group AS SIGNED) AS id_group, nodelist, CAST(nodes_alloc AS SIGNED) AS nodes_alloc, \
         CAST(state AS SIGNED) AS state, tres_req, account, `partition` \
         FROM `{table}` WHERE time_end BETWEEN ? AND ? AND time_start > 0"
    ))
}

pub fn associations_sql(cluster_name: &str) -> Result<String, DatabaseError> {
    let table = format!("{}_assoc_table", validate_identifier(cluster_name)?);
    Ok(format!(
        "SELECT `user`, acct, CAST(is_def AS SIGNED) AS is_def FROM `{table}` WHERE `user` <> '' AND deleted = 0"
    ))
}

impl SlurmDb {
    pub async fn connect(url: &str, cluster_name: &str, timeout: Duration) -> Result<Self, DatabaseError> {
        let jobs_sql = jobs_sql(cluster_name)?;
        let associations_sql = associations_sql(cluster_name)?;
        let executor = QueryExecutor::connect(url, timeout, DATABASE).await?;
        info!("Using job table `{cluster_name}_job_table`");
        Ok(SlurmDb {
            executor,
            jobs_sql,
            associations_sql,
        })
    }

    pub async fn close(&self) {
        self.executor.close().await
    }

    fn raw_job(row: &MySqlRow) -> Result<RawJobRecord, DatabaseError> {
        Ok(RawJobRecord {
            job_name: get_column(row, "job_name", DATABASE)?,
            source_job_id: int_column(row, "id_job", DATABASE)?,
            time_start: int_column(row, "time_start", DATABASE)?,
            time_end: int_column(row, "time_end", DATABASE)?,
            cpus_requested: int_column(row, "cpus_req", DATABASE)?,
            exit_code: int_column(row, "exit_code", DATABASE)?,
            user_id: int_column(row, "id_user", DATABASE)?,
            group_id: int_column(row, "id_group", DATABASE)?,
            node_list: get_column::<Option<String>>(row, "nodelist", DATABASE)?.unwrap_or_default(),
            nodes_allocated: int_column(row, "nodes_alloc", DATABASE)?,
            state_code: int_column(row, "state", DATABASE)?,
            resource_request_encoding: get_column(row, "tres_req", DATABASE)?,
            account_name: get_column(row, "account", DATABASE)?,
            partition: get_column::<Option<String>>(row, "partition", DATABASE)?.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl AccountingSource for SlurmDb {
    #[instrument(skip(self), err)]
    async fn jobs_in_range(&self, window: RangeInclusive<i64>) -> Result<Vec<RawJobRecord>> {
        let query = sqlx::query(&self.jobs_sql).bind(*window.start()).bind(*window.end());
        let rows = self.executor.fetch_all(query).await?;
        debug!("{} rows from the job table", rows.len());
        Ok(rows.iter().map(Self::raw_job).try_collect()?)
    }

    #[instrument(skip(self), err)]
    async fn account_associations(&self) -> Result<Vec<AccountAssociation>> {
        let rows = self.executor.fetch_all(sqlx::query(&self.associations_sql)).await?;
        Ok(rows
            .iter()
            .map(|row| {
                Ok::<_, DatabaseError>(AccountAssociation {
                    user: get_column(row, "user", DATABASE)?,
                    account: get_column(row, "acct", DATABASE)?,
                    is_default: int_column::<i64>(row, "is_def", DATABASE)? != 0,
                })
            })
            .try_collect()?)
    }
}
