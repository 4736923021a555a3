use async_trait::async_trait;
use color_eyre::Result;

use crate::{
    job::{ChargebackRecord, UsageRow},
    report::{ReportQuery, ReportTarget},
};

/// Persistent chargeback table. `source_job_id` is unique: inserting a known id is a no-op.
#[async_trait]
pub trait ChargebackStore: Send + Sync {
    async fn job_exists(&self, source_job_id: u64) -> Result<bool>;

    /// `true` iff the record was inserted, `false` if its `source_job_id` was already stored.
    async fn insert_job(&self, record: &ChargebackRecord) -> Result<bool>;

    /// Rows of `target` matching `query`, relative to today.
    async fn query_usage(&self, target: &ReportTarget, query: &ReportQuery) -> Result<Vec<UsageRow>>;

    /// The `limit` most recently ended jobs.
    async fn recent_jobs(&self, limit: usize) -> Result<Vec<ChargebackRecord>>;

    /// Completed jobs of `username` that ended within the last `months` months, newest first.
    async fn jobs_for_user(&self, username: &str, months: u32) -> Result<Vec<ChargebackRecord>>;

    /// Group of the most recently ended job of `username`.
    async fn latest_group_for_user(&self, username: &str) -> Result<Option<String>>;

    async fn query_completed_for_user(&self, username: &str, months: u32) -> Result<Vec<UsageRow>> {
        self.query_usage(&ReportTarget::user(username), &ReportQuery::CompletedOnly { months }).await
    }

    async fn query_completed_for_group(&self, groupname: &str, months: u32) -> Result<Vec<UsageRow>> {
        self.query_usage(&ReportTarget::group(groupname), &ReportQuery::CompletedOnly { months }).await
    }

    async fn query_in_month_range_for_user(
        &self,
        username: &str,
        months: u32,
        min_duration_sec: i64,
    ) -> Result<Vec<UsageRow>> {
        let query = ReportQuery::MonthRange { months, min_duration_sec };
        self.query_usage(&ReportTarget::user(username), &query).await
    }

    async fn query_in_month_range_for_group(
        &self,
        groupname: &str,
        months: u32,
        min_duration_sec: i64,
    ) -> Result<Vec<UsageRow>> {
        let query = ReportQuery::MonthRange { months, min_duration_sec };
        self.query_usage(&ReportTarget::group(groupname), &query).await
    }
}
