//! GPU usage and cost reports over chargeback records.
//!
//! All derived numbers are decimals rounded half away from zero to 3 places, so the same records
//! always produce the same report, no matter which client asks.
use std::{fmt, sync::Arc};

use chrono::{Datelike, Local, Months, NaiveDate, NaiveDateTime};
use color_eyre::Result;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::{
    job::{ChargebackRecord, JobResult, UsageRow},
    settings::ReportSettings,
    store::ChargebackStore,
    UNKNOWN,
};

pub const REPORT_DECIMALS: u32 = 3;

/// Records that started in or before 2020 carry a bogus default timestamp and are never reported
/// by the month-range query.
pub const FIRST_TRUSTED_YEAR: i32 = 2021;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    User,
    Group,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetType::User => f.write_str("user"),
            TargetType::Group => f.write_str("group"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReportTarget {
    pub kind: TargetType,
    pub name: String,
}

impl ReportTarget {
    pub fn user(name: impl Into<String>) -> Self {
        ReportTarget {
            kind: TargetType::User,
            name: name.into(),
        }
    }

    pub fn group(name: impl Into<String>) -> Self {
        ReportTarget {
            kind: TargetType::Group,
            name: name.into(),
        }
    }

    pub fn matches(&self, record: &ChargebackRecord) -> bool {
        match self.kind {
            TargetType::User => record.user_name == self.name,
            TargetType::Group => record.group_name == self.name,
        }
    }
}

/// The two historical report queries. Both look at jobs that ended within the last `months`
/// months (counted from today's midnight).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportQuery {
    /// Only `COMPLETED` jobs.
    CompletedOnly { months: u32 },
    /// Every job result, but only jobs running at least `min_duration_sec` that started after 2020.
    MonthRange { months: u32, min_duration_sec: i64 },
}

impl ReportQuery {
    pub fn months(&self) -> u32 {
        match *self {
            ReportQuery::CompletedOnly { months } | ReportQuery::MonthRange { months, .. } => months,
        }
    }

    /// Earliest `end_time` that is still reported.
    pub fn since(&self, today: NaiveDate) -> NaiveDateTime {
        today
            .checked_sub_months(Months::new(self.months()))
            .unwrap_or(NaiveDate::MIN)
            .and_time(chrono::NaiveTime::MIN)
    }

    /// Earliest `start_time` that is still reported, if the query has such a floor.
    pub fn min_start_time(&self) -> Option<NaiveDateTime> {
        match self {
            ReportQuery::CompletedOnly { .. } => None,
            ReportQuery::MonthRange { .. } => {
                NaiveDate::from_ymd_opt(FIRST_TRUSTED_YEAR, 1, 1).map(|day| day.and_time(chrono::NaiveTime::MIN))
            }
        }
    }

    /// Same predicate the chargeback DB evaluates in SQL, for stores that filter in memory.
    pub fn matches(&self, record: &ChargebackRecord, today: NaiveDate) -> bool {
        if record.end_time < self.since(today) {
            return false;
        }
        match *self {
            ReportQuery::CompletedOnly { .. } => record.job_result == JobResult::Completed,
            ReportQuery::MonthRange { min_duration_sec, .. } => {
                record.duration_sec >= min_duration_sec && record.start_time.year() >= FIRST_TRUSTED_YEAR
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub target_type: TargetType,
    pub target_name: String,
    pub gpu_usd_cost_per_minute: Decimal,
    pub month_range: u32,
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub total_gpus_used: u64,
    pub total_gpu_seconds: i64,
    pub total_gpu_minutes: Decimal,
    pub total_gpu_hours: Decimal,
    pub total_gpu_cost_usd: Decimal,
}

/// Rounded to [`REPORT_DECIMALS`] and always *shown* with exactly that many decimals.
fn round(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(REPORT_DECIMALS, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(REPORT_DECIMALS);
    rounded
}

pub fn build_report(
    rows: &[UsageRow],
    cost_per_minute_usd: Decimal,
    month_range: u32,
    target: &ReportTarget,
) -> UsageReport {
    let count = |result: JobResult| rows.iter().filter(|row| row.job_result == result).count() as u64;

    let total_gpu_seconds: i64 = rows.iter().map(|row| i64::from(row.gpus_used) * row.duration_sec).sum();
    let total_gpu_minutes = round(Decimal::from(total_gpu_seconds) / Decimal::from(60));
    let total_gpu_hours = round(Decimal::from(total_gpu_seconds) / Decimal::from(3600));

    UsageReport {
        target_type: target.kind,
        target_name: target.name.clone(),
        gpu_usd_cost_per_minute: cost_per_minute_usd,
        month_range,
        total_jobs: rows.len() as u64,
        completed_jobs: count(JobResult::Completed),
        failed_jobs: count(JobResult::Failed),
        total_gpus_used: rows.iter().map(|row| u64::from(row.gpus_used)).sum(),
        total_gpu_seconds,
        total_gpu_minutes,
        total_gpu_hours,
        total_gpu_cost_usd: round(total_gpu_minutes * cost_per_minute_usd),
    }
}

impl UsageReport {
    /// `(name, value)` rows for the two-column table of the `charges` CLI.
    pub fn rows(&self) -> Vec<(&'static str, String)> {
        let target = match self.target_type {
            TargetType::User => "User",
            TargetType::Group => "Group",
        };
        vec![
            (target, self.target_name.clone()),
            ("Months in Report", self.month_range.to_string()),
            ("GPU Cost per Minute (USD)", self.gpu_usd_cost_per_minute.to_string()),
            ("Total Jobs", self.total_jobs.to_string()),
            ("Completed Jobs", self.completed_jobs.to_string()),
            ("Failed Jobs", self.failed_jobs.to_string()),
            ("Total GPUs Used", self.total_gpus_used.to_string()),
            ("Total GPU Seconds", self.total_gpu_seconds.to_string()),
            ("Total GPU Minutes", self.total_gpu_minutes.to_string()),
            ("Total GPU Hours", self.total_gpu_hours.to_string()),
            ("Estimated Cost (USD)", self.total_gpu_cost_usd.to_string()),
        ]
    }
}

/// Report entry points on top of a [`ChargebackStore`]. Read-only, so one instance can serve
/// concurrent requests.
#[derive(Clone)]
pub struct Reporter {
    store: Arc<dyn ChargebackStore>,
    settings: ReportSettings,
}

impl Reporter {
    pub fn new(store: Arc<dyn ChargebackStore>, settings: ReportSettings) -> Self {
        Reporter { store, settings }
    }

    pub fn store(&self) -> &dyn ChargebackStore {
        &*self.store
    }

    pub fn query(&self, months: Option<u32>, completed_only: bool) -> ReportQuery {
        let months = months.unwrap_or(self.settings.default_months);
        if completed_only {
            ReportQuery::CompletedOnly { months }
        } else {
            ReportQuery::MonthRange {
                months,
                min_duration_sec: self.settings.min_job_duration_sec,
            }
        }
    }

    /// A target without a name gets the empty report of [`UNKNOWN`].
    #[instrument(skip(self), err)]
    pub async fn report(&self, target: &ReportTarget, query: ReportQuery) -> Result<UsageReport> {
        if target.name.is_empty() {
            warn!("Report for a {} without a name, reporting on {UNKNOWN}", target.kind);
            let unknown = ReportTarget {
                kind: target.kind,
                name: UNKNOWN.to_owned(),
            };
            return Ok(build_report(&[], self.settings.gpu_usd_cost_per_minute, query.months(), &unknown));
        }
        let rows = match query {
            ReportQuery::CompletedOnly { months } => match target.kind {
                TargetType::User => self.store.query_completed_for_user(&target.name, months).await?,
                TargetType::Group => self.store.query_completed_for_group(&target.name, months).await?,
            },
            ReportQuery::MonthRange { months, min_duration_sec } => match target.kind {
                TargetType::User => {
                    self.store.query_in_month_range_for_user(&target.name, months, min_duration_sec).await?
                }
                TargetType::Group => {
                    self.store.query_in_month_range_for_group(&target.name, months, min_duration_sec).await?
                }
            },
        };
        Ok(build_report(&rows, self.settings.gpu_usd_cost_per_minute, query.months(), target))
    }

    /// Report of the group `username` was most recently billed to. Users without any chargeback
    /// record get an (empty) report for group [`UNKNOWN`] instead of an error.
    pub async fn group_report_of_user(&self, username: &str, query: ReportQuery) -> Result<UsageReport> {
        let group = match self.store.latest_group_for_user(username).await? {
            Some(group) => group,
            None => {
                warn!("No chargeback record of user `{username}`, can't tell their group");
                UNKNOWN.to_owned()
            }
        };
        self.report(&ReportTarget::group(group), query).await
    }

    pub fn today() -> NaiveDate {
        Local::now().date_naive()
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{chargeback_record, MemoryStore};

    fn row(job_result: JobResult, gpus_used: u32, duration_sec: i64) -> UsageRow {
        UsageRow {
            job_result,
            gpus_used,
            duration_sec,
        }
    }

    fn cents(value: i64, scale: u32) -> Decimal {
        Decimal::new(value, scale)
    }

    #[test]
    fn build_report__two_jobs() {
        let rows = [row(JobResult::Completed, 2, 3600), row(JobResult::Failed, 1, 1800)];
        let report = build_report(&rows, cents(8, 3), 1, &ReportTarget::user("alice"));

        assert_eq!(report.total_jobs, 2);
        assert_eq!(report.completed_jobs, 1);
        assert_eq!(report.failed_jobs, 1);
        assert_eq!(report.total_gpus_used, 3);
        assert_eq!(report.total_gpu_seconds, 9000);
        assert_eq!(report.total_gpu_minutes, cents(150_000, 3));
        assert_eq!(report.total_gpu_hours, cents(2_500, 3));
        assert_eq!(report.total_gpu_cost_usd, cents(1_200, 3));
        assert_eq!(report.total_gpu_minutes.to_string(), "150.000");
        assert_eq!(report.total_gpu_cost_usd.to_string(), "1.200");
    }

    #[test]
    fn build_report__empty() {
        let report = build_report(&[], cents(8, 3), 3, &ReportTarget::group("physics-G"));
        assert_eq!(report.total_jobs, 0);
        assert_eq!(report.total_gpu_seconds, 0);
        assert_eq!(report.total_gpu_cost_usd.to_string(), "0.000");
        assert_eq!(report.target_type, TargetType::Group);
        assert_eq!(report.month_range, 3);
    }

    #[test]
    fn build_report__gpu_seconds_weighted_by_gpu_count() {
        let rows = [
            row(JobResult::Completed, 0, 100_000),
            row(JobResult::Completed, 4, 61),
            row(JobResult::Timeout, 3, 7),
        ];
        let report = build_report(&rows, cents(8, 3), 1, &ReportTarget::user("bob"));
        assert_eq!(report.total_gpu_seconds, 4 * 61 + 3 * 7);
        assert_eq!(report.total_gpus_used, 7);
        assert_eq!(report.completed_jobs, 2);
        assert_eq!(report.failed_jobs, 0);
    }

    #[test]
    fn build_report__rounding_half_away_from_zero() {
        // 1 gpu second = 0.01666… minutes → 0.017
        let report = build_report(&[row(JobResult::Completed, 1, 1)], cents(8, 3), 1, &ReportTarget::user("a"));
        assert_eq!(report.total_gpu_minutes.to_string(), "0.017");
        assert_eq!(report.total_gpu_hours.to_string(), "0.000");
        // cost is computed from the *rounded* minutes: 0.017 * 0.008 = 0.000136
        assert_eq!(report.total_gpu_cost_usd.to_string(), "0.000");

        // 27 s = 0.45 min; 0.45 * 0.005 = 0.00225 → 0.002; 9 s → 0.0025 h → 0.003 (midpoint goes up)
        let report = build_report(&[row(JobResult::Completed, 1, 27)], cents(5, 3), 1, &ReportTarget::user("a"));
        assert_eq!(report.total_gpu_minutes.to_string(), "0.450");
        let report = build_report(&[row(JobResult::Completed, 1, 9)], cents(5, 3), 1, &ReportTarget::user("a"));
        assert_eq!(report.total_gpu_hours.to_string(), "0.003");
    }

    #[test]
    fn ReportQuery__since__calendar_months() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let query = ReportQuery::CompletedOnly { months: 1 };
        assert_eq!(query.since(today), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap().and_hms_opt(0, 0, 0).unwrap());
        let query = ReportQuery::MonthRange { months: 12, min_duration_sec: 0 };
        assert_eq!(query.since(today), NaiveDate::from_ymd_opt(2023, 3, 31).unwrap().and_hms_opt(0, 0, 0).unwrap());
    }

    #[test]
    fn ReportQuery__matches() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 20).unwrap();
        let mut record = chargeback_record(1, "alice", "physics-G");

        let completed = ReportQuery::CompletedOnly { months: 1 };
        let ranged = ReportQuery::MonthRange { months: 1, min_duration_sec: 60 };
        assert!(completed.matches(&record, today));
        assert!(ranged.matches(&record, today));

        record.job_result = JobResult::Failed;
        assert!(!completed.matches(&record, today));
        assert!(ranged.matches(&record, today));

        record.duration_sec = 59;
        assert!(!ranged.matches(&record, today));

        record.duration_sec = 3600;
        record.start_time = NaiveDate::from_ymd_opt(2020, 12, 31).unwrap().and_hms_opt(23, 59, 59).unwrap();
        assert!(!ranged.matches(&record, today));

        // ended before the window
        let record = chargeback_record(2, "alice", "physics-G");
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        assert!(!completed.matches(&record, today));
    }

    #[test]
    fn UsageReport__rows__table_order() {
        let rows = [row(JobResult::Completed, 2, 3600)];
        let report = build_report(&rows, cents(8, 3), 1, &ReportTarget::group("physics-G"));
        let rows = report.rows();
        assert_eq!(rows[0], ("Group", "physics-G".to_owned()));
        assert_eq!(rows.last().unwrap(), &("Estimated Cost (USD)", "0.960".to_owned()));
    }

    #[test]
    fn UsageReport__json__decimals_as_strings() {
        let report = build_report(&[row(JobResult::Completed, 2, 3600)], cents(8, 3), 1, &ReportTarget::user("alice"));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["target_type"], "user");
        assert_eq!(json["total_gpu_hours"], "2.000");
        assert_eq!(json["total_gpu_seconds"], 7200);
        let back: UsageReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }

    fn reporter(store: MemoryStore) -> Reporter {
        Reporter::new(
            Arc::new(store),
            ReportSettings {
                gpu_usd_cost_per_minute: cents(8, 3),
                min_job_duration_sec: 60,
                default_months: 1,
            },
        )
    }

    #[tokio::test]
    async fn Reporter__report__variants_feed_same_aggregation() {
        let store = MemoryStore::default();
        let now = Local::now().naive_local();
        let mut completed = chargeback_record(1, "alice", "physics-G");
        completed.end_time = now;
        let mut failed = chargeback_record(2, "alice", "physics-G");
        failed.end_time = now;
        failed.job_result = JobResult::Failed;
        let mut short = chargeback_record(3, "alice", "physics-G");
        short.end_time = now;
        short.duration_sec = 10;
        let mut other_user = chargeback_record(4, "bob", "physics-G");
        other_user.end_time = now;
        store.insert(&[completed, failed, short, other_user]).await;

        let reporter = reporter(store);
        let user = ReportTarget::user("alice");

        let report = reporter.report(&user, reporter.query(None, true)).await.unwrap();
        assert_eq!((report.total_jobs, report.completed_jobs, report.failed_jobs), (2, 2, 0));

        let report = reporter.report(&user, reporter.query(None, false)).await.unwrap();
        assert_eq!((report.total_jobs, report.completed_jobs, report.failed_jobs), (2, 1, 1));

        let report = reporter.report(&ReportTarget::group("physics-G"), reporter.query(Some(2), false)).await.unwrap();
        assert_eq!(report.total_jobs, 3);
        assert_eq!(report.month_range, 2);
    }

    #[tokio::test]
    async fn Reporter__group_report_of_user__unknown_user() {
        let reporter = reporter(MemoryStore::default());
        let report = reporter.group_report_of_user("nobody", reporter.query(None, false)).await.unwrap();
        assert_eq!(report.target_name, UNKNOWN);
        assert_eq!(report.total_jobs, 0);
    }

    #[tokio::test]
    async fn Reporter__report__empty_name_reports_unknown() {
        let store = MemoryStore::default();
        store.insert(&[chargeback_record(1, "", "physics-G")]).await;
        let reporter = reporter(store);

        let report = reporter.report(&ReportTarget::user(""), reporter.query(None, false)).await.unwrap();
        assert_eq!(report.target_type, TargetType::User);
        assert_eq!(report.target_name, UNKNOWN);
        assert_eq!(report.total_jobs, 0);
    }
}
