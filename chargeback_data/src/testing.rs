//! In-memory stand-ins for the accounting DB, the chargeback DB, the identity lookup and the
//! notification sink, plus record builders. Only built for tests and the `testing` feature.
use std::{
    collections::HashSet,
    ops::RangeInclusive,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use color_eyre::{eyre::eyre, Result};
use itertools::Itertools as _;
use tokio::sync::Mutex;

use crate::{
    identity::{AccountAssociation, IdentitySnapshot},
    job::{ChargebackRecord, JobResult, RawJobRecord, UsageRow},
    notify::Notifier,
    report::{ReportQuery, ReportTarget},
    slurm::AccountingSource,
    store::ChargebackStore,
};

pub const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
alice:x:1001:2001:Alice:/home/alice:/bin/bash
bob:x:1002:100:Bob:/home/bob:/bin/bash
";

pub const GROUP: &str = "\
users:x:100:
alice:x:2001:
physics-G:x:3001:alice
chemistry-G:x:3002:bob
";

/// alice (1001) is in `physics-G`, bob (1002) in `chemistry-G`.
pub fn identity() -> IdentitySnapshot {
    IdentitySnapshot::parse(PASSWD, GROUP)
}

/// A finished one-hour single-GPU job of alice, started 2024-03-01 10:00 UTC.
pub fn raw_job(source_job_id: u64) -> RawJobRecord {
    let time_start = 1_709_287_200;
    RawJobRecord {
        job_name: format!("train-{source_job_id}"),
        source_job_id,
        time_start,
        time_end: time_start + 3600,
        cpus_requested: 4,
        exit_code: 0,
        user_id: 1001,
        group_id: 2001,
        node_list: "dgx01".to_owned(),
        nodes_allocated: 1,
        state_code: 3,
        resource_request_encoding: Some("1=4,2=10240,4=1,1001=1".to_owned()),
        account_name: None,
        partition: "gpu".to_owned(),
    }
}

/// A completed one-hour single-GPU job from 2024-03-01 10:00:00 to 11:00:00.
pub fn chargeback_record(source_job_id: u64, user_name: &str, group_name: &str) -> ChargebackRecord {
    let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap_or_default();
    let start_time = day.and_hms_opt(10, 0, 0).unwrap_or_default();
    ChargebackRecord {
        job_name: format!("train-{source_job_id}"),
        source_job_id,
        start_time,
        end_time: start_time + chrono::Duration::hours(1),
        duration_sec: 3600,
        cpus_requested: 4,
        exit_code: 0,
        user_id: 1001,
        group_id: 2001,
        user_name: user_name.to_owned(),
        group_name: group_name.to_owned(),
        node_list: "dgx01".to_owned(),
        nodes_allocated: 1,
        state_code: 3,
        job_result: JobResult::Completed,
        gpus_requested: 1,
        gpus_used: 1,
        partition: "gpu".to_owned(),
    }
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<ChargebackRecord>>,
    failing_ids: Mutex<HashSet<u64>>,
}

impl MemoryStore {
    /// Bypasses the dedup check, for setting up report tests.
    pub async fn insert(&self, records: &[ChargebackRecord]) {
        self.records.lock().await.extend_from_slice(records);
    }

    pub async fn records(&self) -> Vec<ChargebackRecord> {
        self.records.lock().await.clone()
    }

    /// Makes [`ChargebackStore::insert_job`] fail for this id.
    pub async fn fail_inserts_of(&self, source_job_id: u64) {
        self.failing_ids.lock().await.insert(source_job_id);
    }
}

#[async_trait]
impl ChargebackStore for MemoryStore {
    async fn job_exists(&self, source_job_id: u64) -> Result<bool> {
        Ok(self.records.lock().await.iter().any(|r| r.source_job_id == source_job_id))
    }

    async fn insert_job(&self, record: &ChargebackRecord) -> Result<bool> {
        if self.failing_ids.lock().await.contains(&record.source_job_id) {
            return Err(eyre!("connection reset while inserting job {}", record.source_job_id));
        }
        let mut records = self.records.lock().await;
        if records.iter().any(|r| r.source_job_id == record.source_job_id) {
            return Ok(false);
        }
        records.push(record.clone());
        Ok(true)
    }

    async fn query_usage(&self, target: &ReportTarget, query: &ReportQuery) -> Result<Vec<UsageRow>> {
        let today = Local::now().date_naive();
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| target.matches(r) && query.matches(r, today))
            .map(UsageRow::from)
            .collect())
    }

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<ChargebackRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .sorted_by(|a, b| b.end_time.cmp(&a.end_time))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn jobs_for_user(&self, username: &str, months: u32) -> Result<Vec<ChargebackRecord>> {
        let today = Local::now().date_naive();
        let target = ReportTarget::user(username);
        let query = ReportQuery::CompletedOnly { months };
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| target.matches(r) && query.matches(r, today))
            .sorted_by(|a, b| b.end_time.cmp(&a.end_time))
            .cloned()
            .collect())
    }

    async fn latest_group_for_user(&self, username: &str) -> Result<Option<String>> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| r.user_name == username)
            .max_by_key(|r| r.end_time)
            .map(|r| r.group_name.clone()))
    }
}

pub struct MemorySource {
    jobs: Vec<RawJobRecord>,
    associations: Option<Vec<AccountAssociation>>,
    fail: bool,
}

impl MemorySource {
    pub fn new(jobs: Vec<RawJobRecord>) -> Self {
        MemorySource {
            jobs,
            associations: Some(Vec::new()),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        MemorySource {
            jobs: Vec::new(),
            associations: None,
            fail: true,
        }
    }

    pub fn with_associations(mut self, associations: Vec<AccountAssociation>) -> Self {
        self.associations = Some(associations);
        self
    }

    /// Fetching associations fails, jobs still work.
    pub fn without_associations(mut self) -> Self {
        self.associations = None;
        self
    }
}

#[async_trait]
impl AccountingSource for MemorySource {
    async fn jobs_in_range(&self, window: RangeInclusive<i64>) -> Result<Vec<RawJobRecord>> {
        if self.fail {
            return Err(eyre!("Can't connect to MySQL server"));
        }
        Ok(self
            .jobs
            .iter()
            .filter(|job| window.contains(&job.time_end) && job.has_started())
            .cloned()
            .collect())
    }

    async fn account_associations(&self) -> Result<Vec<AccountAssociation>> {
        self.associations.clone().ok_or_else(|| eyre!("Table 'slurm_acct_db.dgx_assoc_table' doesn't exist"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Success { log: PathBuf, inserted: usize },
    Failure { log: PathBuf },
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_success(&self, log: &Path, inserted: usize) -> Result<()> {
        self.sent.lock().await.push(Notification::Success {
            log: log.to_owned(),
            inserted,
        });
        Ok(())
    }

    async fn send_failure(&self, log: &Path) -> Result<()> {
        self.sent.lock().await.push(Notification::Failure { log: log.to_owned() });
        Ok(())
    }
}
