//! One chargeback run: fetch the last days of finished jobs from Slurm, normalize them and store
//! the ones the chargeback table doesn't know yet.
use chrono::{DateTime, TimeZone};
use color_eyre::{eyre::Context as _, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{
    identity::{AssocBackend, IdentityResolver},
    job::ChargebackRecord,
    normalize::Normalizer,
    slurm::{day_window, AccountingSource},
    store::ChargebackStore,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestOptions {
    pub lookback_days: u32,
    pub partition_filter: String,
    pub assoc_backend: AssocBackend,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    /// `[start, end]` in unix seconds
    pub window: (i64, i64),
    pub fetched: usize,
    /// filtered partition or unrepresentable times
    pub skipped: usize,
    /// already in the chargeback table
    pub duplicates: usize,
    pub inserted: Vec<ChargebackRecord>,
}

impl IngestOutcome {
    pub fn inserted_count(&self) -> usize {
        self.inserted.len()
    }
}

pub struct Ingestor<'a> {
    pub source: &'a dyn AccountingSource,
    pub store: &'a dyn ChargebackStore,
    pub identity: &'a dyn IdentityResolver,
}

impl Ingestor<'_> {
    /// Errors if the jobs or associations can't be fetched, or if the chargeback table refuses a
    /// record. Records stored before such an error stay stored, the next run skips them.
    #[instrument(skip_all, fields(lookback_days = options.lookback_days, backend = ?options.assoc_backend))]
    pub async fn run<Tz: TimeZone>(&self, options: &IngestOptions, now: &DateTime<Tz>) -> Result<IngestOutcome> {
        let window = day_window(now, options.lookback_days)?;
        info!("Fetching jobs that ended between {} and {}", window.start(), window.end());

        let jobs = self
            .source
            .jobs_in_range(window.clone())
            .await
            .wrap_err("fetching jobs from the Slurm accounting DB")?;
        let associations = match options.assoc_backend {
            AssocBackend::SlurmAcctdb => self
                .source
                .account_associations()
                .await
                .wrap_err("fetching associations from the Slurm accounting DB")?,
            AssocBackend::EtcGroup => Vec::new(),
        };
        info!("Found {} jobs to process", jobs.len());

        let normalizer = Normalizer {
            identity: self.identity,
            backend: options.assoc_backend,
            associations: &associations,
            partition_filter: &options.partition_filter,
        };

        let mut outcome = IngestOutcome {
            window: (*window.start(), *window.end()),
            fetched: jobs.len(),
            ..Default::default()
        };
        // strictly one job after the other, exists-then-insert is not atomic
        for job in jobs.iter().filter(|job| job.has_started()) {
            let Some(record) = normalizer.normalize(job).await else {
                outcome.skipped += 1;
                continue;
            };
            let stored = self
                .store_record(&record)
                .await
                .wrap_err_with(|| format!("storing job {} in the chargeback table", record.source_job_id))?;
            if stored {
                outcome.inserted.push(record);
            } else {
                info!("No update needed, slurm_id_job={} already exists", record.source_job_id);
                outcome.duplicates += 1;
            }
        }
        outcome.skipped += jobs.iter().filter(|job| !job.has_started()).count();

        info!(
            fetched = outcome.fetched,
            skipped = outcome.skipped,
            duplicates = outcome.duplicates,
            inserted = outcome.inserted_count(),
            "Chargeback run finished"
        );
        Ok(outcome)
    }

    async fn store_record(&self, record: &ChargebackRecord) -> Result<bool> {
        if self.store.job_exists(record.source_job_id).await? {
            return Ok(false);
        }
        self.store.insert_job(record).await
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{identity, raw_job, MemorySource, MemoryStore};
    use chrono::{Local, TimeZone as _};

    fn options(partition_filter: &str) -> IngestOptions {
        IngestOptions {
            lookback_days: 3,
            partition_filter: partition_filter.to_owned(),
            assoc_backend: AssocBackend::EtcGroup,
        }
    }

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 10, 6, 0, 0).earliest().unwrap()
    }

    /// Job that ended an hour before `now`'s midnight.
    fn job_in_window(id: u64) -> crate::job::RawJobRecord {
        let midnight = Local.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).earliest().unwrap().timestamp();
        let mut job = raw_job(id);
        job.time_end = midnight - 3600;
        job.time_start = job.time_end - 7200;
        job
    }

    #[test_log::test(tokio::test)]
    async fn Ingestor__run__idempotent() {
        let source = MemorySource::new(vec![job_in_window(1), job_in_window(2)]);
        let store = MemoryStore::default();
        let identity = identity();
        let ingestor = Ingestor {
            source: &source,
            store: &store,
            identity: &identity,
        };

        let first = ingestor.run(&options(""), &now()).await.unwrap();
        assert_eq!(first.inserted_count(), 2);
        assert_eq!(first.duplicates, 0);

        let second = ingestor.run(&options(""), &now()).await.unwrap();
        assert_eq!(second.inserted_count(), 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(store.records().await.len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn Ingestor__run__partition_filter_and_unstarted_jobs() {
        let mut debug = job_in_window(1);
        debug.partition = "debug".to_owned();
        let mut never_started = job_in_window(2);
        never_started.time_start = 0;
        let source = MemorySource::new(vec![debug, never_started, job_in_window(3)]);
        let store = MemoryStore::default();
        let identity = identity();
        let ingestor = Ingestor {
            source: &source,
            store: &store,
            identity: &identity,
        };

        let outcome = ingestor.run(&options("debug"), &now()).await.unwrap();
        assert_eq!(outcome.fetched, 2);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.inserted.iter().map(|r| r.source_job_id).collect::<Vec<_>>(), [3]);
    }

    #[test_log::test(tokio::test)]
    async fn Ingestor__run__only_jobs_in_window() {
        let mut today = job_in_window(1);
        today.time_end += 4 * 3600;
        let mut long_ago = job_in_window(2);
        long_ago.time_end -= 10 * 24 * 3600;
        long_ago.time_start = long_ago.time_end - 60;
        let source = MemorySource::new(vec![today, long_ago, job_in_window(3)]);
        let store = MemoryStore::default();
        let identity = identity();
        let ingestor = Ingestor {
            source: &source,
            store: &store,
            identity: &identity,
        };

        let outcome = ingestor.run(&options(""), &now()).await.unwrap();
        assert_eq!(outcome.inserted.iter().map(|r| r.source_job_id).collect::<Vec<_>>(), [3]);
        assert_eq!(outcome.window.1 - outcome.window.0, 3 * 24 * 3600);
    }

    #[test_log::test(tokio::test)]
    async fn Ingestor__run__source_failure_is_fatal() {
        let source = MemorySource::failing();
        let store = MemoryStore::default();
        let identity = identity();
        let ingestor = Ingestor {
            source: &source,
            store: &store,
            identity: &identity,
        };
        assert!(ingestor.run(&options(""), &now()).await.is_err());

        // associations are only needed (and fetched) for the acctdb backend
        let source = MemorySource::new(vec![job_in_window(1)]).without_associations();
        let ingestor = Ingestor {
            source: &source,
            store: &store,
            identity: &identity,
        };
        assert!(ingestor.run(&options(""), &now()).await.is_ok());
        let acctdb = IngestOptions {
            assoc_backend: AssocBackend::SlurmAcctdb,
            ..options("")
        };
        assert!(ingestor.run(&acctdb, &now()).await.is_err());
    }

    #[test_log::test(tokio::test)]
    async fn Ingestor__run__store_failure_aborts() {
        let source = MemorySource::new(vec![job_in_window(1), job_in_window(2), job_in_window(3)]);
        let store = MemoryStore::default();
        store.fail_inserts_of(2).await;
        let identity = identity();
        let ingestor = Ingestor {
            source: &source,
            store: &store,
            identity: &identity,
        };

        let error = ingestor.run(&options(""), &now()).await.unwrap_err();
        assert!(format!("{error:#}").contains("storing job 2"));
        let stored = store.records().await.iter().map(|r| r.source_job_id).collect::<Vec<_>>();
        assert_eq!(stored, [1]);
    }
}
