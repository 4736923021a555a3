use std::{fmt, str::FromStr};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One row of `<cluster>_job_table` in `slurm_acct_db`, as far as chargeback cares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawJobRecord {
    pub job_name: String,
    pub source_job_id: u64,
    /// unix seconds, `0` if the job never started
    pub time_start: i64,
    /// unix seconds
    pub time_end: i64,
    pub cpus_requested: u32,
    pub exit_code: i32,
    pub user_id: u32,
    pub group_id: u32,
    pub node_list: String,
    pub nodes_allocated: u32,
    pub state_code: u32,
    /// `tres_req`, e.g. `1=4,2=10240,4=1,5=4,1001=1`
    pub resource_request_encoding: Option<String>,
    pub account_name: Option<String>,
    pub partition: String,
}

impl RawJobRecord {
    pub fn has_started(&self) -> bool {
        self.time_start > 0
    }

    /// Never negative, even if the accounting DB has `time_end < time_start`.
    pub fn duration_sec(&self) -> i64 {
        (self.time_end - self.time_start).max(0)
    }
}

/// Normalized, billing-ready job. `source_job_id` is the dedup key of the chargeback store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargebackRecord {
    pub job_name: String,
    pub source_job_id: u64,
    #[serde(with = "chargeback_datetime")]
    pub start_time: NaiveDateTime,
    #[serde(with = "chargeback_datetime")]
    pub end_time: NaiveDateTime,
    pub duration_sec: i64,
    pub cpus_requested: u32,
    pub exit_code: i32,
    pub user_id: u32,
    pub group_id: u32,
    pub user_name: String,
    pub group_name: String,
    pub node_list: String,
    pub nodes_allocated: u32,
    pub state_code: u32,
    pub job_result: JobResult,
    pub gpus_requested: u32,
    pub gpus_used: u32,
    pub partition: String,
}

/// The part of a [`ChargebackRecord`] the report engine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRow {
    pub job_result: JobResult,
    pub gpus_used: u32,
    pub duration_sec: i64,
}

impl From<&ChargebackRecord> for UsageRow {
    fn from(record: &ChargebackRecord) -> Self {
        UsageRow {
            job_result: record.job_result,
            gpus_used: record.gpus_used,
            duration_sec: record.duration_sec,
        }
    }
}

/// Friendly name of a Slurm job state id.
///
/// See `enum job_states` in `slurm.h`; anything outside of it (including state ids with flag bits
/// set) is [`JobResult::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobResult {
    Pending,
    Running,
    Suspended,
    Completed,
    Cancelled,
    Failed,
    Timeout,
    NodeFail,
    Preempted,
    End,
    Unknown,
}

impl JobResult {
    pub const ALL: [JobResult; 11] = [
        JobResult::Pending,
        JobResult::Running,
        JobResult::Suspended,
        JobResult::Completed,
        JobResult::Cancelled,
        JobResult::Failed,
        JobResult::Timeout,
        JobResult::NodeFail,
        JobResult::Preempted,
        JobResult::End,
        JobResult::Unknown,
    ];

    pub fn from_state_code(state: u32) -> Self {
        match state {
            0 => JobResult::Pending,
            1 => JobResult::Running,
            2 => JobResult::Suspended,
            3 => JobResult::Completed,
            4 => JobResult::Cancelled,
            5 => JobResult::Failed,
            6 => JobResult::Timeout,
            7 => JobResult::NodeFail,
            8 => JobResult::Preempted,
            9 => JobResult::End,
            _ => JobResult::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobResult::Pending => "PENDING",
            JobResult::Running => "RUNNING",
            JobResult::Suspended => "SUSPENDED",
            JobResult::Completed => "COMPLETED",
            JobResult::Cancelled => "CANCELLED",
            JobResult::Failed => "FAILED",
            JobResult::Timeout => "TIMEOUT",
            JobResult::NodeFail => "NODE_FAIL",
            JobResult::Preempted => "PREEMPTED",
            JobResult::End => "END",
            JobResult::Unknown => crate::UNKNOWN,
        }
    }
}

/// `format_slurm_job_state(3) == "COMPLETED"`
pub fn format_slurm_job_state(state: u32) -> &'static str {
    JobResult::from_state_code(state).as_str()
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("`{0}` is not a job result")]
pub struct ParseJobResultError(String);

impl FromStr for JobResult {
    type Err = ParseJobResultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobResult::ALL
            .into_iter()
            .find(|result| result.as_str() == s)
            .ok_or_else(|| ParseJobResultError(s.to_owned()))
    }
}

/// `%Y-%m-%d %H:%M:%S`, the MySQL `DATETIME` literal format the chargeback table has always used.
pub mod chargeback_datetime {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(datetime: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&datetime.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let input = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&input, FORMAT).map_err(serde::de::Error::custom)
    }
}
