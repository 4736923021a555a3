use tracing::{debug, instrument, warn};

use crate::{
    identity::{resolve_group_name, resolve_username, AccountAssociation, AssocBackend, IdentityResolver},
    job::{ChargebackRecord, JobResult, RawJobRecord},
    slurm::local_datetime,
    tres::gpu_count,
};

/// Turns [`RawJobRecord`]s into [`ChargebackRecord`]s. Lookup failures never fail a record, they
/// end up as `UNKNOWN` names or 0 GPUs.
pub struct Normalizer<'a> {
    pub identity: &'a dyn IdentityResolver,
    pub backend: AssocBackend,
    pub associations: &'a [AccountAssociation],
    /// Jobs in exactly this partition are skipped. Empty: nothing is skipped.
    pub partition_filter: &'a str,
}

impl Normalizer<'_> {
    pub fn is_filtered(&self, job: &RawJobRecord) -> bool {
        !self.partition_filter.is_empty() && job.partition == self.partition_filter
    }

    /// `None` if the job is in the filtered partition (or its times can't be represented).
    #[instrument(skip_all, fields(job = job.source_job_id))]
    pub async fn normalize(&self, job: &RawJobRecord) -> Option<ChargebackRecord> {
        if self.is_filtered(job) {
            debug!("Skipping job in partition `{}`", job.partition);
            return None;
        }

        let (Some(start_time), Some(end_time)) = (local_datetime(job.time_start), local_datetime(job.time_end)) else {
            warn!(job.time_start, job.time_end, "Job times out of range, skipping job");
            return None;
        };

        let user_name = resolve_username(self.identity, job.user_id).await;
        let group_name = resolve_group_name(
            job.account_name.as_deref(),
            &user_name,
            self.backend,
            self.associations,
            self.identity,
        )
        .await;
        let gpus = gpu_count(job.resource_request_encoding.as_deref());

        Some(ChargebackRecord {
            job_name: job.job_name.clone(),
            source_job_id: job.source_job_id,
            start_time,
            end_time,
            duration_sec: job.duration_sec(),
            cpus_requested: job.cpus_requested,
            exit_code: job.exit_code,
            user_id: job.user_id,
            group_id: job.group_id,
            user_name,
            group_name,
            node_list: job.node_list.clone(),
            nodes_allocated: job.nodes_allocated,
            state_code: job.state_code,
            job_result: JobResult::from_state_code(job.state_code),
            // Slurm doesn't track actual GPU usage, so both are what was requested
            gpus_requested: gpus,
            gpus_used: gpus,
            partition: job.partition.clone(),
        })
    }
}
