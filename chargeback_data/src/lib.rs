// Turns Slurm accounting records into chargeback records and chargeback records into usage
// reports. Everything that talks to the outside world (accounting DB, chargeback DB, identity
// lookups, notifications) sits behind the traits in `slurm`, `store`, `identity` and `notify`.
pub mod identity;
pub mod ingest;
pub mod job;
pub mod normalize;
pub mod notify;
pub mod report;
pub mod settings;
pub mod slurm;
pub mod store;
pub mod tres;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Sentinel for every name (user, group, account, job result) that could not be resolved.
pub const UNKNOWN: &str = "UNKNOWN";
