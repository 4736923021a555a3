use derive_more::derive::{Deref, Display, Into};
use poem_openapi::NewType;

/*
NOTE the report itself goes out as `Json<serde_json::Value>`: `rust_decimal::Decimal` has no
`poem_openapi::Type`, and the numbers have to stay strings with exactly 3 decimals anyways.
*/

/// Slurm login name, as stored in the chargeback table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, NewType, Deref, Into, Display)]
pub struct SlurmUser(pub String);

/// Billing group: a `*-G` unix group or a Slurm account, depending on the collector's backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, NewType, Deref, Into, Display)]
pub struct GroupName(pub String);

pub const DEFAULT_JOB_LIMIT: usize = 10;
