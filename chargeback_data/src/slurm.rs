use std::ops::RangeInclusive;

use async_trait::async_trait;
use chrono::{DateTime, Days, Local, NaiveDate, NaiveDateTime, TimeZone};
use color_eyre::{eyre::eyre, Result};

use crate::{identity::AccountAssociation, job::RawJobRecord};

/// The Slurm accounting database (`slurm_acct_db`).
#[async_trait]
pub trait AccountingSource: Send + Sync {
    /// Jobs with `time_end` inside `window` (unix seconds, inclusive) that actually started.
    async fn jobs_in_range(&self, window: RangeInclusive<i64>) -> Result<Vec<RawJobRecord>>;

    /// All non-deleted associations that belong to a user.
    async fn account_associations(&self) -> Result<Vec<AccountAssociation>>;
}

/// `[midnight lookback_days ago, last midnight]` in unix seconds.
///
/// Only whole days: whatever happened since the last midnight is picked up by tomorrow's run.
pub fn day_window<Tz: TimeZone>(now: &DateTime<Tz>, lookback_days: u32) -> Result<RangeInclusive<i64>> {
    let today = now.date_naive();
    let start_day = today
        .checked_sub_days(Days::new(lookback_days.into()))
        .ok_or_else(|| eyre!("{lookback_days} days before {today} is out of range"))?;

    let start = local_midnight(&now.timezone(), start_day)?;
    let end = local_midnight(&now.timezone(), today)?;
    Ok(start..=end)
}

/// Unix timestamp of the first instant of `day` in `tz`. Some zones skip midnight on DST change;
/// then the day starts at the earliest time that exists.
fn local_midnight<Tz: TimeZone>(tz: &Tz, day: NaiveDate) -> Result<i64> {
    (0..24)
        .filter_map(|hour| day.and_hms_opt(hour, 0, 0))
        .find_map(|time| tz.from_local_datetime(&time).earliest())
        .map(|datetime| datetime.timestamp())
        .ok_or_else(|| eyre!("{day} has no representable start in the local timezone"))
}

/// Unix seconds → local wall-clock time, which is how the chargeback table stores times.
pub fn local_datetime(unix: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp(unix, 0).map(|utc| utc.with_timezone(&Local).naive_local())
}
