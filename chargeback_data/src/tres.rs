//! Slurm stores trackable resources (TRES) requested by a job as `id=count` pairs, e.g.
//! `1=4,2=10240,4=1,5=4,1001=1` (4 cpus, 10240M mem, 1 node, billing 4, 1 GPU).
use std::{collections::HashMap, num::ParseIntError};

use itertools::Itertools as _;
use thiserror::Error;
use tracing::{debug, error, warn};

/// TRES id of `gres/gpu` in `tres_table` (first gres registered).
pub const TRES_GPU: i64 = 1001;

#[derive(Debug, Error)]
pub enum TresParseError {
    #[error("`{0}` is not a `key=value` pair")]
    NotAPair(String),
    #[error("`{pair}`: {source}")]
    NotANumber {
        pair: String,
        #[source]
        source: ParseIntError,
    },
}

/// Parses the whole encoding, failing if any single pair is malformed.
pub fn parse_tres(encoding: &str) -> Result<HashMap<i64, i64>, TresParseError> {
    encoding
        .split(',')
        .map(|pair| {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(TresParseError::NotAPair(pair.to_owned()));
            };
            let parse = |s: &str| {
                s.trim().parse::<i64>().map_err(|source| TresParseError::NotANumber {
                    pair: pair.to_owned(),
                    source,
                })
            };
            Ok((parse(key)?, parse(value)?))
        })
        .process_results(|pairs| pairs.collect())
}

/// Number of GPUs requested by a job. Anything that can't be parsed counts as 0 GPUs, so a broken
/// `tres_req` never stops a job from being recorded (it just won't be charged for GPUs).
pub fn gpu_count(encoding: Option<&str>) -> u32 {
    let Some(encoding) = encoding.filter(|e| !e.trim().is_empty()) else {
        warn!("No content found in tres_req field, setting GPU count to 0");
        return 0;
    };
    debug!(encoding, "parsing tres_req");

    let tres = match parse_tres(encoding) {
        Ok(tres) => tres,
        Err(e) => {
            error!("Failed to parse tres_req field `{encoding}`, users will not be charged for GPU utilization: {e}");
            return 0;
        }
    };

    match tres.get(&TRES_GPU) {
        Some(&count) => u32::try_from(count).unwrap_or_else(|_| {
            error!(count, "GPU count in tres_req out of range, setting GPU count to 0");
            0
        }),
        None => {
            warn!("GPU type ({TRES_GPU}) not found in tres_req field, setting GPU count to 0");
            0
        }
    }
}
