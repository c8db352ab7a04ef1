//! # Jobs
//!
//! Polling jobs shipped with ferrowatch.
//!
//! | Job | Subjects | Fields | Alerts |
//! |-----|----------|--------|--------|
//! | [`UserStatusJob`] | `user:<id>` | education, investment, profile, daily tasks, refills | none |
//! | [`FactionChainJob`] | `faction:<id>` | chain | chain timeout |
//! | [`MarketWatchJob`] | `item:<id>` | market price | price below target |

mod faction_chain;
mod market_watch;
mod user_status;

use std::time::Duration;

use serde_json::{Map, Value};

pub use faction_chain::{FactionChainJob, FactionWatch, FACTION_CHAIN_JOB};
pub use market_watch::{MarketWatchJob, PriceWatch, MARKET_WATCH_JOB};
pub use user_status::{UserStatusJob, UserWatch, USER_STATUS_JOB};

use crate::domain::UtcDateTime;
use crate::partner_api::RawResponse;
use crate::SyncError;

fn object<'a>(raw: &'a RawResponse, key: &str) -> Result<&'a Map<String, Value>, SyncError> {
    raw.get(key)
        .and_then(Value::as_object)
        .ok_or_else(|| SyncError::Transform(format!("response has no '{key}' object")))
}

fn integer(map: &Map<String, Value>, key: &str) -> Result<i64, SyncError> {
    map.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| SyncError::Transform(format!("'{key}' is missing or not an integer")))
}

fn top_level_integer(raw: &RawResponse, key: &str) -> Result<i64, SyncError> {
    raw.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| SyncError::Transform(format!("'{key}' is missing or not an integer")))
}

/// `now + seconds`, or `None` for non-positive remainders.
fn expires_in(now: UtcDateTime, seconds: i64) -> Option<UtcDateTime> {
    u64::try_from(seconds)
        .ok()
        .filter(|seconds| *seconds > 0)
        .and_then(|seconds| now.checked_add(Duration::from_secs(seconds)))
}

#[cfg(test)]
fn raw(value: Value) -> RawResponse {
    match value {
        Value::Object(body) => RawResponse::new(body),
        other => panic!("test payload must be an object, got {other}"),
    }
}
