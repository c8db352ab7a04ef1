use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{expires_in, integer, object, top_level_integer};
use crate::domain::{FieldKind, SubjectKey, UtcDateTime};
use crate::partner_api::{ApiRequest, ApiSection, RawResponse};
use crate::polling::{FieldSnapshot, JobSpec, PollTarget};
use crate::rotation::{Credential, CredentialRotator};
use crate::staleness::FieldMetadata;
use crate::SyncError;

pub const USER_STATUS_JOB: &str = "user_status";

const PROFILE_KEYS: [&str; 5] = ["player_id", "name", "level", "status", "last_action"];
const REFILL_SUFFIX: &str = "_refill_used";

/// A user polled with their own key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserWatch {
    pub user_id: u64,
    pub api_key: String,
}

/// Keeps each user's education, investment, profile, daily tasks and refills
/// current. All five live in the user section, so the stale ones of a user
/// are fetched in one call.
#[derive(Debug, Clone)]
pub struct UserStatusJob {
    users: Vec<UserWatch>,
}

impl UserStatusJob {
    pub fn new(users: Vec<UserWatch>) -> Self {
        Self { users }
    }

    const FIELDS: [FieldKind; 5] = [
        FieldKind::Education,
        FieldKind::Investment,
        FieldKind::Profile,
        FieldKind::DailyTasks,
        FieldKind::Refills,
    ];
}

fn selection(kind: FieldKind) -> Option<&'static str> {
    match kind {
        FieldKind::Education => Some("education"),
        FieldKind::Investment => Some("money"),
        FieldKind::Profile => Some("profile"),
        FieldKind::DailyTasks => Some("dailytasks"),
        FieldKind::Refills => Some("refills"),
        FieldKind::Chain | FieldKind::MarketPrice => None,
    }
}

impl JobSpec for UserStatusJob {
    fn name(&self) -> &str {
        USER_STATUS_JOB
    }

    fn targets(&self, _rotator: &CredentialRotator) -> Vec<PollTarget> {
        self.users
            .iter()
            .map(|user| PollTarget {
                subject: SubjectKey::user(user.user_id),
                credential: Credential::new(format!("user:{}", user.user_id), &user.api_key),
                deliver_to: None,
            })
            .collect()
    }

    fn fields(&self, _subject: SubjectKey) -> Vec<FieldKind> {
        Self::FIELDS.to_vec()
    }

    fn request(&self, _subject: SubjectKey, kind: FieldKind) -> Result<ApiRequest, SyncError> {
        let selection = selection(kind).ok_or_else(|| {
            SyncError::Transform(format!("{kind} is not a user status field"))
        })?;
        // The key belongs to the subject, so the call addresses "self".
        Ok(ApiRequest::new(ApiSection::User, None, [selection])?)
    }

    fn transform(
        &self,
        _subject: SubjectKey,
        kind: FieldKind,
        raw: &RawResponse,
        now: UtcDateTime,
    ) -> Result<FieldSnapshot, SyncError> {
        match kind {
            FieldKind::Education => education(raw, now),
            FieldKind::Investment => investment(raw, now),
            FieldKind::Profile => profile(raw, now),
            FieldKind::DailyTasks => daily_tasks(raw, now),
            FieldKind::Refills => refills(raw, now),
            other => Err(SyncError::Transform(format!(
                "{other} is not a user status field"
            ))),
        }
    }
}

fn education(raw: &RawResponse, now: UtcDateTime) -> Result<FieldSnapshot, SyncError> {
    let course = top_level_integer(raw, "education_current")?;
    let time_left = top_level_integer(raw, "education_timeleft")?;

    let metadata = match expires_in(now, time_left) {
        Some(ends_at) if course > 0 => FieldMetadata::fetched_at(now).active_until(ends_at),
        _ => FieldMetadata::fetched_at(now),
    };
    Ok(FieldSnapshot {
        value: json!({ "course": course, "time_left": time_left }),
        metadata,
    })
}

fn investment(raw: &RawResponse, now: UtcDateTime) -> Result<FieldSnapshot, SyncError> {
    let bank = object(raw, "city_bank")?;
    let amount = integer(bank, "amount")?;
    let time_left = integer(bank, "time_left")?;

    let metadata = match expires_in(now, time_left) {
        Some(matures_at) if amount > 0 => FieldMetadata::fetched_at(now).active_until(matures_at),
        _ => FieldMetadata::fetched_at(now),
    };
    Ok(FieldSnapshot {
        value: json!({ "amount": amount, "time_left": time_left }),
        metadata,
    })
}

fn profile(raw: &RawResponse, now: UtcDateTime) -> Result<FieldSnapshot, SyncError> {
    top_level_integer(raw, "level")?;

    let value: Map<String, Value> = PROFILE_KEYS
        .iter()
        .filter_map(|key| raw.get(key).map(|value| ((*key).to_owned(), value.clone())))
        .collect();
    Ok(FieldSnapshot {
        value: Value::Object(value),
        metadata: FieldMetadata::fetched_at(now).with_active(true),
    })
}

fn daily_tasks(raw: &RawResponse, now: UtcDateTime) -> Result<FieldSnapshot, SyncError> {
    let tasks = object(raw, "daily_tasks")?;
    let done = integer(tasks, "done")?;
    let target = integer(tasks, "target")?;

    Ok(FieldSnapshot {
        value: json!({ "done": done, "target": target }),
        metadata: FieldMetadata::fetched_at(now).with_completed(target > 0 && done >= target),
    })
}

fn refills(raw: &RawResponse, now: UtcDateTime) -> Result<FieldSnapshot, SyncError> {
    let refills = object(raw, "refills")?;

    let mut metadata = FieldMetadata::fetched_at(now);
    let mut value = Map::new();
    for (key, used) in refills {
        let Some(name) = key.strip_suffix(REFILL_SUFFIX) else {
            continue;
        };
        let used = used.as_bool().ok_or_else(|| {
            SyncError::Transform(format!("'{key}' is not a boolean"))
        })?;
        metadata = metadata.with_sub_item(name, used);
        value.insert(name.to_owned(), Value::Bool(used));
    }

    if value.is_empty() {
        return Err(SyncError::Transform(String::from(
            "refills object has no refill flags",
        )));
    }
    Ok(FieldSnapshot {
        value: Value::Object(value),
        metadata,
    })
}
