use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::cache::CachedField;
use crate::domain::{FieldKind, SubjectKey, UtcDateTime};
use crate::gate::AlertClass;
use crate::notify::DeliveryTarget;
use crate::partner_api::{ApiRequest, ApiSection, RawResponse};
use crate::polling::{AlertCandidate, FieldSnapshot, JobSpec, PollTarget};
use crate::rotation::{Credential, CredentialRotator};
use crate::staleness::FieldMetadata;
use crate::SyncError;

pub const MARKET_WATCH_JOB: &str = "market_watch";

const POOL_RESOURCE: &str = "market";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceWatch {
    pub item_id: u64,
    /// Alert when the cheapest listing is at or below this price.
    pub below: u64,
    pub deliver_to: Option<DeliveryTarget>,
}

/// Watches item market prices with a shared pool of keys.
pub struct MarketWatchJob {
    watches: Vec<PriceWatch>,
    pool: Vec<Credential>,
}

impl MarketWatchJob {
    pub fn new(watches: Vec<PriceWatch>, pool_keys: &[String]) -> Self {
        let pool = pool_keys
            .iter()
            .enumerate()
            .map(|(index, key)| Credential::new(format!("pool#{index}"), key))
            .collect();
        Self { watches, pool }
    }

    fn watch_for(&self, subject: SubjectKey) -> Option<&PriceWatch> {
        self.watches
            .iter()
            .find(|watch| SubjectKey::item(watch.item_id) == subject)
    }
}

impl JobSpec for MarketWatchJob {
    fn name(&self) -> &str {
        MARKET_WATCH_JOB
    }

    fn targets(&self, rotator: &CredentialRotator) -> Vec<PollTarget> {
        // One pool rotation per item spreads a cycle's calls over the pool.
        self.watches
            .iter()
            .filter_map(|watch| {
                let credential = rotator.next(POOL_RESOURCE, &self.pool)?;
                Some(PollTarget {
                    subject: SubjectKey::item(watch.item_id),
                    credential: credential.clone(),
                    deliver_to: watch.deliver_to.clone(),
                })
            })
            .collect()
    }

    fn fields(&self, _subject: SubjectKey) -> Vec<FieldKind> {
        vec![FieldKind::MarketPrice]
    }

    fn request(&self, subject: SubjectKey, kind: FieldKind) -> Result<ApiRequest, SyncError> {
        if kind != FieldKind::MarketPrice {
            return Err(SyncError::Transform(format!("{kind} is not a market field")));
        }
        Ok(ApiRequest::new(ApiSection::Market, Some(subject.id()), ["itemmarket"])?)
    }

    fn transform(
        &self,
        _subject: SubjectKey,
        _kind: FieldKind,
        raw: &RawResponse,
        now: UtcDateTime,
    ) -> Result<FieldSnapshot, SyncError> {
        // The market answers `null` instead of an empty list.
        let listings: &[Value] = match raw.get("itemmarket") {
            Some(Value::Array(listings)) => listings.as_slice(),
            Some(Value::Null) => &[],
            _ => {
                return Err(SyncError::Transform(String::from(
                    "response has no 'itemmarket' list",
                )))
            }
        };

        let prices = listings
            .iter()
            .map(|listing| {
                listing
                    .get("cost")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| SyncError::Transform(String::from("listing without cost")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let lowest = prices.iter().min().copied();

        Ok(FieldSnapshot {
            value: json!({ "lowest": lowest, "listings": prices.len() }),
            metadata: FieldMetadata::fetched_at(now).with_active(lowest.is_some()),
        })
    }

    fn alerts(
        &self,
        subject: SubjectKey,
        fields: &BTreeMap<FieldKind, CachedField>,
        _now: UtcDateTime,
    ) -> Vec<AlertCandidate> {
        let Some(watch) = self.watch_for(subject) else {
            return Vec::new();
        };
        let Some(lowest) = fields
            .get(&FieldKind::MarketPrice)
            .and_then(|field| field.value.get("lowest"))
            .and_then(Value::as_u64)
        else {
            return Vec::new();
        };
        if lowest > watch.below {
            return Vec::new();
        }

        vec![AlertCandidate {
            class: AlertClass::PriceAlert,
            title: format!("Item {} at {lowest}", watch.item_id),
            body: format!(
                "Cheapest listing for item {} is {lowest} (target {}).",
                watch.item_id, watch.below
            ),
            value: json!(lowest),
        }]
    }
}
