//! Partner API client.
//!
//! The partner API answers `GET {base}/{section}/{id}?selections=a,b` with a
//! JSON object. Failures come either as HTTP status codes or as a `200` body of
//! the form `{"error": {"code": 5, "error": "Too many requests"}}`.
//!
//! | Condition | Mapped to |
//! |-----------|-----------|
//! | HTTP 429, error code 5 | [`SyncError::RateLimited`] |
//! | error codes 2, 10, 13, 18 | [`SyncError::Upstream`] with `credential_rejected` |
//! | other error codes, non-2xx | [`SyncError::Upstream`] |
//! | body is not a JSON object | [`SyncError::Transform`] |
//! | transport timeout | [`SyncError::Timeout`] |

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::http_client::{HttpAuth, HttpClient, HttpRequest};
use crate::rotation::Credential;
use crate::{SyncError, ValidationError};

const RATE_LIMIT_CODE: u32 = 5;
const CREDENTIAL_REJECTED_CODES: [u32; 4] = [2, 10, 13, 18];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ApiSection {
    User,
    Faction,
    Market,
}

impl ApiSection {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Faction => "faction",
            Self::Market => "market",
        }
    }
}

impl Display for ApiSection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound call: a section, an optional entity id, and the selections
/// to include in the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub section: ApiSection,
    /// `None` addresses the credential owner's own entity.
    pub id: Option<u64>,
    pub selections: BTreeSet<String>,
}

impl ApiRequest {
    pub fn new<I, S>(section: ApiSection, id: Option<u64>, selections: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let selections: BTreeSet<String> = selections
            .into_iter()
            .map(Into::into)
            .filter(|selection: &String| !selection.trim().is_empty())
            .collect();
        if selections.is_empty() {
            return Err(ValidationError::EmptySelections);
        }

        Ok(Self {
            section,
            id,
            selections,
        })
    }

    pub const fn target(&self) -> (ApiSection, Option<u64>) {
        (self.section, self.id)
    }

    /// Fold `other`'s selections into `self` when both address the same
    /// target. Returns whether they were merged.
    pub fn merge(&mut self, other: &Self) -> bool {
        if self.target() != other.target() {
            return false;
        }
        self.selections.extend(other.selections.iter().cloned());
        true
    }

    pub fn selections_param(&self) -> String {
        self.selections
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Display for ApiRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.id {
            Some(id) => write!(f, "{}/{}?{}", self.section, id, self.selections_param()),
            None => write!(f, "{}?{}", self.section, self.selections_param()),
        }
    }
}

/// Collapse requests that address the same target into one, keeping the
/// order in which targets first appear.
pub fn merge_requests(requests: impl IntoIterator<Item = ApiRequest>) -> Vec<ApiRequest> {
    let mut merged: Vec<ApiRequest> = Vec::new();
    for request in requests {
        if !merged.iter_mut().any(|existing| existing.merge(&request)) {
            merged.push(request);
        }
    }
    merged
}

/// Successful partner API payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub body: Map<String, Value>,
}

impl RawResponse {
    pub fn new(body: Map<String, Value>) -> Self {
        Self { body }
    }

    /// Parse a response body. Anything but a JSON object is a transform error.
    pub fn from_json(body: &str) -> Result<Self, SyncError> {
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(map)) => Ok(Self { body: map }),
            Ok(other) => Err(SyncError::Transform(format!(
                "expected JSON object, got {}",
                json_type(&other)
            ))),
            Err(error) => Err(SyncError::Transform(format!("invalid JSON body: {error}"))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }
}

/// Outbound call collaborator.
pub trait PartnerApi: Send + Sync {
    fn call<'a>(
        &'a self,
        request: &'a ApiRequest,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<RawResponse, SyncError>> + Send + 'a>>;
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: PartnerError,
}

#[derive(Debug, Deserialize)]
struct PartnerError {
    code: u32,
    #[serde(default)]
    error: String,
}

/// [`PartnerApi`] over an [`HttpClient`] transport.
#[derive(Clone)]
pub struct HttpPartnerApi {
    http_client: Arc<dyn HttpClient>,
    base_url: String,
    timeout_ms: u64,
}

impl HttpPartnerApi {
    pub fn new(http_client: Arc<dyn HttpClient>, base_url: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout_ms,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, request: &ApiRequest) -> String {
        let id = request.id.map(|id| id.to_string()).unwrap_or_default();
        format!(
            "{}/{}/{}?selections={}",
            self.base_url,
            request.section.as_str(),
            id,
            urlencoding::encode(&request.selections_param())
        )
    }

    async fn call_inner(
        &self,
        request: &ApiRequest,
        credential: &Credential,
    ) -> Result<RawResponse, SyncError> {
        let http_request = HttpRequest::get(self.url_for(request))
            .with_header("accept", "application/json")
            .with_auth(&HttpAuth::ApiKey(credential.secret().to_owned()))
            .with_timeout_ms(self.timeout_ms);

        debug!(request = %request, owner = credential.owner(), "calling partner API");

        let response = self.http_client.execute(http_request).await.map_err(|error| {
            if error.is_timeout() {
                SyncError::Timeout {
                    timeout_ms: self.timeout_ms,
                }
            } else {
                SyncError::upstream(None, error.message())
            }
        })?;

        if response.status == 429 {
            return Err(SyncError::rate_limited("HTTP 429"));
        }
        if !response.is_success() {
            return Err(SyncError::upstream(
                None,
                format!("partner API returned status {}", response.status),
            ));
        }

        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&response.body) {
            return Err(map_partner_error(envelope.error));
        }

        RawResponse::from_json(&response.body)
    }
}

impl PartnerApi for HttpPartnerApi {
    fn call<'a>(
        &'a self,
        request: &'a ApiRequest,
        credential: &'a Credential,
    ) -> Pin<Box<dyn Future<Output = Result<RawResponse, SyncError>> + Send + 'a>> {
        Box::pin(self.call_inner(request, credential))
    }
}

fn map_partner_error(error: PartnerError) -> SyncError {
    if error.code == RATE_LIMIT_CODE {
        SyncError::rate_limited(format!("error code {}: {}", error.code, error.error))
    } else if CREDENTIAL_REJECTED_CODES.contains(&error.code) {
        SyncError::credential_rejected(error.code, error.error)
    } else {
        SyncError::upstream(Some(error.code), error.error)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
