//! # Ferrowatch Core
//!
//! Rate-limited polling substrate for a partner game API.
//!
//! ## Overview
//!
//! Every outbound call shares one rolling-window budget. Fields are cached per
//! subject and only refetched when their decay rule says so, and alerts raised
//! from the refreshed values pass a dedup and cooldown gate before delivery.
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Adaptive cache with per-field staleness and write-through |
//! | [`clock`] | Wall-clock abstraction |
//! | [`config`] | JSON configuration with environment overrides |
//! | [`domain`] | Subject keys, field kinds, UTC timestamps |
//! | [`error`] | Core error types |
//! | [`executor`] | Limiter, timeout and retry around one upstream call |
//! | [`gate`] | Notification dedup and cooldown gate |
//! | [`http_client`] | HTTP transport abstraction |
//! | [`jobs`] | Shipped polling jobs |
//! | [`notify`] | Alert sinks (webhook, log, recording) |
//! | [`partner_api`] | Partner API requests and client |
//! | [`polling`] | Job cycle orchestration |
//! | [`registry`] | Job enabled flags and last runs |
//! | [`retry`] | Backoff for rate-limited calls |
//! | [`rotation`] | Round-robin credential selection |
//! | [`runtime`] | Wiring from configuration to a scheduler |
//! | [`scheduler`] | Interval driver for jobs |
//! | [`staleness`] | Field decay rules |
//! | [`store`] | Field persistence collaborator |
//! | [`throttling`] | Rolling-window rate limiter |
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Scheduler     │
//! └────────┬────────┘
//!          │ tick
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │   JobRunner     │────▶│ AdaptiveCache    │──▶ FieldStore
//! └────────┬────────┘     └──────────────────┘
//!          │ stale fields
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ UpstreamExecutor│────▶│ PartnerApi       │
//! │ (limit + retry) │     │ (HttpClient)     │
//! └─────────────────┘     └──────────────────┘
//!          │ alerts
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ NotificationGate│────▶│ AlertSink        │
//! └─────────────────┘     └──────────────────┘
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod executor;
pub mod gate;
pub mod http_client;
pub mod jobs;
pub mod notify;
pub mod partner_api;
pub mod polling;
pub mod registry;
pub mod retry;
pub mod rotation;
pub mod runtime;
pub mod scheduler;
pub mod staleness;
pub mod store;
pub mod throttling;

pub use cache::{AdaptiveCache, CacheRead, CachedField};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SyncConfig};
pub use domain::{FieldKind, SubjectKey, SubjectScope, UtcDateTime};
pub use error::{SyncError, ValidationError};
pub use executor::UpstreamExecutor;
pub use gate::{AlertClass, AlertClassPolicy, GateDecision, NotificationGate};
pub use http_client::{HttpClient, ReqwestHttpClient};
pub use notify::{AlertMessage, AlertSink, DeliveryTarget, LogSink, WebhookSink};
pub use partner_api::{ApiRequest, ApiSection, HttpPartnerApi, PartnerApi, RawResponse};
pub use polling::{CycleReport, JobPhase, JobRunner, JobSpec, SyncContext};
pub use registry::JobRegistry;
pub use retry::RetryConfig;
pub use rotation::{Credential, CredentialRotator};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use staleness::{FieldMetadata, FieldPolicies, PolicyKind, StalenessPolicy};
pub use store::FieldStore;
pub use throttling::{RateLimitPolicy, RateLimiter, ThrottleError};
