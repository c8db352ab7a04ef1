//! Polling job orchestration.
//!
//! A [`JobRunner`] drives one [`JobSpec`] through a cycle:
//!
//! ```text
//! Idle ─▶ Fetching ─▶ Transforming ─▶ Persisting ─▶ Notifying ─▶ Idle
//!   │                                                     ▲
//!   └─▶ Skipped (disabled, or non-reentrant overlap)      │
//!   any stage ─▶ Failed ──────────────────────────────────┘
//! ```
//!
//! Subjects of a cycle run concurrently and fail independently. Within a
//! subject the cache's subject lock is held from the first read to the last
//! write, stale fields addressing the same API target are merged into one
//! request, and distinct requests go out concurrently through the shared
//! executor.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{AdaptiveCache, CacheRead, CachedField};
use crate::clock::Clock;
use crate::domain::{FieldKind, SubjectKey, UtcDateTime};
use crate::executor::UpstreamExecutor;
use crate::gate::{AlertClass, GateDecision, NotificationGate};
use crate::notify::{AlertMessage, AlertSink, DeliveryTarget};
use crate::partner_api::{merge_requests, ApiRequest, PartnerApi, RawResponse};
use crate::registry::JobRegistry;
use crate::rotation::{Credential, CredentialRotator};
use crate::staleness::FieldMetadata;
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum JobPhase {
    Idle = 0,
    Fetching = 1,
    Transforming = 2,
    Persisting = 3,
    Notifying = 4,
    Skipped = 5,
    Failed = 6,
}

impl JobPhase {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Fetching,
            2 => Self::Transforming,
            3 => Self::Persisting,
            4 => Self::Notifying,
            5 => Self::Skipped,
            6 => Self::Failed,
            _ => Self::Idle,
        }
    }
}

/// One subject polled in a cycle, with the credential to poll it with.
#[derive(Debug, Clone)]
pub struct PollTarget {
    pub subject: SubjectKey,
    pub credential: Credential,
    /// Where alerts about this subject go; `None` disables alerting.
    pub deliver_to: Option<DeliveryTarget>,
}

/// Alert a job wants to raise for a subject.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCandidate {
    pub class: AlertClass,
    pub title: String,
    pub body: String,
    /// Compared for dedup by the gate.
    pub value: Value,
}

/// Transformed value and metadata of one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSnapshot {
    pub value: Value,
    pub metadata: FieldMetadata,
}

/// What a polling job polls and how it reads the answers.
///
/// Everything here is synchronous and free of I/O; the runner does the rest.
pub trait JobSpec: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a new cycle may start while the previous one is still running.
    fn reentrant(&self) -> bool {
        true
    }

    /// Subjects to poll this cycle.
    fn targets(&self, rotator: &CredentialRotator) -> Vec<PollTarget>;

    fn fields(&self, subject: SubjectKey) -> Vec<FieldKind>;

    /// Request that refreshes `kind` for `subject`.
    ///
    /// # Errors
    /// Returns an error when no request can be built for the field.
    fn request(&self, subject: SubjectKey, kind: FieldKind) -> Result<ApiRequest, SyncError>;

    /// Map a raw payload to the cached shape of `kind`.
    ///
    /// # Errors
    /// Returns [`SyncError::Transform`] on a malformed payload.
    fn transform(
        &self,
        subject: SubjectKey,
        kind: FieldKind,
        raw: &RawResponse,
        now: UtcDateTime,
    ) -> Result<FieldSnapshot, SyncError>;

    /// Alerts raised by the current field values. Default: none.
    fn alerts(
        &self,
        _subject: SubjectKey,
        _fields: &BTreeMap<FieldKind, CachedField>,
        _now: UtcDateTime,
    ) -> Vec<AlertCandidate> {
        Vec::new()
    }
}

/// Shared handles every job runs against. Built once per process.
#[derive(Clone)]
pub struct SyncContext {
    pub executor: UpstreamExecutor,
    pub api: Arc<dyn PartnerApi>,
    pub cache: Arc<AdaptiveCache>,
    pub gate: Arc<NotificationGate>,
    pub sink: Arc<dyn AlertSink>,
    pub registry: Arc<dyn JobRegistry>,
    pub rotator: Arc<CredentialRotator>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    /// Previous cycle of a non-reentrant job still running.
    Overlap,
    RegistryUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubjectFailure {
    pub subject: SubjectKey,
    pub code: &'static str,
    pub message: String,
    /// Owner of the credential upstream refused, if that is why it failed.
    pub rejected_credential: Option<String>,
}

/// Outcome of one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub job: String,
    pub started_at: UtcDateTime,
    pub finished_at: UtcDateTime,
    pub skipped: Option<SkipReason>,
    pub subjects: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub fields_fresh: usize,
    pub fields_refreshed: usize,
    pub requests: usize,
    pub alerts_sent: usize,
    pub alerts_suppressed: usize,
    pub delivery_failures: usize,
    pub failures: Vec<SubjectFailure>,
}

impl CycleReport {
    fn new(job: &str, started_at: UtcDateTime) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            job: job.to_owned(),
            started_at,
            finished_at: started_at,
            skipped: None,
            subjects: 0,
            succeeded: 0,
            failed: 0,
            fields_fresh: 0,
            fields_refreshed: 0,
            requests: 0,
            alerts_sent: 0,
            alerts_suppressed: 0,
            delivery_failures: 0,
            failures: Vec::new(),
        }
    }

    fn skipped(mut self, reason: SkipReason) -> Self {
        self.skipped = Some(reason);
        self
    }

    pub const fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}

#[derive(Debug, Default)]
struct SubjectStats {
    fields_fresh: usize,
    fields_refreshed: usize,
    requests: usize,
    alerts_sent: usize,
    alerts_suppressed: usize,
    delivery_failures: usize,
}

/// Runs cycles of one job against a shared [`SyncContext`].
pub struct JobRunner {
    spec: Arc<dyn JobSpec>,
    ctx: SyncContext,
    phase: AtomicU8,
    in_flight: AtomicBool,
}

impl JobRunner {
    pub fn new(spec: Arc<dyn JobSpec>, ctx: SyncContext) -> Self {
        Self {
            spec,
            ctx,
            phase: AtomicU8::new(JobPhase::Idle as u8),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        self.spec.name()
    }

    /// Stage most recently entered by any subject of the running cycle.
    pub fn phase(&self) -> JobPhase {
        JobPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: JobPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    /// Run one cycle. Never fails: every error is logged and counted.
    pub async fn run_cycle(&self) -> CycleReport {
        let job = self.spec.name();
        let mut report = CycleReport::new(job, self.ctx.clock.now());

        let _in_flight = if self.spec.reentrant() {
            None
        } else {
            match InFlight::try_enter(&self.in_flight) {
                Some(guard) => Some(guard),
                None => {
                    info!(job, phase = ?self.phase(), "previous cycle still running, skipping");
                    return report.skipped(SkipReason::Overlap);
                }
            }
        };

        match self.ctx.registry.is_enabled(job).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job, "job disabled, skipping");
                self.set_phase(JobPhase::Skipped);
                return report.skipped(SkipReason::Disabled);
            }
            Err(error) => {
                warn!(job, error = %error, "cannot read job descriptor, skipping cycle");
                self.set_phase(JobPhase::Skipped);
                return report.skipped(SkipReason::RegistryUnavailable);
            }
        }

        let targets = self.spec.targets(&self.ctx.rotator);
        report.subjects = targets.len();

        let outcomes = join_all(targets.iter().map(|target| self.run_subject(target))).await;
        for (target, outcome) in targets.iter().zip(outcomes) {
            match outcome {
                Ok(stats) => {
                    report.succeeded += 1;
                    report.fields_fresh += stats.fields_fresh;
                    report.fields_refreshed += stats.fields_refreshed;
                    report.requests += stats.requests;
                    report.alerts_sent += stats.alerts_sent;
                    report.alerts_suppressed += stats.alerts_suppressed;
                    report.delivery_failures += stats.delivery_failures;
                }
                Err(error) => {
                    report.failed += 1;
                    report.failures.push(SubjectFailure {
                        subject: target.subject,
                        code: error.code(),
                        message: error.to_string(),
                        rejected_credential: error
                            .is_credential_rejected()
                            .then(|| target.credential.owner().to_owned()),
                    });
                }
            }
        }

        report.finished_at = self.ctx.clock.now();
        self.set_phase(JobPhase::Idle);

        if let Err(error) = self.ctx.registry.record_run(job, report.finished_at).await {
            warn!(job, error = %error, "cannot record job run");
        }

        info!(
            job,
            cycle_id = %report.cycle_id,
            subjects = report.subjects,
            failed = report.failed,
            refreshed = report.fields_refreshed,
            alerts_sent = report.alerts_sent,
            "cycle finished"
        );
        report
    }

    async fn run_subject(&self, target: &PollTarget) -> Result<SubjectStats, SyncError> {
        let result = self.refresh_subject(target).await;
        if let Err(error) = &result {
            self.set_phase(JobPhase::Failed);
            if error.is_credential_rejected() {
                warn!(
                    job = self.spec.name(),
                    subject = %target.subject,
                    owner = target.credential.owner(),
                    "partner API rejected credential"
                );
            }
            warn!(
                job = self.spec.name(),
                subject = %target.subject,
                code = error.code(),
                error = %error,
                "subject cycle failed, keeping cached values"
            );
        }
        result
    }

    async fn refresh_subject(&self, target: &PollTarget) -> Result<SubjectStats, SyncError> {
        let subject = target.subject;
        let cache = &self.ctx.cache;
        let mut stats = SubjectStats::default();

        let _subject_guard = cache.lock_subject(subject).await;

        let mut current = BTreeMap::new();
        let mut stale = Vec::new();
        for kind in self.spec.fields(subject) {
            match cache.read(subject, kind).await {
                CacheRead::Fresh(field) => {
                    stats.fields_fresh += 1;
                    current.insert(kind, field);
                }
                CacheRead::Stale { previous } => {
                    stale.push(kind);
                    if let Some(previous) = previous {
                        current.insert(kind, previous);
                    }
                }
            }
        }

        if !stale.is_empty() {
            self.set_phase(JobPhase::Fetching);
            let wanted = stale
                .iter()
                .map(|kind| Ok((*kind, self.spec.request(subject, *kind)?)))
                .collect::<Result<Vec<_>, SyncError>>()?;
            let requests = merge_requests(wanted.iter().map(|(_, request)| request.clone()));
            stats.requests = requests.len();

            let responses = join_all(requests.iter().map(|request| {
                let api = &self.ctx.api;
                let credential = &target.credential;
                self.ctx
                    .executor
                    .execute(move || api.call(request, credential))
            }))
            .await;

            let mut fetched = Vec::with_capacity(requests.len());
            for (request, response) in requests.iter().zip(responses) {
                fetched.push((request.target(), response?));
            }

            self.set_phase(JobPhase::Transforming);
            let now = self.ctx.clock.now();
            let mut updates = Vec::with_capacity(wanted.len());
            for (kind, request) in &wanted {
                let raw = fetched
                    .iter()
                    .find(|(fetched_target, _)| *fetched_target == request.target())
                    .map(|(_, raw)| raw)
                    .ok_or_else(|| {
                        SyncError::Transform(format!("no response for {kind} of {subject}"))
                    })?;
                let snapshot = self.spec.transform(subject, *kind, raw, now)?;
                updates.push((
                    *kind,
                    CachedField {
                        value: snapshot.value,
                        policy: cache.policy_for(*kind).kind(),
                        metadata: snapshot.metadata,
                    },
                ));
            }

            self.set_phase(JobPhase::Persisting);
            for (kind, field) in updates {
                cache.write(subject, kind, field.clone()).await?;
                current.insert(kind, field);
                stats.fields_refreshed += 1;
            }
        }

        if let Some(deliver_to) = &target.deliver_to {
            self.set_phase(JobPhase::Notifying);
            self.notify(subject, deliver_to, &current, &mut stats).await;
        }

        Ok(stats)
    }

    async fn notify(
        &self,
        subject: SubjectKey,
        deliver_to: &DeliveryTarget,
        fields: &BTreeMap<FieldKind, CachedField>,
        stats: &mut SubjectStats,
    ) {
        let now = self.ctx.clock.now();
        for candidate in self.spec.alerts(subject, fields, now) {
            match self
                .ctx
                .gate
                .evaluate(subject, candidate.class, &candidate.value, now)
            {
                GateDecision::Allow => {}
                decision => {
                    debug!(%subject, class = %candidate.class, ?decision, "alert suppressed");
                    stats.alerts_suppressed += 1;
                    continue;
                }
            }

            let message = AlertMessage {
                class: candidate.class,
                subject,
                title: candidate.title,
                body: candidate.body,
                value: candidate.value,
                raised_at: now,
            };

            match self.ctx.sink.deliver(deliver_to, &message).await {
                Ok(()) => {
                    self.ctx
                        .gate
                        .record_emission(subject, message.class, message.value, now);
                    stats.alerts_sent += 1;
                }
                Err(error) => {
                    // Not recorded, so the next eligible cycle tries again.
                    warn!(%subject, class = %message.class, error = %error, "alert delivery failed");
                    stats.delivery_failures += 1;
                }
            }
        }
    }
}

/// Clears the in-flight flag of a non-reentrant job on drop.
struct InFlight<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlight<'a> {
    fn try_enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::RecordingSink;
    use crate::partner_api::ApiSection;
    use crate::registry::InMemoryJobRegistry;
    use crate::retry::RetryConfig;
    use crate::staleness::{FieldPolicies, PolicyKind};
    use crate::store::{FieldStore, InMemoryFieldStore};
    use crate::throttling::{RateLimitPolicy, RateLimiter};

    /// Answers every call with `{"profile": {"level": <id>}}` after `delay`.
    struct EchoApi {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl PartnerApi for EchoApi {
        fn call<'a>(
            &'a self,
            request: &'a ApiRequest,
            _credential: &'a Credential,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<RawResponse, SyncError>> + Send + 'a>,
        > {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                let level = request.id.unwrap_or_default();
                match json!({ "profile": { "level": level } }) {
                    Value::Object(body) => Ok(RawResponse::new(body)),
                    _ => Err(SyncError::Transform(String::from("unreachable"))),
                }
            })
        }
    }

    struct ProfileJob {
        users: Vec<u64>,
        reentrant: bool,
    }

    impl JobSpec for ProfileJob {
        fn name(&self) -> &str {
            "profile_test"
        }

        fn reentrant(&self) -> bool {
            self.reentrant
        }

        fn targets(&self, _rotator: &CredentialRotator) -> Vec<PollTarget> {
            self.users
                .iter()
                .map(|id| PollTarget {
                    subject: SubjectKey::user(*id),
                    credential: Credential::new(format!("user-{id}"), "key"),
                    deliver_to: None,
                })
                .collect()
        }

        fn fields(&self, _subject: SubjectKey) -> Vec<FieldKind> {
            vec![FieldKind::Profile]
        }

        fn request(&self, subject: SubjectKey, _kind: FieldKind) -> Result<ApiRequest, SyncError> {
            Ok(ApiRequest::new(ApiSection::User, Some(subject.id()), ["profile"])?)
        }

        fn transform(
            &self,
            _subject: SubjectKey,
            _kind: FieldKind,
            raw: &RawResponse,
            now: UtcDateTime,
        ) -> Result<FieldSnapshot, SyncError> {
            let value = raw
                .get("profile")
                .cloned()
                .ok_or_else(|| SyncError::Transform(String::from("missing profile")))?;
            Ok(FieldSnapshot {
                value,
                metadata: FieldMetadata::fetched_at(now),
            })
        }
    }

    fn runner(job: ProfileJob, api_delay: Duration) -> (Arc<JobRunner>, Arc<EchoApi>, Arc<InMemoryJobRegistry>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            UtcDateTime::parse("2024-01-01T00:00:00Z").expect("must parse"),
        ));
        let api = Arc::new(EchoApi {
            calls: AtomicUsize::new(0),
            delay: api_delay,
        });
        let registry = Arc::new(InMemoryJobRegistry::new());
        let store: Arc<dyn FieldStore> = Arc::new(InMemoryFieldStore::new());
        let ctx = SyncContext {
            executor: UpstreamExecutor::new(
                Arc::new(RateLimiter::new(
                    RateLimitPolicy::new(100, Duration::from_secs(60), Duration::ZERO)
                        .expect("valid"),
                )),
                RetryConfig::default(),
                Duration::from_secs(30),
            ),
            api: Arc::clone(&api) as Arc<dyn PartnerApi>,
            cache: Arc::new(AdaptiveCache::new(
                store,
                FieldPolicies::default(),
                Arc::clone(&clock),
            )),
            gate: Arc::new(NotificationGate::new()),
            sink: Arc::new(RecordingSink::new()),
            registry: Arc::clone(&registry) as Arc<dyn JobRegistry>,
            rotator: Arc::new(CredentialRotator::new()),
            clock,
        };
        (
            Arc::new(JobRunner::new(Arc::new(job), ctx)),
            api,
            registry,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_stale_fields_then_serves_fresh() {
        let (runner, api, registry) = runner(
            ProfileJob {
                users: vec![1, 2],
                reentrant: true,
            },
            Duration::ZERO,
        );

        let first = runner.run_cycle().await;
        assert_eq!(first.succeeded, 2);
        assert_eq!(first.fields_refreshed, 2);
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
        assert!(registry.last_run("profile_test").is_some());

        let second = runner.run_cycle().await;
        assert_eq!(second.fields_fresh, 2);
        assert_eq!(second.fields_refreshed, 0);
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);

        let cached = runner.ctx.cache.snapshot(SubjectKey::user(2));
        assert_eq!(cached[0].1.value, json!({ "level": 2 }));
        assert_eq!(cached[0].1.policy, PolicyKind::SimpleTtl);
        assert_eq!(runner.phase(), JobPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_job_is_skipped_without_recording_a_run() {
        let (runner, api, registry) = runner(
            ProfileJob {
                users: vec![1],
                reentrant: true,
            },
            Duration::ZERO,
        );
        registry.set_enabled("profile_test", false);

        let report = runner.run_cycle().await;

        assert_eq!(report.skipped, Some(SkipReason::Disabled));
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
        assert!(registry.last_run("profile_test").is_none());
        assert_eq!(runner.phase(), JobPhase::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn non_reentrant_job_skips_overlapping_cycle() {
        let (runner, _api, _registry) = runner(
            ProfileJob {
                users: vec![1],
                reentrant: false,
            },
            Duration::from_secs(5),
        );

        let background = Arc::clone(&runner);
        let first = tokio::spawn(async move { background.run_cycle().await });
        while runner.phase() != JobPhase::Fetching {
            tokio::task::yield_now().await;
        }

        let overlapping = runner.run_cycle().await;
        assert_eq!(overlapping.skipped, Some(SkipReason::Overlap));

        let finished = first.await.expect("task should not panic");
        assert!(!finished.is_skipped());
        assert_eq!(finished.fields_refreshed, 1);

        let after = runner.run_cycle().await;
        assert!(!after.is_skipped());
    }
}
