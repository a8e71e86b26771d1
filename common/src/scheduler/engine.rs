// Scheduler engine: periodic ticks that dispatch due sequence steps

use crate::content::ContentResolver;
use crate::dispatch::DispatchGateway;
use crate::errors::{StepError, StorageError};
use crate::lock::ResourceLock;
use crate::models::{AdvanceOutcome, Enrollment, EnrollmentKey, Subject};
use crate::sequence::{due_step, DueStep, SequenceCatalog};
use crate::store::EnrollmentStore;
use crate::telemetry::{self, should_trigger_alert, AlertNotifier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often a tick starts (in seconds)
    pub poll_interval_seconds: u64,
    /// TTL for per-enrollment locks (in seconds)
    pub lock_ttl_seconds: u64,
    /// Maximum number of subjects processed concurrently within a tick
    pub max_concurrent_subjects: usize,
    /// Remove enrollments whose trigger is not in the catalog
    pub remove_unknown_triggers: bool,
    /// How long `start` waits for in-flight ticks after shutdown
    pub shutdown_grace_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 60,
            lock_ttl_seconds: 300,
            max_concurrent_subjects: 8,
            remove_unknown_triggers: false,
            shutdown_grace_seconds: 30,
        }
    }
}

impl From<&crate::config::SchedulerConfig> for SchedulerConfig {
    fn from(config: &crate::config::SchedulerConfig) -> Self {
        Self {
            poll_interval_seconds: config.poll_interval_seconds,
            lock_ttl_seconds: config.lock_ttl_seconds,
            max_concurrent_subjects: config.max_concurrent_subjects,
            remove_unknown_triggers: config.remove_unknown_triggers,
            shutdown_grace_seconds: config.shutdown_grace_seconds,
        }
    }
}

/// Counts of what one tick did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Subjects in the snapshot
    pub subjects: usize,
    /// Steps accepted by the channel
    pub dispatched: usize,
    /// Successful compare-and-advance calls
    pub advanced: usize,
    /// Advances lost to a concurrent writer
    pub conflicts: usize,
    /// Enrollments removed after their last step
    pub completed: usize,
    /// Enrollments left pending after an error
    pub failed: usize,
    /// Enrollments not attempted (locked elsewhere, gone, or abandoned)
    pub skipped: usize,
}

impl TickReport {
    fn absorb(&mut self, other: TickReport) {
        self.subjects += other.subjects;
        self.dispatched += other.dispatched;
        self.advanced += other.advanced;
        self.conflicts += other.conflicts;
        self.completed += other.completed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }

    fn record(&mut self, outcome: &Result<Outcome, StepError>) {
        match outcome {
            Ok(Outcome::NotDue) => {}
            Ok(Outcome::Skipped) | Ok(Outcome::Abandoned) => self.skipped += 1,
            Ok(Outcome::Completed) => self.completed += 1,
            Ok(Outcome::Advanced { completed }) => {
                self.dispatched += 1;
                self.advanced += 1;
                if *completed {
                    self.completed += 1;
                }
            }
            Ok(Outcome::Conflict) => {
                self.dispatched += 1;
                self.conflicts += 1;
            }
            Err(_) => self.failed += 1,
        }
    }
}

/// What happened to a single enrollment during a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    NotDue,
    Skipped,
    /// Unknown trigger, enrollment removed
    Abandoned,
    /// Nothing left to send, enrollment removed
    Completed,
    Advanced { completed: bool },
    Conflict,
}

/// Scheduler trait for tick-driven sequence processing
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run the tick loop until `stop` is called
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Signal the tick loop to stop; in-flight ticks are allowed to finish
    async fn stop(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Run one tick at the current time
    async fn run_tick(&self) -> Result<TickReport, StorageError>;
}

/// Collaborators the scheduler is wired with
pub struct SchedulerDeps {
    pub catalog: Arc<SequenceCatalog>,
    pub store: Arc<dyn EnrollmentStore>,
    pub resolver: Arc<ContentResolver>,
    pub gateway: Arc<dyn DispatchGateway>,
    pub lock: Arc<dyn ResourceLock>,
    pub notifier: Arc<dyn AlertNotifier>,
}

/// Sequence scheduler
///
/// Each tick takes a snapshot of subjects with active enrollments and drives every
/// enrollment one step through `Pending -> Due -> Dispatched -> Pending | Completed`.
/// Ticks run as independent tasks, so a slow tick never delays the next one; the
/// per-enrollment lock keeps overlapping ticks off the same enrollment.
#[derive(Clone)]
pub struct SequenceScheduler {
    engine: Arc<Engine>,
    shutdown_tx: watch::Sender<bool>,
}

struct Engine {
    config: SchedulerConfig,
    catalog: Arc<SequenceCatalog>,
    store: Arc<dyn EnrollmentStore>,
    resolver: Arc<ContentResolver>,
    gateway: Arc<dyn DispatchGateway>,
    lock: Arc<dyn ResourceLock>,
    notifier: Arc<dyn AlertNotifier>,
    consecutive_failures: Mutex<HashMap<EnrollmentKey, u32>>,
}

impl SequenceScheduler {
    pub fn new(config: SchedulerConfig, deps: SchedulerDeps) -> Self {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);

        Self {
            engine: Arc::new(Engine {
                config,
                catalog: deps.catalog,
                store: deps.store,
                resolver: deps.resolver,
                gateway: deps.gateway,
                lock: deps.lock,
                notifier: deps.notifier,
                consecutive_failures: Mutex::new(HashMap::new()),
            }),
            shutdown_tx,
        }
    }

    /// Run one tick as if the current time were `now`
    pub async fn process_due_at(&self, now: DateTime<Utc>) -> Result<TickReport, StorageError> {
        self.engine.process_due_at(now).await
    }

    /// Consecutive failures currently recorded for an enrollment
    pub async fn consecutive_failures(&self, key: &EnrollmentKey) -> u32 {
        self.engine
            .consecutive_failures
            .lock()
            .await
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

fn log_tick_result(joined: Result<Result<TickReport, StorageError>, JoinError>) {
    match joined {
        Ok(Ok(report)) => debug!(?report, "Tick finished"),
        Ok(Err(e)) => error!(error = %e, "Tick failed to load enrollments"),
        Err(e) if e.is_cancelled() => warn!("Tick cancelled"),
        Err(e) => error!(error = %e, "Tick task panicked"),
    }
}

#[async_trait]
impl Scheduler for SequenceScheduler {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let config = &self.engine.config;
        info!(
            poll_interval_seconds = config.poll_interval_seconds,
            sequences = self.engine.catalog.len(),
            "Starting sequence scheduler"
        );

        let mut ticker = interval(Duration::from_secs(config.poll_interval_seconds.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticks: JoinSet<Result<TickReport, StorageError>> = JoinSet::new();

        // stop() may have run before this subscription existed
        let mut stopped = *shutdown_rx.borrow();
        while !stopped {
            tokio::select! {
                _ = ticker.tick() => {
                    let engine = Arc::clone(&self.engine);
                    ticks.spawn(async move { engine.process_due_at(Utc::now()).await });
                }
                Some(joined) = ticks.join_next(), if !ticks.is_empty() => {
                    log_tick_result(joined);
                }
                changed = shutdown_rx.changed() => {
                    stopped = changed.is_err() || *shutdown_rx.borrow();
                }
            }
        }

        info!("Shutdown signal received, no new ticks will start");
        let grace = Duration::from_secs(config.shutdown_grace_seconds);
        let drained = timeout(grace, async {
            while let Some(joined) = ticks.join_next().await {
                log_tick_result(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                in_flight = ticks.len(),
                "Shutdown grace period elapsed, aborting in-flight ticks"
            );
            ticks.abort_all();
        }

        info!("Sequence scheduler stopped");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Stopping sequence scheduler");
        self.shutdown_tx.send_replace(true);
        Ok(())
    }

    async fn run_tick(&self) -> Result<TickReport, StorageError> {
        self.engine.process_due_at(Utc::now()).await
    }
}

impl Engine {
    #[instrument(skip(self))]
    async fn process_due_at(&self, now: DateTime<Utc>) -> Result<TickReport, StorageError> {
        let started = Instant::now();

        let subjects = self
            .store
            .list_subjects_with_active_enrollments()
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to list subjects with active enrollments");
                e
            })?;

        telemetry::update_active_enrollments(subjects.iter().map(|s| s.enrollments.len()).sum());
        self.prune_failures(&subjects).await;

        let subject_count = subjects.len();
        let mut report = stream::iter(subjects)
            .map(|subject| async move { self.process_subject(&subject, now).await })
            .buffer_unordered(self.config.max_concurrent_subjects.max(1))
            .fold(TickReport::default(), |mut acc, report| async move {
                acc.absorb(report);
                acc
            })
            .await;
        report.subjects = subject_count;

        let elapsed = started.elapsed();
        telemetry::record_tick_duration(elapsed.as_secs_f64());

        if report.dispatched > 0 || report.failed > 0 || report.completed > 0 {
            info!(
                subjects = report.subjects,
                dispatched = report.dispatched,
                advanced = report.advanced,
                conflicts = report.conflicts,
                completed = report.completed,
                failed = report.failed,
                skipped = report.skipped,
                elapsed_ms = elapsed.as_millis() as u64,
                "Tick processed"
            );
        } else {
            debug!(subjects = report.subjects, "Tick found nothing due");
        }

        Ok(report)
    }

    /// Enrollments of one subject are handled in order; errors stay per enrollment
    async fn process_subject(&self, subject: &Subject, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        for enrollment in &subject.enrollments {
            let result = self.process_enrollment(subject, enrollment, now).await;

            if let Err(e) = &result {
                warn!(
                    subject_id = %subject.id,
                    trigger = %enrollment.trigger,
                    step_index = enrollment.next_step_index,
                    reason = e.reason(),
                    error = %e,
                    "Step left pending, will retry next tick"
                );
                telemetry::record_step_failure(&enrollment.trigger, e.reason());
            }

            let key = EnrollmentKey::new(subject.id, enrollment.trigger.as_str());
            self.track_failures(key, &result).await;
            report.record(&result);
        }

        report
    }

    #[instrument(
        skip(self, subject, enrollment),
        fields(subject_id = %subject.id, trigger = %enrollment.trigger)
    )]
    async fn process_enrollment(
        &self,
        subject: &Subject,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> Result<Outcome, StepError> {
        let trigger = enrollment.trigger.as_str();

        let sequence = match self.catalog.require(trigger) {
            Ok(sequence) => sequence,
            Err(e) => {
                error!(
                    subject_id = %subject.id,
                    trigger = %trigger,
                    "Enrollment references a trigger with no sequence"
                );
                if self.config.remove_unknown_triggers {
                    self.store.remove_enrollment(subject.id, trigger).await?;
                    warn!("Removed enrollment with unknown trigger");
                    return Ok(Outcome::Abandoned);
                }
                return Err(e.into());
            }
        };

        // Snapshot check first so idle enrollments never touch the lock
        if let DueStep::NotYet { .. } = due_step(enrollment, &sequence.steps, now) {
            return Ok(Outcome::NotDue);
        }

        let key = EnrollmentKey::new(subject.id, trigger);
        let ttl = Duration::from_secs(self.config.lock_ttl_seconds);
        let _guard = match self.lock.acquire(&key.lock_resource(), ttl).await {
            Ok(guard) => guard,
            Err(StorageError::LockHeld(_)) => {
                debug!("Enrollment held by another tick, skipping");
                return Ok(Outcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        // The snapshot may predate an advance made by a tick that just released the lock
        let Some(current) = self.store.find_enrollment(subject.id, trigger).await? else {
            debug!("Enrollment removed since snapshot");
            return Ok(Outcome::Skipped);
        };

        let index = match due_step(&current, &sequence.steps, now) {
            DueStep::NotYet { .. } => return Ok(Outcome::NotDue),
            DueStep::Complete => {
                self.store.remove_enrollment(subject.id, trigger).await?;
                telemetry::record_enrollment_completed(trigger);
                info!("Enrollment had no steps left, removed");
                return Ok(Outcome::Completed);
            }
            DueStep::Due { index } => index,
        };

        let step = &sequence.steps[index];
        let content = self.resolver.resolve(subject, trigger, index, step).await?;

        let message_id = self
            .gateway
            .send(&subject.channel_address, &content)
            .await?;
        telemetry::record_step_dispatched(trigger, content.kind());
        info!(
            step_index = index,
            kind = content.kind(),
            message_id = %message_id,
            "Step dispatched"
        );

        let expected = current.next_step_index;
        let next = expected + 1;

        match self
            .store
            .compare_and_advance(subject.id, trigger, expected, next)
            .await?
        {
            AdvanceOutcome::Conflict => {
                debug!(expected, "Enrollment already advanced elsewhere");
                telemetry::record_advance_conflict(trigger);
                Ok(Outcome::Conflict)
            }
            AdvanceOutcome::Advanced => {
                let completed = next as usize >= sequence.len();
                if completed {
                    self.store.remove_enrollment(subject.id, trigger).await?;
                    telemetry::record_enrollment_completed(trigger);
                    info!(steps = sequence.len(), "Sequence completed");
                }
                Ok(Outcome::Advanced { completed })
            }
        }
    }

    /// Forget failure streaks of enrollments no longer in the store
    async fn prune_failures(&self, subjects: &[Subject]) {
        let active: HashSet<EnrollmentKey> = subjects
            .iter()
            .flat_map(|s| {
                s.enrollments
                    .iter()
                    .map(move |e| EnrollmentKey::new(s.id, &e.trigger))
            })
            .collect();

        let mut failures = self.consecutive_failures.lock().await;
        let before = failures.len();
        failures.retain(|key, _| active.contains(key));
        if failures.len() < before {
            debug!(pruned = before - failures.len(), "Dropped failure counts of removed enrollments");
        }
    }

    /// Count consecutive failures; alert once when the threshold is crossed
    async fn track_failures(&self, key: EnrollmentKey, result: &Result<Outcome, StepError>) {
        let err = match result {
            Ok(Outcome::Advanced { .. }) | Ok(Outcome::Completed) | Ok(Outcome::Abandoned) => {
                self.consecutive_failures.lock().await.remove(&key);
                return;
            }
            Ok(_) => return,
            Err(e) => e,
        };

        let count = {
            let mut failures = self.consecutive_failures.lock().await;
            let count = failures.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if should_trigger_alert(count) && !should_trigger_alert(count - 1) {
            if let Err(alert_err) = self
                .notifier
                .send_alert(&key.subject_id, &key.trigger, count, &err.to_string())
                .await
            {
                error!(error = %alert_err, enrollment = %key, "Failed to send alert");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MockDispatchGateway;
    use crate::errors::DispatchError;
    use crate::generation::{
        GenerationPipeline, MockContentGenerator, MockDocumentRenderer, MockDocumentStore,
    };
    use crate::lock::LocalLock;
    use crate::models::ResolvedContent;
    use crate::store::InMemoryEnrollmentStore;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::atomic::{AtomicU32, Ordering};

    const CATALOG: &str = r#"[
        {
            "trigger": "bienvenida",
            "steps": [
                { "delay_minutes": 0, "type": "text", "template": "Hola {{nombre}}" },
                { "delay_minutes": 30, "type": "text", "template": "¿Tienes dudas, {{nombre}}?" }
            ]
        }
    ]"#;

    #[derive(Default)]
    struct CountingNotifier {
        alerts: AtomicU32,
    }

    #[async_trait]
    impl AlertNotifier for CountingNotifier {
        async fn send_alert(
            &self,
            _subject_id: &uuid::Uuid,
            _trigger: &str,
            _consecutive_failures: u32,
            _last_error: &str,
        ) -> anyhow::Result<()> {
            self.alerts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        scheduler: SequenceScheduler,
        store: Arc<InMemoryEnrollmentStore>,
        lock: LocalLock,
        notifier: Arc<CountingNotifier>,
        subject: Subject,
        start: DateTime<Utc>,
    }

    fn idle_pipeline() -> GenerationPipeline {
        let mut generator = MockContentGenerator::new();
        generator.expect_generate().times(0);
        GenerationPipeline::new(
            Arc::new(generator),
            Arc::new(MockDocumentRenderer::new()),
            Arc::new(MockDocumentStore::new()),
        )
    }

    async fn fixture(gateway: MockDispatchGateway, config: SchedulerConfig) -> Fixture {
        let store = Arc::new(InMemoryEnrollmentStore::new());
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let subject = Subject::new("5215512345678").with_field("nombre", "Ana");
        store.upsert_subject(&subject).await.unwrap();
        store.enroll(subject.id, "bienvenida", start).await.unwrap();

        let lock = LocalLock::new();
        let notifier = Arc::new(CountingNotifier::default());
        let resolver = Arc::new(ContentResolver::new(idle_pipeline(), store.clone()).unwrap());

        let scheduler = SequenceScheduler::new(
            config,
            SchedulerDeps {
                catalog: Arc::new(SequenceCatalog::from_json(CATALOG).unwrap()),
                store: store.clone(),
                resolver,
                gateway: Arc::new(gateway),
                lock: Arc::new(lock.clone()),
                notifier: notifier.clone(),
            },
        );

        Fixture {
            scheduler,
            store,
            lock,
            notifier,
            subject,
            start,
        }
    }

    fn accepting_gateway() -> MockDispatchGateway {
        let mut gateway = MockDispatchGateway::new();
        gateway
            .expect_send()
            .returning(|_, _| Ok("wamid.test".to_string()));
        gateway
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.poll_interval_seconds, 60);
        assert_eq!(config.max_concurrent_subjects, 8);
        assert!(!config.remove_unknown_triggers);
    }

    #[tokio::test]
    async fn test_bienvenida_sequence_runs_to_completion() {
        let mut gateway = MockDispatchGateway::new();
        let mut seq = mockall::Sequence::new();
        gateway
            .expect_send()
            .withf(|to, content| {
                to == "5215512345678"
                    && *content
                        == ResolvedContent::Text {
                            body: "Hola Ana".to_string(),
                        }
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("wamid.1".to_string()));
        gateway
            .expect_send()
            .withf(|_, content| {
                *content
                    == ResolvedContent::Text {
                        body: "¿Tienes dudas, Ana?".to_string(),
                    }
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("wamid.2".to_string()));

        let f = fixture(gateway, SchedulerConfig::default()).await;
        let id = f.subject.id;

        let report = f.scheduler.process_due_at(f.start).await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(f.store.enrollment(id, "bienvenida").await.unwrap().next_step_index, 1);

        let report = f
            .scheduler
            .process_due_at(f.start + ChronoDuration::minutes(29))
            .await
            .unwrap();
        assert_eq!(report.dispatched, 0);

        let report = f
            .scheduler
            .process_due_at(f.start + ChronoDuration::minutes(30))
            .await
            .unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.completed, 1);
        assert!(f.store.enrollment(id, "bienvenida").await.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_failure_leaves_step_pending_and_alerts_once() {
        let mut gateway = MockDispatchGateway::new();
        gateway.expect_send().times(4).returning(|_, _| {
            Err(DispatchError::Api {
                status: 500,
                body: "unavailable".to_string(),
            })
        });

        let f = fixture(gateway, SchedulerConfig::default()).await;
        let key = EnrollmentKey::new(f.subject.id, "bienvenida");

        for _ in 0..4 {
            let report = f.scheduler.process_due_at(f.start).await.unwrap();
            assert_eq!(report.failed, 1);
            assert_eq!(report.advanced, 0);
        }

        assert_eq!(
            f.store.enrollment(f.subject.id, "bienvenida").await.unwrap().next_step_index,
            0
        );
        assert_eq!(f.scheduler.consecutive_failures(&key).await, 4);
        assert_eq!(f.notifier.alerts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let mut gateway = MockDispatchGateway::new();
        let mut seq = mockall::Sequence::new();
        gateway
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(DispatchError::Request("timeout".to_string())));
        gateway
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("wamid.1".to_string()));

        let f = fixture(gateway, SchedulerConfig::default()).await;
        let key = EnrollmentKey::new(f.subject.id, "bienvenida");

        f.scheduler.process_due_at(f.start).await.unwrap();
        assert_eq!(f.scheduler.consecutive_failures(&key).await, 1);

        f.scheduler.process_due_at(f.start).await.unwrap();
        assert_eq!(f.scheduler.consecutive_failures(&key).await, 0);
    }

    #[tokio::test]
    async fn test_unknown_trigger_is_left_in_place() {
        let mut gateway = MockDispatchGateway::new();
        gateway.expect_send().times(0);

        let f = fixture(gateway, SchedulerConfig::default()).await;
        f.store
            .enroll(f.subject.id, "descontinuada", f.start)
            .await
            .unwrap();
        f.store.remove_enrollment(f.subject.id, "bienvenida").await.unwrap();

        let report = f.scheduler.process_due_at(f.start).await.unwrap();

        assert_eq!(report.failed, 1);
        assert!(f.store.enrollment(f.subject.id, "descontinuada").await.is_some());
    }

    #[tokio::test]
    async fn test_unknown_trigger_removed_when_configured() {
        let mut gateway = MockDispatchGateway::new();
        gateway.expect_send().times(0);

        let config = SchedulerConfig {
            remove_unknown_triggers: true,
            ..SchedulerConfig::default()
        };
        let f = fixture(gateway, config).await;
        f.store
            .enroll(f.subject.id, "descontinuada", f.start)
            .await
            .unwrap();
        f.store.remove_enrollment(f.subject.id, "bienvenida").await.unwrap();

        let report = f.scheduler.process_due_at(f.start).await.unwrap();

        assert_eq!(report.skipped, 1);
        assert!(f.store.enrollment(f.subject.id, "descontinuada").await.is_none());
    }

    #[tokio::test]
    async fn test_locked_enrollment_is_skipped() {
        let mut gateway = MockDispatchGateway::new();
        gateway.expect_send().times(0);

        let f = fixture(gateway, SchedulerConfig::default()).await;
        let key = EnrollmentKey::new(f.subject.id, "bienvenida");
        let _held = f
            .lock
            .acquire(&key.lock_resource(), Duration::from_secs(60))
            .await
            .unwrap();

        let report = f.scheduler.process_due_at(f.start).await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(
            f.store.enrollment(f.subject.id, "bienvenida").await.unwrap().next_step_index,
            0
        );
    }

    #[tokio::test]
    async fn test_overlapping_ticks_dispatch_once() {
        let mut gateway = MockDispatchGateway::new();
        gateway
            .expect_send()
            .times(1)
            .returning(|_, _| Ok("wamid.1".to_string()));

        let f = fixture(gateway, SchedulerConfig::default()).await;

        let (a, b) = tokio::join!(
            f.scheduler.process_due_at(f.start),
            f.scheduler.process_due_at(f.start)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.dispatched + b.dispatched, 1);
        assert_eq!(a.advanced + b.advanced, 1);
        assert_eq!(
            f.store.enrollment(f.subject.id, "bienvenida").await.unwrap().next_step_index,
            1
        );
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let f = fixture(
            accepting_gateway(),
            SchedulerConfig {
                poll_interval_seconds: 1,
                shutdown_grace_seconds: 1,
                ..SchedulerConfig::default()
            },
        )
        .await;

        let scheduler = f.scheduler.clone();
        let handle = tokio::spawn(async move { scheduler.start().await.is_ok() });

        tokio::time::sleep(Duration::from_millis(200)).await;
        f.scheduler.stop().await.unwrap();

        assert!(handle.await.unwrap());
        // The first tick fires immediately; the enrollment is advanced or already done
        assert!(f
            .store
            .enrollment(f.subject.id, "bienvenida")
            .await
            .map(|e| e.next_step_index >= 1)
            .unwrap_or(true));
    }

    #[tokio::test]
    async fn test_stored_terminal_index_is_removed_next_tick() {
        let mut gateway = MockDispatchGateway::new();
        gateway.expect_send().times(0);

        let f = fixture(gateway, SchedulerConfig::default()).await;
        // Advanced past the last step by another node that died before removing it
        f.store
            .compare_and_advance(f.subject.id, "bienvenida", 0, 2)
            .await
            .unwrap();

        let report = f
            .scheduler
            .process_due_at(f.start + ChronoDuration::minutes(90))
            .await
            .unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(report.dispatched, 0);
        assert!(f.store.enrollment(f.subject.id, "bienvenida").await.is_none());
    }

    #[tokio::test]
    async fn test_stop_before_start_is_not_lost() {
        let f = fixture(
            accepting_gateway(),
            SchedulerConfig {
                poll_interval_seconds: 3600,
                shutdown_grace_seconds: 1,
                ..SchedulerConfig::default()
            },
        )
        .await;

        f.scheduler.stop().await.unwrap();

        let started = tokio::time::timeout(Duration::from_secs(2), f.scheduler.start()).await;
        assert!(matches!(started, Ok(Ok(()))));
        assert_eq!(
            f.store.enrollment(f.subject.id, "bienvenida").await.unwrap().next_step_index,
            0
        );
    }

    #[tokio::test]
    async fn test_failure_count_dropped_when_enrollment_removed_elsewhere() {
        let mut gateway = MockDispatchGateway::new();
        gateway
            .expect_send()
            .times(1)
            .returning(|_, _| Err(DispatchError::Request("timeout".to_string())));

        let f = fixture(gateway, SchedulerConfig::default()).await;
        let key = EnrollmentKey::new(f.subject.id, "bienvenida");

        f.scheduler.process_due_at(f.start).await.unwrap();
        assert_eq!(f.scheduler.consecutive_failures(&key).await, 1);

        f.store
            .remove_enrollment(f.subject.id, "bienvenida")
            .await
            .unwrap();
        f.scheduler.process_due_at(f.start).await.unwrap();

        assert_eq!(f.scheduler.consecutive_failures(&key).await, 0);
    }
}
