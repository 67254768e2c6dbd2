//! Analysis worker
//!
//! Receives job messages one at a time, runs the package through the
//! sandbox, stores the result and announces completion. Only two outcomes
//! acknowledge a message: full success, and input that can never succeed
//! (missing identifier fields, unsupported ecosystem, a name that cannot be
//! stored). Everything else is left unacknowledged so the bus hands it out
//! again. While a message is being worked on its lease can be renewed so a
//! long sandbox run is not handed to a second worker.

use crate::bus::{Delivery, MessageBus};
use crate::error::Result;
use crate::manager::{AnalysisMode, ManagerRegistry, PackageManager};
use crate::notification::publish_completion;
use crate::sandbox::Sandbox;
use crate::static_scan::{assess, parse_string_report, StaticRecord};
use crate::store::{object_key, upload, validate_key, ResultRecord, ResultStore};
use crate::types::{PackageIdentifier, META_ECOSYSTEM, META_NAME, META_VERSION};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What happened to one message
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Analyzed, stored and announced; acknowledged
    Completed(PackageIdentifier),
    /// Can never succeed; acknowledged and dropped
    Discarded(String),
    /// Transient failure; left for redelivery
    Retry(String),
}

impl Disposition {
    pub fn acknowledges(&self) -> bool {
        !matches!(self, Disposition::Retry(_))
    }
}

/// Counters for a worker run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: usize,
    pub discarded: usize,
    pub retried: usize,
}

impl WorkerStats {
    fn record(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Completed(_) => self.completed += 1,
            Disposition::Discarded(_) => self.discarded += 1,
            Disposition::Retry(_) => self.retried += 1,
        }
    }

    fn merge(&mut self, other: WorkerStats) {
        self.completed += other.completed;
        self.discarded += other.discarded;
        self.retried += other.retried;
    }
}

/// Consumes analysis jobs from one subscription
pub struct Worker {
    bus: Arc<dyn MessageBus>,
    subscription: String,
    managers: Arc<ManagerRegistry>,
    sandbox: Arc<dyn Sandbox>,
    results: Arc<dyn ResultStore>,
    static_results: Option<Arc<dyn ResultStore>>,
    notifications: Option<(Arc<dyn MessageBus>, String)>,
    lease_extension: Option<Duration>,
    handled: AtomicUsize,
}

impl Worker {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        subscription: impl Into<String>,
        managers: Arc<ManagerRegistry>,
        sandbox: Arc<dyn Sandbox>,
        results: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            bus,
            subscription: subscription.into(),
            managers,
            sandbox,
            results,
            static_results: None,
            notifications: None,
            lease_extension: None,
            handled: AtomicUsize::new(0),
        }
    }

    /// Also run the static stage and store its verdicts here
    pub fn with_static_results(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.static_results = Some(store);
        self
    }

    /// Publish completion notifications to `topic`
    pub fn with_notifications(mut self, bus: Arc<dyn MessageBus>, topic: impl Into<String>) -> Self {
        self.notifications = Some((bus, topic.into()));
        self
    }

    /// Keep each message's lease `extension` ahead of now while it is being
    /// handled, renewing at half that interval
    pub fn with_lease_renewal(mut self, extension: Duration) -> Self {
        self.lease_extension = Some(extension.max(MIN_LEASE_EXTENSION));
        self
    }

    /// Messages processed over the worker's lifetime
    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }

    /// Decide and carry out what to do with one message, without acking it
    pub async fn handle(&self, delivery: &Delivery) -> Disposition {
        let Some(name) = delivery.attribute(META_NAME) else {
            return Disposition::Discarded(format!("message {} has no {} attribute", delivery.id, META_NAME));
        };
        let Some(tag) = delivery.attribute(META_ECOSYSTEM) else {
            return Disposition::Discarded(format!(
                "message {} has no {} attribute",
                delivery.id, META_ECOSYSTEM
            ));
        };
        let manager = match self.managers.lookup(tag) {
            Ok(m) => m,
            Err(e) => return Disposition::Discarded(e.to_string()),
        };

        let version = match delivery.attribute(META_VERSION) {
            Some(v) => v.to_string(),
            None => match manager.latest_version(name).await {
                Ok(v) => {
                    debug!(ecosystem = %tag, name = %name, "Resolved latest version {}", v);
                    v
                }
                Err(e) => return Disposition::Retry(format!("resolving latest {} version of {}: {}", tag, name, e)),
            },
        };

        let id = match PackageIdentifier::new(manager.ecosystem(), name, version) {
            Ok(id) => id,
            Err(e) => return Disposition::Discarded(e.to_string()),
        };
        if let Err(e) = validate_key(&object_key(&id)) {
            return Disposition::Discarded(format!("{}: {}", id, e));
        }

        match self.analyze(manager.as_ref(), &id).await {
            Ok(()) => Disposition::Completed(id),
            Err(e) => Disposition::Retry(format!("{}: {}", id, e)),
        }
    }

    async fn analyze(&self, manager: &dyn PackageManager, id: &PackageIdentifier) -> Result<()> {
        let command = manager.command(id, AnalysisMode::Dynamic);
        let analysis = self.sandbox.run(manager.image(), &command).await?;
        let record = ResultRecord::new(id.clone(), analysis);
        upload(self.results.as_ref(), &object_key(id), &record).await?;

        if let Some(store) = &self.static_results {
            let command = manager.command(id, AnalysisMode::Static);
            let report = self.sandbox.run(manager.image(), &command).await?;
            let verdict = assess(&parse_string_report(&report)?);
            info!(package = %id, "Static verdict {} ({} findings)", verdict.severity, verdict.findings.len());
            upload(store.as_ref(), &object_key(id), &StaticRecord::new(id.clone(), verdict)).await?;
        }

        if let Some((bus, topic)) = &self.notifications {
            publish_completion(bus.as_ref(), topic, id).await?;
        }
        Ok(())
    }

    /// Handle one message and acknowledge it when the outcome calls for it
    pub async fn process(&self, delivery: Delivery) -> Disposition {
        let disposition = match self.lease_extension {
            Some(extension) => self.handle_renewing(&delivery, extension).await,
            None => self.handle(&delivery).await,
        };
        self.handled.fetch_add(1, Ordering::SeqCst);
        match &disposition {
            Disposition::Completed(id) => info!(package = %id, "Analysis complete"),
            Disposition::Discarded(reason) => warn!("Discarding message {}: {}", delivery.id, reason),
            Disposition::Retry(reason) => error!(
                "Leaving message {} for redelivery (attempt {}): {}",
                delivery.id, delivery.attempt, reason
            ),
        }

        if disposition.acknowledges() {
            if let Err(e) = self.bus.ack(&delivery).await {
                error!("Failed to ack message {}: {}", delivery.id, e);
            }
        }
        disposition
    }

    async fn handle_renewing(&self, delivery: &Delivery, extension: Duration) -> Disposition {
        let work = self.handle(delivery);
        tokio::pin!(work);

        let period = extension / 2;
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut renewing = true;
        loop {
            tokio::select! {
                disposition = &mut work => return disposition,
                _ = renew.tick(), if renewing => {
                    if let Err(e) = self.bus.extend_lease(delivery, extension).await {
                        warn!("Could not extend lease on message {}: {}", delivery.id, e);
                        renewing = false;
                    }
                }
            }
        }
    }

    /// Process messages until `shutdown` turns true or the bus fails.
    ///
    /// A job already in progress is finished before stopping.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        info!("Worker listening on {} via {} bus", self.subscription, self.bus.name());

        loop {
            if *shutdown.borrow() {
                break;
            }
            let delivery = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.bus.receive(&self.subscription) => received?,
            };
            let disposition = self.process(delivery).await;
            stats.record(&disposition);
        }

        info!(
            "Worker stopped: {} completed, {} discarded, {} left for retry",
            stats.completed, stats.discarded, stats.retried
        );
        Ok(stats)
    }
}

/// Shortest lease the worker renews; renewal runs at half this
const MIN_LEASE_EXTENSION: Duration = Duration::from_millis(20);

/// Restart policy for a worker whose bus keeps failing
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub rate: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base: Duration::from_secs(1),
            rate: 1.5,
        }
    }
}

impl RetryPolicy {
    /// Delay before restart number `retry` (0-based): `floor(base * rate^retry)`
    pub fn delay(&self, retry: u32) -> Duration {
        let secs = (self.base.as_secs_f64() * self.rate.powi(retry as i32)).floor();
        Duration::from_secs_f64(secs)
    }
}

/// Run `worker`, restarting it after bus failures with growing delays.
///
/// Returns once `shutdown` is signalled, or with the last error after
/// `max_retries` consecutive restarts. A run that processed at least one
/// message before failing resets the count.
pub async fn run_supervised(
    worker: &Worker,
    mut shutdown: watch::Receiver<bool>,
    policy: &RetryPolicy,
) -> Result<WorkerStats> {
    let mut total = WorkerStats::default();
    let mut retries = 0u32;

    loop {
        let handled_before = worker.handled();
        match worker.run(shutdown.clone()).await {
            Ok(stats) => {
                total.merge(stats);
                return Ok(total);
            }
            Err(e) => {
                if worker.handled() > handled_before {
                    retries = 0;
                }
                if retries >= policy.max_retries {
                    error!("Worker giving up after {} retries: {}", retries, e);
                    return Err(e);
                }
                let delay = policy.delay(retries);
                retries += 1;
                warn!("Worker failed ({}); restarting in {:?} (retry {})", e, delay, retries);
                tokio::select! {
                    _ = shutdown.changed() => return Ok(total),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
