//! rulesync controller: drains the event queue and converges the ruler onto
//! the declared `PrometheusRule` resources.
//!
//! The controller exclusively owns the cache of managed rule groups observed on
//! the ruler. It is replaced wholesale by every sync and never patched in
//! place. Each processed event runs one full reconciliation pass: load
//! desired state, diff it against the cache, apply the diff, refresh the cache.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use rulesync_core::{
    diff_rule_state, is_managed_namespace, DiffSummary, Event, EventKind, LabelSelector, MultiError, ResourceLister,
    RuleGroupsByNamespace,
};
use rulesync_queue::WorkQueue;
use rulesync_ruler::{RulerClient, RulerError};
use tracing::{debug, error, info};

pub mod apply;
pub mod health;
pub mod loader;

pub use apply::{apply_changes, OpError};
pub use health::{Health, HealthState, HealthStatus};
pub use loader::load_desired;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown event type {0:?}")]
    UnknownEvent(String),
    #[error("loading desired state: {0:#}")]
    Load(anyhow::Error),
    #[error("listing rule groups from ruler: {0}")]
    Sync(#[source] RulerError),
    #[error("applying rule group changes: {0}")]
    Apply(MultiError<OpError>),
    #[error("reconciliation exceeded its {0:?} deadline")]
    Deadline(Duration),
    #[error("{0}")]
    Aggregate(MultiError<Error>),
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Ruler namespaces are named `<prefix>-<namespace>-<name>-<uid>`.
    pub prefix: String,
    pub namespace_selector: LabelSelector,
    pub rule_selector: LabelSelector,
    /// Upper bound for one reconciliation pass.
    pub deadline: Duration,
    /// Failures an event may accumulate before it is dropped.
    pub retry_budget: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            prefix: "rulesync".into(),
            namespace_selector: LabelSelector::everything(),
            rule_selector: LabelSelector::everything(),
            deadline: Duration::from_secs(5),
            retry_budget: 5,
        }
    }
}

/// Read-only view of the last sync, for hosts that expose debug endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugInfo {
    /// Managed ruler namespace -> group names.
    pub namespaces: BTreeMap<String, Vec<String>>,
    pub synced_at: Option<DateTime<Utc>>,
}

/// Cloneable handle for the host; never touches the cache.
#[derive(Clone)]
pub struct ControllerHandle {
    health: Health,
    debug: Arc<ArcSwap<DebugInfo>>,
    queue: WorkQueue<Event>,
}

impl ControllerHandle {
    pub fn health(&self) -> Arc<HealthStatus> { self.health.current() }
    pub fn debug_info(&self) -> Arc<DebugInfo> { self.debug.load_full() }
    pub fn enqueue(&self, evt: Event) { self.queue.add(evt); }
    pub fn queue(&self) -> &WorkQueue<Event> { &self.queue }

    /// Stop the control loop after the event in flight.
    pub fn shutdown(&self) { self.queue.shutdown(); }
}

pub struct Controller {
    cfg: ControllerConfig,
    lister: Arc<dyn ResourceLister>,
    ruler: Arc<dyn RulerClient>,
    queue: WorkQueue<Event>,
    cache: RuleGroupsByNamespace,
    health: Health,
    debug: Arc<ArcSwap<DebugInfo>>,
}

impl Controller {
    pub fn new(
        cfg: ControllerConfig,
        lister: Arc<dyn ResourceLister>,
        ruler: Arc<dyn RulerClient>,
        queue: WorkQueue<Event>,
    ) -> Self {
        Self {
            cfg,
            lister,
            ruler,
            queue,
            cache: RuleGroupsByNamespace::new(),
            health: Health::new(),
            debug: Arc::new(ArcSwap::from_pointee(DebugInfo::default())),
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle { health: self.health.clone(), debug: Arc::clone(&self.debug), queue: self.queue.clone() }
    }

    /// Managed rule groups as of the last sync.
    pub fn cache(&self) -> &RuleGroupsByNamespace { &self.cache }

    /// Process events until the queue is shut down.
    pub async fn run(mut self) {
        info!(prefix = %self.cfg.prefix, retry_budget = self.cfg.retry_budget, "controller started");
        while let Some(evt) = self.queue.get().await {
            counter!("rulesync_events_total", 1, "type" => evt.kind.to_string());
            let res = self.process_event(&evt).await;
            self.queue.done(&evt);
            self.settle(evt, res);
        }
        info!("event queue shut down; controller stopped");
    }

    fn settle(&self, evt: Event, res: Result<(), Error>) {
        let kind = evt.kind.to_string();
        let err = match res {
            Ok(()) => {
                self.health.report_healthy();
                self.queue.forget(&evt);
                return;
            }
            Err(err) => err,
        };
        let retries = self.queue.num_requeues(&evt);
        let budget = self.cfg.retry_budget;
        if retries < budget {
            counter!("rulesync_events_retried_total", 1, "type" => kind.clone());
            error!(event = %kind, key = %evt.key, retries = %format!("{}/{}", retries, budget), error = %err, "failed to process event; will retry");
            self.queue.add_rate_limited(evt);
            return;
        }
        counter!("rulesync_events_failed_total", 1, "type" => kind.clone());
        error!(event = %kind, key = %evt.key, retries = %format!("{}/{}", retries, budget), error = %err, "failed to process event; giving up");
        self.health.report_unhealthy(&err);
        self.queue.forget(&evt);
    }

    /// Dispatch one event, then reconcile.
    pub async fn process_event(&mut self, evt: &Event) -> Result<(), Error> {
        match &evt.kind {
            EventKind::ResourceChanged => debug!(key = %evt.key, "rule resource changed"),
            EventKind::SyncRuler => self.sync_ruler().await?,
            EventKind::Other(kind) => return Err(Error::UnknownEvent(kind.clone())),
        }
        self.reconcile().await
    }

    /// Replace the cache with the managed namespaces currently on the ruler.
    pub async fn sync_ruler(&mut self) -> Result<(), Error> {
        let t0 = Instant::now();
        let all = self.ruler.list_rules(&self.cfg.prefix).await.map_err(Error::Sync)?;
        let total = all.len();
        let managed: RuleGroupsByNamespace =
            all.into_iter().filter(|(ns, _)| is_managed_namespace(&self.cfg.prefix, ns)).collect();
        counter!("rulesync_sync_total", 1);
        gauge!("rulesync_managed_namespaces", managed.len() as f64);
        debug!(managed = managed.len(), skipped = total - managed.len(), took_ms = %t0.elapsed().as_millis(), "synced rule groups from ruler");
        self.publish_debug(&managed);
        self.cache = managed;
        Ok(())
    }

    fn publish_debug(&self, managed: &RuleGroupsByNamespace) {
        let namespaces = managed
            .iter()
            .map(|(ns, groups)| (ns.clone(), groups.iter().map(|g| g.name.clone()).collect()))
            .collect();
        self.debug.store(Arc::new(DebugInfo { namespaces, synced_at: Some(Utc::now()) }));
    }

    /// One reconciliation pass bounded by the configured deadline.
    pub async fn reconcile(&mut self) -> Result<(), Error> {
        let deadline = self.cfg.deadline;
        let t0 = Instant::now();
        let res = match tokio::time::timeout(deadline, self.reconcile_pass()).await {
            Ok(res) => res,
            Err(_) => Err(Error::Deadline(deadline)),
        };
        histogram!("rulesync_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
        res
    }

    async fn reconcile_pass(&mut self) -> Result<(), Error> {
        let desired = load_desired(
            self.lister.as_ref(),
            &self.cfg.namespace_selector,
            &self.cfg.rule_selector,
            &self.cfg.prefix,
        )
        .await
        .map_err(Error::Load)?;
        let diffs = diff_rule_state(&desired, &self.cache);
        if diffs.is_empty() {
            debug!(namespaces = desired.len(), "ruler up to date");
            return Ok(());
        }

        let mut errs = MultiError::new();
        for (ns, ops) in &diffs {
            let s = DiffSummary::of(ops);
            info!(ns = %ns, adds = s.adds, updates = s.updates, removes = s.removes, "applying rule group changes");
            if let Err(e) = apply_changes(self.ruler.as_ref(), ns, ops).await {
                errs.push(e);
            }
        }
        // Refresh even after partial failure so the next pass diffs against what the ruler holds.
        if let Err(e) = self.sync_ruler().await {
            errs.push(e);
        }
        errs.into_result().map_err(Error::Aggregate)
    }
}
