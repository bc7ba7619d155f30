//! Reconciler for converging the backend to the declared graph.
//!
//! A run is Plan → Execute → Record: under the run lock, the plan is computed
//! from a state snapshot and executed, and every successful action leaves its
//! record behind. Running it again on an unchanged graph plans nothing but
//! no-ops.
//!
//! The run lock is refreshed in the background for as long as it is held.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ExecutionConfig;
use crate::error::{ConvergeError, ReconcileError, Result, StateError};
use crate::graph::{Attributes, ResourceGraph, ResourceId};
use crate::planner::{AttributeDiff, CancellationSignal, Drift, Plan, PlanExecutor, Planner, RunResult};
use crate::provider::{Observed, ProviderRegistry, RetryPolicy};
use crate::state::{LockInfo, StateRecord, StateSnapshot, StateStore, generate_holder_id};

/// Shortest interval between two run lock refreshes.
const MIN_LOCK_REFRESH: Duration = Duration::from_millis(100);

/// Drives planning and execution against one state store.
pub struct Reconciler {
    registry: ProviderRegistry,
    store: Arc<dyn StateStore>,
    execution: ExecutionConfig,
    cancel: CancellationSignal,
    refresh: bool,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("registry", &self.registry)
            .field("store", &self.store.backend_type())
            .field("execution", &self.execution)
            .field("refresh", &self.refresh)
            .finish_non_exhaustive()
    }
}

/// Run lock plus the task keeping it alive.
struct HeldLock {
    info: LockInfo,
    heartbeat: JoinHandle<()>,
}

/// Drift of a single recorded resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftEntry {
    /// Resource identifier.
    pub id: ResourceId,
    /// Recorded provider handle.
    pub handle: String,
    /// What differs.
    #[serde(flatten)]
    pub drift: Drift,
}

/// Result of comparing recorded state with the backend.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// Number of records checked.
    pub checked: usize,
    /// Resources whose backend state differs from their record.
    pub drifted: Vec<DriftEntry>,
    /// Resources that could not be described.
    pub errors: Vec<(ResourceId, String)>,
}

impl DriftReport {
    /// Returns true if any resource drifted.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.drifted.is_empty()
    }

    /// Returns true if every record matches the backend.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.drifted.is_empty() && self.errors.is_empty()
    }

    /// Drift keyed by identifier, as consumed by the planner.
    #[must_use]
    pub fn into_drift_map(self) -> BTreeMap<ResourceId, Drift> {
        self.drifted.into_iter().map(|e| (e.id, e.drift)).collect()
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_drift() && self.errors.is_empty() {
            return write!(f, "No drift detected across {} resource(s)", self.checked);
        }
        writeln!(f, "Drift detected:")?;
        for entry in &self.drifted {
            match &entry.drift {
                Drift::Missing => writeln!(f, "  - {}: missing from backend", entry.id)?,
                Drift::Changed { diff } => {
                    writeln!(f, "  ~ {}:", entry.id)?;
                    for change in diff.changes() {
                        writeln!(f, "      {change}")?;
                    }
                }
            }
        }
        for (id, error) in &self.errors {
            writeln!(f, "  ! {id}: {error}")?;
        }
        Ok(())
    }
}

impl Reconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(registry: ProviderRegistry, store: Arc<dyn StateStore>, execution: ExecutionConfig) -> Self {
        Self {
            registry,
            store,
            execution,
            cancel: CancellationSignal::new(),
            refresh: false,
        }
    }

    /// Uses an externally owned cancellation signal.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Folds observed drift into every plan.
    #[must_use]
    pub const fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// The state store this reconciler records into.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Computes the plan that converges the backend to `graph`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an invalid graph or a conflicting
    /// declaration, or an error if state cannot be read.
    pub async fn plan(&self, graph: &ResourceGraph) -> Result<Plan> {
        let snapshot = self.store.snapshot().await?;
        let planner = if self.refresh {
            Planner::new().with_drift(self.observe(&snapshot).await.into_drift_map())
        } else {
            Planner::new()
        };
        let plan = planner.plan(graph, &snapshot)?;
        info!("Plan: {}", plan.summary());
        Ok(plan)
    }

    /// Plans without executing; no provider mutation is made.
    ///
    /// # Errors
    ///
    /// See [`plan`](Self::plan).
    pub async fn dry_run(&self, graph: &ResourceGraph) -> Result<Plan> {
        info!("Dry run: computing plan only");
        self.plan(graph).await
    }

    /// Plans, executes and records under the run lock.
    ///
    /// # Errors
    ///
    /// Returns an error if planning fails or the run lock is held. Action
    /// failures do not error: they are reported in the [`RunResult`].
    pub async fn reconcile(&self, graph: &mut ResourceGraph) -> Result<RunResult> {
        let lock = self.lock_run().await?;
        let outcome = match self.plan(graph).await {
            Ok(plan) => {
                if !plan.has_changes() {
                    info!("No changes required, backend is converged");
                }
                Ok(self.execute(plan, graph).await)
            }
            Err(e) => Err(e),
        };
        self.unlock_run(lock).await;
        outcome
    }

    /// Executes a previously computed plan, such as one shown to and
    /// approved by a user, under the run lock.
    ///
    /// # Errors
    ///
    /// Returns `StalePlan` if recorded state changed since the plan was
    /// computed, or an error if the run lock is held or state cannot be read.
    pub async fn apply(&self, plan: Plan, graph: &mut ResourceGraph) -> Result<RunResult> {
        let lock = self.lock_run().await?;
        let outcome = match self.store.snapshot().await {
            Ok(snapshot) => {
                let current = snapshot.fingerprint();
                if current == plan.state_fingerprint() {
                    Ok(self.execute(plan, graph).await)
                } else {
                    warn!("State changed since the plan was computed, refusing to apply it");
                    Err(ConvergeError::Reconcile(ReconcileError::StalePlan {
                        planned: short_fingerprint(plan.state_fingerprint()),
                        current: short_fingerprint(&current),
                    }))
                }
            }
            Err(e) => Err(e),
        };
        self.unlock_run(lock).await;
        outcome
    }

    /// Plans the deletion of every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read or recorded dependencies are
    /// inconsistent.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        let snapshot = self.store.snapshot().await?;
        let plan = Planner::new().plan_destroy(&snapshot)?;
        info!("Destroy plan: {}", plan.summary());
        Ok(plan)
    }

    /// Deletes every recorded resource, dependents first.
    ///
    /// # Errors
    ///
    /// Returns an error if planning fails or the run lock is held.
    pub async fn destroy(&self) -> Result<RunResult> {
        let lock = self.lock_run().await?;
        let outcome = match self.plan_destroy().await {
            Ok(plan) => Ok(self.execute(plan, &mut ResourceGraph::new()).await),
            Err(e) => Err(e),
        };
        self.unlock_run(lock).await;
        outcome
    }

    /// Describes every recorded resource and compares it with its record.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        let snapshot = self.store.snapshot().await?;
        Ok(self.observe(&snapshot).await)
    }

    async fn lock_run(&self) -> Result<HeldLock> {
        let info = self.store.acquire_lock(&generate_holder_id()).await?;
        debug!("Acquired run lock {} as {}", info.lock_id, info.holder);
        let heartbeat = tokio::spawn(keep_lock_alive(
            Arc::clone(&self.store),
            info.clone(),
            self.cancel.clone(),
        ));
        Ok(HeldLock { info, heartbeat })
    }

    async fn unlock_run(&self, lock: HeldLock) {
        lock.heartbeat.abort();
        // A refresh in flight must not land after the release.
        let _ = lock.heartbeat.await;
        if let Err(e) = self.store.release_lock(&lock.info.lock_id).await {
            warn!("Failed to release run lock {}: {e}", lock.info.lock_id);
        }
    }

    async fn execute(&self, plan: Plan, graph: &mut ResourceGraph) -> RunResult {
        PlanExecutor::new(
            self.registry.clone(),
            Arc::clone(&self.store),
            RetryPolicy::from_config(&self.execution),
        )
        .with_concurrency(self.execution.concurrency)
        .with_fail_fast(self.execution.fail_fast)
        .with_cancellation(self.cancel.clone())
        .execute(plan, graph)
        .await
    }

    async fn observe(&self, snapshot: &StateSnapshot) -> DriftReport {
        let policy = RetryPolicy::from_config(&self.execution);
        let mut report = DriftReport::default();

        for record in snapshot.records() {
            report.checked += 1;
            let adapter = match self.registry.get(record.id.kind) {
                Ok(adapter) => adapter,
                Err(e) => {
                    report.errors.push((record.id.clone(), e.to_string()));
                    continue;
                }
            };

            let label = format!("describe {}", record.id);
            let observed = policy.run(&label, || adapter.describe(&record.handle)).await;
            let drift = match observed.result {
                Ok(Observed::NotFound) => Some(Drift::Missing),
                Ok(Observed::Found(actual)) => {
                    let expected = expected_attributes(record, snapshot);
                    let diff = AttributeDiff::between(&declared_subset(&actual, &expected), &expected);
                    (!diff.is_empty()).then_some(Drift::Changed { diff })
                }
                Err(e) => {
                    report.errors.push((record.id.clone(), e.to_string()));
                    continue;
                }
            };

            if let Some(drift) = drift {
                debug!("{} drifted", record.id);
                report.drifted.push(DriftEntry {
                    id: record.id.clone(),
                    handle: record.handle.clone(),
                    drift,
                });
            }
        }

        info!(
            "Drift check: {} checked, {} drifted, {} error(s)",
            report.checked,
            report.drifted.len(),
            report.errors.len()
        );
        report
    }
}

/// Refreshes the run lock every third of its lifetime until aborted.
/// Losing the lock stops new actions from starting.
async fn keep_lock_alive(store: Arc<dyn StateStore>, lock: LockInfo, cancel: CancellationSignal) {
    let period = (lock.ttl() / 3).max(MIN_LOCK_REFRESH);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        match store.refresh_lock(&lock.lock_id).await {
            Ok(refreshed) => debug!(
                "Run lock {} refreshed until {}",
                refreshed.lock_id,
                refreshed.expires_at.to_rfc3339()
            ),
            Err(ConvergeError::State(StateError::LockLost { .. })) => {
                error!("Run lock {} was lost, no further actions will start", lock.lock_id);
                cancel.cancel();
                return;
            }
            Err(e) => warn!("Failed to refresh run lock {}: {e}", lock.lock_id),
        }
    }
}

fn short_fingerprint(fingerprint: &str) -> String {
    fingerprint.chars().take(12).collect()
}

/// Recorded attributes with references replaced by the handles of the
/// recorded dependencies they name. Unresolvable references are left as
/// they are.
fn expected_attributes(record: &StateRecord, snapshot: &StateSnapshot) -> Attributes {
    let lookup = |name: &str| {
        record
            .dependencies
            .iter()
            .filter(|dep| dep.name == name)
            .find_map(|dep| snapshot.get(dep))
            .map(|r| r.handle.clone())
    };
    record
        .attributes
        .iter()
        .map(|(key, value)| {
            let resolved = value.resolve_refs(&lookup).unwrap_or_else(|_| value.clone());
            (key.clone(), resolved)
        })
        .collect()
}

/// Observed attributes restricted to the declared keys; backends add
/// computed fields that are not drift.
fn declared_subset(actual: &Attributes, expected: &Attributes) -> Attributes {
    actual
        .iter()
        .filter(|(key, _)| expected.contains_key(*key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
