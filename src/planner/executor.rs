//! Plan executor.
//!
//! Actions run on a bounded pool of tokio tasks. An action starts once every
//! action it depends on has succeeded; when one fails, its dependents are
//! cancelled while independent branches keep going. Successful actions are
//! never rolled back.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::{Id, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ConvergeError;
use crate::graph::{AttrValue, Attributes, LifecyclePhase, ResourceGraph, ResourceId};
use crate::provider::{ProviderRegistry, RetryPolicy};
use crate::state::{StateRecord, StateStore};

use super::plan::{ActionKind, Plan, PlannedAction};

/// Run-wide cancellation flag.
///
/// Once raised, no new action starts; actions already running finish.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal(Arc<AtomicBool>);

impl CancellationSignal {
    /// Creates a lowered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once the signal was raised.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Execution state of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionState {
    /// Waiting for dependencies or a free slot.
    Queued,
    /// Provider calls in flight.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Never started.
    Cancelled,
}

/// A successfully executed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedAction {
    /// Target resource.
    pub id: ResourceId,
    /// Operation performed.
    pub action: ActionKind,
    /// Provider attempts of the main call.
    pub attempts: u32,
}

/// A failed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedAction {
    /// Target resource.
    pub id: ResourceId,
    /// Operation attempted.
    pub action: ActionKind,
    /// Last error.
    pub cause: String,
    /// Provider attempts made.
    pub attempts: u32,
}

/// A cancelled action and the reason it never started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelledAction {
    /// Target resource.
    pub id: ResourceId,
    /// Operation that was planned.
    pub action: ActionKind,
    /// Failed upstream resource, if the cancellation cascaded from one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<ResourceId>,
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every action succeeded.
    Converged,
    /// At least one action failed.
    PartialFailure,
    /// The run was interrupted before every action started.
    Interrupted,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunResult {
    /// Actions that called the provider and succeeded.
    pub succeeded: Vec<CompletedAction>,
    /// Actions that failed.
    pub failed: Vec<FailedAction>,
    /// Actions that never started.
    pub cancelled: Vec<CancelledAction>,
    /// Resources that were already converged.
    pub unchanged: Vec<ResourceId>,
}

impl RunResult {
    /// Classifies the run.
    #[must_use]
    pub fn outcome(&self) -> RunOutcome {
        if !self.failed.is_empty() {
            RunOutcome::PartialFailure
        } else if !self.cancelled.is_empty() {
            RunOutcome::Interrupted
        } else {
            RunOutcome::Converged
        }
    }

    /// Returns true if every action succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome() == RunOutcome::Converged
    }

    /// Final state of the action targeting `id`.
    #[must_use]
    pub fn state_of(&self, id: &ResourceId) -> Option<ActionState> {
        if self.succeeded.iter().any(|a| &a.id == id) || self.unchanged.contains(id) {
            Some(ActionState::Succeeded)
        } else if self.failed.iter().any(|a| &a.id == id) {
            Some(ActionState::Failed)
        } else if self.cancelled.iter().any(|a| &a.id == id) {
            Some(ActionState::Cancelled)
        } else {
            None
        }
    }
}

struct ActionFailure {
    cause: String,
    attempts: u32,
}

impl ActionFailure {
    fn from_error(error: &ConvergeError, attempts: u32) -> Self {
        Self {
            cause: error.to_string(),
            attempts,
        }
    }
}

type ActionOutcome = Result<u32, ActionFailure>;

struct Context {
    registry: ProviderRegistry,
    store: Arc<dyn StateStore>,
    policy: RetryPolicy,
}

/// Executes plans against the provider adapters and the state store.
pub struct PlanExecutor {
    ctx: Arc<Context>,
    concurrency: usize,
    fail_fast: bool,
    cancel: CancellationSignal,
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("registry", &self.ctx.registry)
            .field("store", &self.ctx.store.backend_type())
            .field("policy", &self.ctx.policy)
            .field("concurrency", &self.concurrency)
            .field("fail_fast", &self.fail_fast)
            .finish()
    }
}

impl PlanExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(registry: ProviderRegistry, store: Arc<dyn StateStore>, policy: RetryPolicy) -> Self {
        Self {
            ctx: Arc::new(Context {
                registry,
                store,
                policy,
            }),
            concurrency: 4,
            fail_fast: false,
            cancel: CancellationSignal::new(),
        }
    }

    /// Sets the maximum number of actions in flight.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Cancels every pending action after the first failure.
    #[must_use]
    pub const fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Uses an externally owned cancellation signal.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// The signal that stops this executor from starting new actions.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationSignal {
        &self.cancel
    }

    /// Executes a plan, updating node phases in `graph` as actions progress.
    pub async fn execute(&self, plan: Plan, graph: &mut ResourceGraph) -> RunResult {
        let actions = plan.into_actions();
        let changes = actions.iter().filter(|a| a.is_change()).count();
        info!(
            "Executing plan with {changes} change(s) across {} resource(s)",
            actions.len()
        );

        let mut states = vec![ActionState::Queued; actions.len()];
        let mut waiting: Vec<usize> = actions.iter().map(|a| a.dependencies.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); actions.len()];
        for action in &actions {
            for &dep in &action.dependencies {
                if let Some(list) = dependents.get_mut(dep) {
                    list.push(action.index);
                }
            }
            graph.set_phase(&action.id, LifecyclePhase::Planned);
        }

        let mut ready: BTreeSet<usize> = (0..actions.len()).filter(|&i| waiting[i] == 0).collect();
        let mut blocked_by: HashMap<usize, ResourceId> = HashMap::new();
        let mut running: HashMap<Id, usize> = HashMap::new();
        let mut tasks: JoinSet<ActionOutcome> = JoinSet::new();
        let mut result = RunResult::default();

        loop {
            while tasks.len() < self.concurrency && !self.cancel.is_cancelled() {
                let Some(index) = ready.pop_first() else {
                    break;
                };
                let action = &actions[index];

                if action.kind == ActionKind::NoOp {
                    debug!("{} is up to date", action.id);
                    states[index] = ActionState::Succeeded;
                    graph.set_phase(&action.id, LifecyclePhase::Applied);
                    result.unchanged.push(action.id.clone());
                    release(&dependents[index], &mut waiting, &states, &mut ready);
                    continue;
                }

                states[index] = ActionState::Running;
                graph.set_phase(&action.id, LifecyclePhase::Applying);
                let handle = tasks.spawn(run_action(Arc::clone(&self.ctx), action.clone()));
                running.insert(handle.id(), index);
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };
            let (index, outcome) = match joined {
                Ok((task_id, outcome)) => (running.remove(&task_id), outcome),
                Err(e) => (
                    running.remove(&e.id()),
                    Err(ActionFailure {
                        cause: format!("action task aborted: {e}"),
                        attempts: 0,
                    }),
                ),
            };
            let Some(index) = index else {
                continue;
            };
            let action = &actions[index];

            match outcome {
                Ok(attempts) => {
                    info!("{} {} succeeded", action.kind, action.id);
                    states[index] = ActionState::Succeeded;
                    let phase = if action.kind == ActionKind::Delete {
                        LifecyclePhase::Destroyed
                    } else {
                        LifecyclePhase::Applied
                    };
                    graph.set_phase(&action.id, phase);
                    result.succeeded.push(CompletedAction {
                        id: action.id.clone(),
                        action: action.kind,
                        attempts,
                    });
                    release(&dependents[index], &mut waiting, &states, &mut ready);
                }
                Err(failure) => {
                    error!(
                        "{} {} failed after {} attempt(s): {}",
                        action.kind, action.id, failure.attempts, failure.cause
                    );
                    states[index] = ActionState::Failed;
                    graph.set_phase(&action.id, LifecyclePhase::Failed);
                    result.failed.push(FailedAction {
                        id: action.id.clone(),
                        action: action.kind,
                        cause: failure.cause,
                        attempts: failure.attempts,
                    });
                    cancel_dependents(index, &actions, &dependents, &mut states, &mut ready, &mut blocked_by);
                    if self.fail_fast {
                        warn!("Fail-fast enabled, cancelling pending actions");
                        self.cancel.cancel();
                    }
                }
            }
        }

        for (index, state) in states.iter_mut().enumerate() {
            if matches!(*state, ActionState::Queued | ActionState::Cancelled) {
                *state = ActionState::Cancelled;
                let action = &actions[index];
                graph.set_phase(&action.id, LifecyclePhase::Pending);
                result.cancelled.push(CancelledAction {
                    id: action.id.clone(),
                    action: action.kind,
                    blocked_by: blocked_by.remove(&index),
                });
            }
        }

        info!(
            "Run finished: {} succeeded, {} failed, {} cancelled, {} unchanged",
            result.succeeded.len(),
            result.failed.len(),
            result.cancelled.len(),
            result.unchanged.len()
        );
        result
    }
}

fn release(children: &[usize], waiting: &mut [usize], states: &[ActionState], ready: &mut BTreeSet<usize>) {
    for &child in children {
        waiting[child] = waiting[child].saturating_sub(1);
        if waiting[child] == 0 && states[child] == ActionState::Queued {
            ready.insert(child);
        }
    }
}

fn cancel_dependents(
    failed: usize,
    actions: &[PlannedAction],
    dependents: &[Vec<usize>],
    states: &mut [ActionState],
    ready: &mut BTreeSet<usize>,
    blocked_by: &mut HashMap<usize, ResourceId>,
) {
    let mut stack: Vec<usize> = dependents[failed].clone();
    while let Some(index) = stack.pop() {
        if states[index] != ActionState::Queued {
            continue;
        }
        warn!("Cancelling {} {}: depends on failed {}", actions[index].kind, actions[index].id, actions[failed].id);
        states[index] = ActionState::Cancelled;
        ready.remove(&index);
        blocked_by.insert(index, actions[failed].id.clone());
        stack.extend(dependents[index].iter().copied());
    }
}

async fn run_action(ctx: Arc<Context>, action: PlannedAction) -> ActionOutcome {
    let adapter = ctx
        .registry
        .get(action.id.kind)
        .map_err(|e| ActionFailure::from_error(&e, 0))?;
    let label = format!("{} {}", action.kind, action.id);

    match action.kind {
        ActionKind::Create => {
            info!("Creating {}", action.id);
            let desired = resolve_references(&ctx, &action).await?;
            let client_token = Uuid::new_v4().to_string();
            let attempted = ctx
                .policy
                .run(&label, || adapter.create(&action.id, &desired, &client_token))
                .await;
            let attempts = attempted.attempts;
            let handle = attempted
                .result
                .map_err(|e| ActionFailure::from_error(&ConvergeError::from(e), attempts))?;
            debug!("{} created as {handle}", action.id);

            save_record(&ctx, &action, handle.clone(), attempts).await?;

            ctx.policy
                .wait_until_visible(adapter.as_ref(), &handle)
                .await
                .map_err(|e| ActionFailure::from_error(&ConvergeError::from(e), attempts))?;
            Ok(attempts)
        }
        ActionKind::Update => {
            info!("Updating {} ({} field(s))", action.id, action.diff.len());
            let handle = existing_handle(&action)?;
            let desired = resolve_references(&ctx, &action).await?;
            let attempted = ctx
                .policy
                .run(&label, || adapter.update(&handle, &action.diff, &desired))
                .await;
            let attempts = attempted.attempts;
            attempted
                .result
                .map_err(|e| ActionFailure::from_error(&ConvergeError::from(e), attempts))?;

            save_record(&ctx, &action, handle, attempts).await?;
            Ok(attempts)
        }
        ActionKind::Delete => {
            info!("Deleting {}", action.id);
            let handle = existing_handle(&action)?;
            let attempted = ctx.policy.run(&label, || adapter.delete(&handle)).await;
            let attempts = attempted.attempts;
            attempted
                .result
                .map_err(|e| ActionFailure::from_error(&ConvergeError::from(e), attempts))?;

            ctx.store
                .delete(&action.id)
                .await
                .map_err(|e| ActionFailure::from_error(&e, attempts))?;
            Ok(attempts)
        }
        ActionKind::NoOp => Ok(0),
    }
}

fn existing_handle(action: &PlannedAction) -> Result<String, ActionFailure> {
    action.handle.clone().ok_or_else(|| ActionFailure {
        cause: format!("{} has no recorded handle", action.id),
        attempts: 0,
    })
}

async fn save_record(
    ctx: &Context,
    action: &PlannedAction,
    handle: String,
    attempts: u32,
) -> Result<(), ActionFailure> {
    let record = StateRecord::new(
        action.id.clone(),
        handle,
        action.desired.clone(),
        action.new_hash.clone().unwrap_or_default(),
        action.resource_dependencies.clone(),
    );
    ctx.store
        .save(&record)
        .await
        .map_err(|e| ActionFailure::from_error(&e, attempts))
}

/// Replaces attribute references with the handles recorded for the
/// referenced resources.
async fn resolve_references(ctx: &Context, action: &PlannedAction) -> Result<Attributes, ActionFailure> {
    let mut names = BTreeSet::new();
    for value in action.desired.values() {
        value.collect_refs(&mut names);
    }

    let mut handles: HashMap<String, String> = HashMap::new();
    for name in names {
        let target = action
            .resource_dependencies
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| ActionFailure {
                cause: format!("{} references undeclared dependency '{name}'", action.id),
                attempts: 0,
            })?;
        let record = ctx
            .store
            .load(target)
            .await
            .map_err(|e| ActionFailure::from_error(&e, 0))?
            .ok_or_else(|| ActionFailure {
                cause: format!("{target} has not been applied"),
                attempts: 0,
            })?;
        handles.insert(name.to_string(), record.handle);
    }

    let lookup = |name: &str| handles.get(name).cloned();
    action
        .desired
        .iter()
        .map(|(key, value)| {
            let resolved: AttrValue = value.resolve_refs(&lookup).map_err(|name| ActionFailure {
                cause: format!("unresolved reference '{name}' in {}", action.id),
                attempts: 0,
            })?;
            Ok((key.clone(), resolved))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::graph::{ResourceKind, ResourceNode};
    use crate::planner::Planner;
    use crate::provider::{Operation, ProviderSettings, SandboxCloud};
    use crate::state::MemoryStateStore;
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            call_timeout: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(5),
        }
    }

    fn setup(lag: u32) -> (Arc<SandboxCloud>, Arc<MemoryStateStore>, PlanExecutor) {
        let cloud = Arc::new(
            SandboxCloud::new(ProviderSettings::sandbox("123456789012", "us-east-1")).with_visibility_lag(lag),
        );
        let store = Arc::new(MemoryStateStore::new());
        let executor = PlanExecutor::new(ProviderRegistry::sandbox(&cloud), store.clone(), policy());
        (cloud, store, executor)
    }

    fn id(kind: ResourceKind, name: &str) -> ResourceId {
        ResourceId::new(kind, name)
    }

    /// Two independent branches: vpc -> cluster, and a role on its own.
    fn graph() -> ResourceGraph {
        let vpc = id(ResourceKind::Network, "vpc");
        let mut graph = ResourceGraph::new();
        graph
            .add_resource(ResourceNode::new(vpc.clone(), Attributes::new()).with_attr("cidr", "10.0.0.0/16"))
            .expect("vpc");
        graph
            .add_resource(
                ResourceNode::new(id(ResourceKind::ManagedCluster, "main"), Attributes::new())
                    .with_attr("vpc_id", AttrValue::reference("vpc"))
                    .depends_on(vpc),
            )
            .expect("cluster");
        graph
            .add_resource(
                ResourceNode::new(id(ResourceKind::IdentityRole, "admin"), Attributes::new())
                    .with_attr("service", "eks.amazonaws.com"),
            )
            .expect("role");
        graph
    }

    async fn plan(store: &MemoryStateStore, graph: &ResourceGraph) -> Plan {
        let snapshot = store.snapshot().await.expect("snapshot");
        Planner::new().plan(graph, &snapshot).expect("plan")
    }

    #[tokio::test]
    async fn test_creates_resolve_references_to_handles() {
        let (cloud, store, executor) = setup(1);
        let mut graph = graph();
        let plan = plan(&store, &graph).await;

        let result = executor.execute(plan, &mut graph).await;
        assert!(result.is_success());
        assert_eq!(result.succeeded.len(), 3);

        let vpc = store
            .load(&id(ResourceKind::Network, "vpc"))
            .await
            .expect("load")
            .expect("vpc record");
        let cluster = store
            .load(&id(ResourceKind::ManagedCluster, "main"))
            .await
            .expect("load")
            .expect("cluster record");

        let observed = cloud.resource(&cluster.handle).expect("cluster exists");
        assert_eq!(observed.get("vpc_id"), Some(&AttrValue::Str(vpc.handle)));
        assert_eq!(cluster.attributes.get("vpc_id"), Some(&AttrValue::reference("vpc")));
        assert_eq!(
            graph.get(&id(ResourceKind::ManagedCluster, "main")).map(ResourceNode::phase),
            Some(LifecyclePhase::Applied)
        );
    }

    #[tokio::test]
    async fn test_failure_cancels_dependents_only() {
        let (cloud, store, executor) = setup(0);
        cloud.fail_next(ResourceKind::Network, Operation::Create, ProviderError::fatal("quota exceeded"));
        let mut graph = graph();
        let plan = plan(&store, &graph).await;

        let result = executor.execute(plan, &mut graph).await;
        assert_eq!(result.outcome(), RunOutcome::PartialFailure);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].attempts, 1);
        assert_eq!(result.cancelled.len(), 1);
        assert_eq!(result.cancelled[0].blocked_by, Some(id(ResourceKind::Network, "vpc")));
        assert_eq!(
            result.state_of(&id(ResourceKind::IdentityRole, "admin")),
            Some(ActionState::Succeeded)
        );
        assert_eq!(cloud.calls(ResourceKind::ManagedCluster, Operation::Create), 0);
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_independent_branches() {
        let (cloud, store, executor) = setup(0);
        let executor = executor.with_concurrency(1).with_fail_fast(true);
        // Identity roles sort first, so the role is the first action to run.
        cloud.fail_next(ResourceKind::IdentityRole, Operation::Create, ProviderError::fatal("denied"));
        let mut graph = graph();
        let plan = plan(&store, &graph).await;

        let result = executor.execute(plan, &mut graph).await;
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.cancelled.len(), 2);
        assert!(result.succeeded.is_empty());
        assert!(executor.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_retryable_failure_recovers() {
        let (cloud, store, executor) = setup(0);
        cloud.fail_times(
            ResourceKind::Network,
            Operation::Create,
            ProviderError::retryable("throttled"),
            2,
        );
        let mut graph = graph();
        let plan = plan(&store, &graph).await;

        let result = executor.execute(plan, &mut graph).await;
        assert!(result.is_success());
        let vpc = result
            .succeeded
            .iter()
            .find(|a| a.id.kind == ResourceKind::Network)
            .expect("vpc");
        assert_eq!(vpc.attempts, 3);
    }

    #[tokio::test]
    async fn test_lost_create_response_does_not_duplicate() {
        let (cloud, store, executor) = setup(0);
        cloud.lose_next_create(ResourceKind::Network, ProviderError::retryable("connection reset"));
        let mut graph = graph();
        let plan = plan(&store, &graph).await;

        let result = executor.execute(plan, &mut graph).await;
        assert!(result.is_success());
        assert_eq!(cloud.calls(ResourceKind::Network, Operation::Create), 2);

        let handles = cloud.handles(ResourceKind::Network);
        assert_eq!(handles.len(), 1);
        let vpc = store
            .load(&id(ResourceKind::Network, "vpc"))
            .await
            .expect("load")
            .expect("vpc record");
        assert_eq!(vpc.handle, handles[0]);
    }

    #[tokio::test]
    async fn test_concurrency_limit_respected() {
        let cloud = Arc::new(
            SandboxCloud::new(ProviderSettings::sandbox("123456789012", "us-east-1"))
                .with_latency(Duration::from_millis(20)),
        );
        let store = Arc::new(MemoryStateStore::new());
        let executor =
            PlanExecutor::new(ProviderRegistry::sandbox(&cloud), store.clone(), policy()).with_concurrency(2);

        let mut graph = ResourceGraph::new();
        for i in 0..6 {
            graph
                .add_resource(ResourceNode::new(id(ResourceKind::IdentityRole, &format!("role-{i}")), Attributes::new()))
                .expect("role");
        }
        let plan = plan(&store, &graph).await;

        let result = executor.execute(plan, &mut graph).await;
        assert_eq!(result.succeeded.len(), 6);
        assert!(cloud.peak_in_flight() <= 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let (cloud, store, executor) = setup(0);
        executor.cancellation().cancel();
        let mut graph = graph();
        let plan = plan(&store, &graph).await;

        let result = executor.execute(plan, &mut graph).await;
        assert_eq!(result.outcome(), RunOutcome::Interrupted);
        assert_eq!(result.cancelled.len(), 3);
        assert!(cloud.is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_record_after_provider() {
        let (cloud, store, executor) = setup(0);
        let mut graph = graph();
        let first = plan(&store, &graph).await;
        assert!(executor.execute(first, &mut graph).await.is_success());

        let snapshot = store.snapshot().await.expect("snapshot");
        let destroy = Planner::new().plan_destroy(&snapshot).expect("destroy");
        let result = executor.execute(destroy, &mut ResourceGraph::new()).await;

        assert!(result.is_success());
        assert!(cloud.is_empty());
        assert!(store.snapshot().await.expect("snapshot").is_empty());
    }
}
