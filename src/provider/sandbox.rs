//! In-process simulated cloud.
//!
//! `SandboxCloud` keeps resources in memory and behaves like a real backend
//! in the ways the executor cares about: handles are ARN-shaped, new
//! resources stay invisible for a configurable number of describe calls, and
//! failures can be injected per kind and operation.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::ProviderError;
use crate::graph::{AttrValue, Attributes, ResourceId, ResourceKind};
use crate::planner::AttributeDiff;

use super::ProviderSettings;
use super::adapter::{Observed, ProviderAdapter};

/// Provider operations, used to target fault injection and call counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `describe`
    Describe,
    /// `create`
    Create,
    /// `update`
    Update,
    /// `delete`
    Delete,
}

#[derive(Debug, Clone)]
struct SandboxResource {
    kind: ResourceKind,
    attributes: Attributes,
    hidden_for: u32,
}

#[derive(Debug, Default)]
struct SandboxState {
    resources: BTreeMap<String, SandboxResource>,
    faults: HashMap<(ResourceKind, Operation), VecDeque<ProviderError>>,
    lost_creates: HashMap<ResourceKind, VecDeque<ProviderError>>,
    tokens: HashMap<(ResourceKind, String), String>,
    calls: HashMap<(ResourceKind, Operation), u32>,
    serial: u64,
}

/// Simulated cloud shared by all sandbox adapters.
#[derive(Debug)]
pub struct SandboxCloud {
    settings: ProviderSettings,
    visibility_lag: u32,
    latency: Duration,
    state: Mutex<SandboxState>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl SandboxCloud {
    /// Creates an empty cloud.
    #[must_use]
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            settings,
            visibility_lag: 0,
            latency: Duration::ZERO,
            state: Mutex::new(SandboxState::default()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Number of describe calls a new resource answers `NotFound` to.
    #[must_use]
    pub const fn with_visibility_lag(mut self, describes: u32) -> Self {
        self.visibility_lag = describes;
        self
    }

    /// Simulated latency of every call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next call of `op` on `kind` fail with `error`.
    pub fn fail_next(&self, kind: ResourceKind, op: Operation, error: ProviderError) {
        self.fail_times(kind, op, error, 1);
    }

    /// Makes the next `times` calls of `op` on `kind` fail with `error`.
    pub fn fail_times(&self, kind: ResourceKind, op: Operation, error: ProviderError, times: usize) {
        let mut state = self.lock();
        let queue = state.faults.entry((kind, op)).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Makes the next create of `kind` take effect but answer with `error`,
    /// as when a response is lost after the backend accepted the request.
    pub fn lose_next_create(&self, kind: ResourceKind, error: ProviderError) {
        self.lock().lost_creates.entry(kind).or_default().push_back(error);
    }

    /// Number of calls of `op` made on `kind`, including failed ones.
    #[must_use]
    pub fn calls(&self, kind: ResourceKind, op: Operation) -> u32 {
        self.lock().calls.get(&(kind, op)).copied().unwrap_or(0)
    }

    /// Highest number of calls observed in flight at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Attributes stored behind a handle, ignoring visibility lag.
    #[must_use]
    pub fn resource(&self, handle: &str) -> Option<Attributes> {
        self.lock().resources.get(handle).map(|r| r.attributes.clone())
    }

    /// Handles of every stored resource of a kind.
    #[must_use]
    pub fn handles(&self, kind: ResourceKind) -> Vec<String> {
        self.lock()
            .resources
            .iter()
            .filter(|(_, r)| r.kind == kind)
            .map(|(h, _)| h.clone())
            .collect()
    }

    /// Total number of stored resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().resources.len()
    }

    /// Returns true if the cloud holds no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().resources.is_empty()
    }

    /// Changes an attribute out-of-band, as a console user would.
    pub fn tamper(&self, handle: &str, key: &str, value: AttrValue) -> bool {
        match self.lock().resources.get_mut(handle) {
            Some(resource) => {
                resource.attributes.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Removes a resource out-of-band.
    pub fn remove(&self, handle: &str) -> bool {
        self.lock().resources.remove(handle).is_some()
    }

    /// Returns an adapter for one resource kind.
    #[must_use]
    pub fn adapter(self: &Arc<Self>, kind: ResourceKind) -> SandboxAdapter {
        SandboxAdapter {
            cloud: Arc::clone(self),
            kind,
        }
    }

    fn handle_for(&self, id: &ResourceId, serial: u64) -> String {
        let kind = id.kind;
        // IAM is global: its ARNs carry no region.
        let region = if kind.service() == "iam" {
            ""
        } else {
            self.settings.region.as_str()
        };
        format!(
            "arn:aws:{}:{region}:{}:{}/{}-{serial:06}",
            kind.service(),
            self.settings.account_id,
            kind.handle_type(),
            id.name
        )
    }

    async fn enter(&self, kind: ResourceKind, op: Operation) -> Result<(), ProviderError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let fault = {
            let mut state = self.lock();
            *state.calls.entry((kind, op)).or_default() += 1;
            state.faults.get_mut(&(kind, op)).and_then(VecDeque::pop_front)
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match fault {
            Some(error) => {
                debug!("Sandbox injecting failure into {kind} {op:?}: {error}");
                Err(error)
            }
            None => Ok(()),
        }
    }
}

/// Adapter serving one kind from a [`SandboxCloud`].
#[derive(Debug, Clone)]
pub struct SandboxAdapter {
    cloud: Arc<SandboxCloud>,
    kind: ResourceKind,
}

#[async_trait]
impl ProviderAdapter for SandboxAdapter {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn describe(&self, handle: &str) -> Result<Observed, ProviderError> {
        self.cloud.enter(self.kind, Operation::Describe).await?;
        let mut state = self.cloud.lock();

        let Some(resource) = state.resources.get_mut(handle) else {
            return Ok(Observed::NotFound);
        };
        if resource.kind != self.kind {
            return Err(ProviderError::fatal(format!(
                "{handle} is a {}, not a {}",
                resource.kind, self.kind
            ))
            .with_status(400));
        }
        if resource.hidden_for > 0 {
            resource.hidden_for -= 1;
            trace!("{handle} still propagating");
            return Ok(Observed::NotFound);
        }
        Ok(Observed::Found(resource.attributes.clone()))
    }

    async fn create(
        &self,
        id: &ResourceId,
        desired: &Attributes,
        client_token: &str,
    ) -> Result<String, ProviderError> {
        self.cloud.enter(self.kind, Operation::Create).await?;
        let mut state = self.cloud.lock();

        let token_key = (self.kind, client_token.to_string());
        let handle = if let Some(existing) = state.tokens.get(&token_key) {
            debug!("Sandbox replayed create token {client_token} for {existing}");
            existing.clone()
        } else {
            state.serial += 1;
            let handle = self.cloud.handle_for(id, state.serial);
            state.resources.insert(
                handle.clone(),
                SandboxResource {
                    kind: self.kind,
                    attributes: desired.clone(),
                    hidden_for: self.cloud.visibility_lag,
                },
            );
            state.tokens.insert(token_key, handle.clone());
            debug!("Sandbox created {handle}");
            handle
        };

        if let Some(error) = state.lost_creates.get_mut(&self.kind).and_then(VecDeque::pop_front) {
            debug!("Sandbox dropping create response for {handle}: {error}");
            return Err(error);
        }
        Ok(handle)
    }

    async fn update(
        &self,
        handle: &str,
        diff: &AttributeDiff,
        desired: &Attributes,
    ) -> Result<(), ProviderError> {
        self.cloud.enter(self.kind, Operation::Update).await?;
        let mut state = self.cloud.lock();

        let resource = state
            .resources
            .get_mut(handle)
            .ok_or_else(|| ProviderError::fatal(format!("{handle} does not exist")).with_status(404))?;
        resource.attributes.clone_from(desired);
        debug!("Sandbox updated {handle} ({} field(s))", diff.len());
        Ok(())
    }

    async fn delete(&self, handle: &str) -> Result<(), ProviderError> {
        self.cloud.enter(self.kind, Operation::Delete).await?;
        if self.cloud.lock().resources.remove(handle).is_some() {
            debug!("Sandbox deleted {handle}");
        }
        Ok(())
    }
}
