//! In-memory gateway.
//!
//! Keeps the set of existing resources in a `Mutex`, records every call, and
//! can be scripted to fail: faults queued for a resource kind are returned
//! (one per call) before that kind starts succeeding again. Used by the test
//! suite and by `--dry-run`, which must never touch the real project.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{Applied, GatewayResult, ProviderGateway};
use crate::descriptor::{
    PoolDescriptor, ProviderDescriptor, ResourceKey, ResourceKind, RoleBindingDescriptor,
    ServiceAccountDescriptor, TrustBindingDescriptor,
};
use crate::error::{PreconditionError, ProviderError};

#[derive(Default)]
struct State {
    existing: HashSet<ResourceKey>,
    calls: Vec<ResourceKey>,
    faults: HashMap<ResourceKind, VecDeque<ProviderError>>,
}

pub struct MemoryGateway {
    project_number: String,
    authenticated: bool,
    latency: Duration,
    state: Mutex<State>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryGateway {
    pub fn new(project_number: &str) -> Self {
        Self {
            project_number: project_number.to_string(),
            authenticated: true,
            latency: Duration::ZERO,
            state: Mutex::new(State::default()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Simulates a caller with no active credentials.
    #[must_use]
    pub fn unauthenticated(mut self) -> Self {
        self.authenticated = false;
        self
    }

    /// Every mutating call sleeps this long, so overlap becomes observable.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Marks a resource as already present.
    pub fn seed(&self, key: ResourceKey) {
        self.lock().existing.insert(key);
    }

    /// Queues errors returned by the next calls touching `kind`.
    pub fn inject_faults(&self, kind: ResourceKind, faults: impl IntoIterator<Item = ProviderError>) {
        self.lock()
            .faults
            .entry(kind)
            .or_default()
            .extend(faults);
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.lock().existing.contains(key)
    }

    /// Keys of every mutating call, in call order (failed calls included).
    pub fn calls(&self) -> Vec<ResourceKey> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, kind: ResourceKind) -> usize {
        self.lock().calls.iter().filter(|k| k.kind == kind).count()
    }

    /// Highest number of mutating calls observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn mutate(&self, key: ResourceKey) -> GatewayResult {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let result = {
            let mut state = self.lock();
            state.calls.push(key.clone());
            let fault = state
                .faults
                .get_mut(&key.kind)
                .and_then(VecDeque::pop_front);
            match fault {
                Some(err) => Err(err),
                None if state.existing.insert(key) => Ok(Applied::Created),
                None => Ok(Applied::AlreadyExists),
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl ProviderGateway for MemoryGateway {
    fn gateway_id(&self) -> &'static str {
        "memory"
    }

    async fn check_access(&self, project_id: &str) -> Result<(), PreconditionError> {
        if !self.authenticated {
            return Err(PreconditionError::NotAuthenticated(format!(
                "no active account for {project_id}"
            )));
        }
        Ok(())
    }

    async fn project_number(&self, _project_id: &str) -> Result<String, ProviderError> {
        Ok(self.project_number.clone())
    }

    async fn ensure_pool(&self, pool: &PoolDescriptor) -> GatewayResult {
        self.mutate(pool.key()).await
    }

    async fn ensure_provider(&self, provider: &ProviderDescriptor) -> GatewayResult {
        self.mutate(provider.key()).await
    }

    async fn ensure_service_account(&self, account: &ServiceAccountDescriptor) -> GatewayResult {
        self.mutate(account.key()).await
    }

    async fn bind_role(&self, binding: &RoleBindingDescriptor) -> GatewayResult {
        self.mutate(binding.key()).await
    }

    async fn bind_trust(&self, binding: &TrustBindingDescriptor) -> GatewayResult {
        self.mutate(binding.key()).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pool() -> PoolDescriptor {
        PoolDescriptor {
            project_id: "proj-1".into(),
            pool_id: "github-pool".into(),
            display_name: "GitHub".into(),
        }
    }

    #[tokio::test]
    async fn test_second_create_reports_already_exists() {
        let gw = MemoryGateway::new("1");
        assert_eq!(gw.ensure_pool(&pool()).await.unwrap(), Applied::Created);
        assert_eq!(gw.ensure_pool(&pool()).await.unwrap(), Applied::AlreadyExists);
        assert_eq!(gw.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_seeded_resources_already_exist() {
        let gw = MemoryGateway::new("1");
        gw.seed(pool().key());
        assert_eq!(gw.ensure_pool(&pool()).await.unwrap(), Applied::AlreadyExists);
    }

    #[tokio::test]
    async fn test_faults_are_consumed_in_order() {
        let gw = MemoryGateway::new("1");
        gw.inject_faults(
            ResourceKind::Pool,
            [ProviderError::transient("503"), ProviderError::permanent("403")],
        );
        assert!(gw.ensure_pool(&pool()).await.unwrap_err().is_transient());
        assert!(!gw.ensure_pool(&pool()).await.unwrap_err().is_transient());
        assert_eq!(gw.ensure_pool(&pool()).await.unwrap(), Applied::Created);
        assert!(gw.contains(&pool().key()));
    }

    #[tokio::test]
    async fn test_unauthenticated_fails_precondition() {
        let gw = MemoryGateway::new("1").unauthenticated();
        assert!(matches!(
            gw.check_access("proj-1").await,
            Err(PreconditionError::NotAuthenticated(_))
        ));
        assert_eq!(gw.project_number("proj-1").await.unwrap(), "1");
    }
}
