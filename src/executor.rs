//! Plan executor.
//!
//! Walks a [`Plan`] in order and never reorders it. An entry is dispatched
//! only once every dependency has resolved as created or already existing;
//! if a dependency failed (or was itself skipped) the entry is skipped and
//! never reaches `InFlight`. Consecutive independent entries, such as the
//! role grants on one service account, run concurrently on a `JoinSet`,
//! bounded by a semaphore.
//!
//! Per-entry state machine, single pass:
//!
//! ```text
//! Pending ──► InFlight ──► Succeeded | AlreadyExisted | Failed
//!    │
//!    └──────► Skipped   (failed dependency or cancellation)
//! ```
//!
//! Cancellation stops dispatch. Calls already in flight run to completion;
//! a retry waiting on backoff gives up and keeps its last error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{RetryPolicy, MAX_PARALLEL_LIMIT};
use crate::descriptor::ResourceKey;
use crate::error::{ProviderError, ProviderErrorKind};
use crate::gateway::{self, Applied, ProviderGateway};
use crate::plan::{Operation, Plan, PlanEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    InFlight,
    Succeeded,
    AlreadyExisted,
    Failed,
    Skipped,
}

impl EntryState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::InFlight)
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded | Self::AlreadyExisted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Created,
    AlreadyExisted,
    Failed {
        kind: ProviderErrorKind,
        reason: String,
    },
    /// Never dispatched.
    Skipped { reason: String },
}

impl Outcome {
    pub fn state(&self) -> EntryState {
        match self {
            Self::Created => EntryState::Succeeded,
            Self::AlreadyExisted => EntryState::AlreadyExisted,
            Self::Failed { .. } => EntryState::Failed,
            Self::Skipped { .. } => EntryState::Skipped,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state().is_success()
    }
}

/// Terminal record for one plan entry. Produced once, never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub key: ResourceKey,
    pub operation: Operation,
    pub optional: bool,
    pub outcome: Outcome,
    /// Gateway calls made; zero for skipped entries.
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions {
    pub retry: RetryPolicy,
    pub max_parallel: usize,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_parallel: 4,
        }
    }
}

/// Calls `call` until it succeeds, fails permanently, or `policy` runs out
/// of attempts. Returns the last result and the number of attempts made.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut call: F,
) -> (Result<T, ProviderError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(%label, attempt, ?delay, error = %e.message, "transient provider error, retrying");
                tokio::select! {
                    () = cancel.cancelled() => return (Err(e), attempt),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            result => return (result, attempt),
        }
    }
}

/// The one piece of shared mutable state: entry states and results.
struct Ledger {
    states: Vec<EntryState>,
    results: Vec<Option<OperationResult>>,
}

impl Ledger {
    fn new(len: usize) -> Self {
        Self {
            states: vec![EntryState::Pending; len],
            results: vec![None; len],
        }
    }

    fn mark_in_flight(&mut self, idx: usize) {
        if let Some(state) = self.states.get_mut(idx) {
            debug_assert_eq!(*state, EntryState::Pending);
            *state = EntryState::InFlight;
        }
    }

    fn record(&mut self, idx: usize, result: OperationResult) {
        if let (Some(state), Some(slot)) = (self.states.get_mut(idx), self.results.get_mut(idx)) {
            debug_assert!(!state.is_terminal(), "entry {idx} resolved twice");
            *state = result.outcome.state();
            *slot = Some(result);
        }
    }

    fn state(&self, idx: usize) -> EntryState {
        self.states.get(idx).copied().unwrap_or(EntryState::Pending)
    }
}

fn skipped(entry: &PlanEntry, reason: String) -> OperationResult {
    OperationResult {
        key: entry.key(),
        operation: entry.operation,
        optional: entry.optional,
        outcome: Outcome::Skipped { reason },
        attempts: 0,
    }
}

pub struct Executor {
    gateway: Arc<dyn ProviderGateway>,
    options: ExecutorOptions,
}

impl Executor {
    pub fn new(gateway: Arc<dyn ProviderGateway>, options: ExecutorOptions) -> Self {
        Self { gateway, options }
    }

    /// Executes `plan` and returns one result per entry, in plan order.
    pub async fn run(&self, plan: &Plan, cancel: CancellationToken) -> Vec<OperationResult> {
        let entries = plan.entries();
        let index: HashMap<ResourceKey, usize> = entries
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.key(), idx))
            .collect();
        let ledger = Arc::new(Mutex::new(Ledger::new(entries.len())));
        let permits = Arc::new(Semaphore::new(
            self.options.max_parallel.clamp(1, MAX_PARALLEL_LIMIT),
        ));
        let mut tasks: JoinSet<()> = JoinSet::new();

        for (idx, entry) in entries.iter().enumerate() {
            let deps: Vec<usize> = entry
                .depends_on
                .iter()
                .filter_map(|k| index.get(k).copied())
                .collect();

            // Let in-flight work drain until every dependency has resolved.
            loop {
                let resolved = {
                    let ledger = ledger.lock().await;
                    deps.iter().all(|&d| ledger.state(d).is_terminal())
                };
                if resolved {
                    break;
                }
                match tasks.join_next().await {
                    Some(Err(e)) => warn!(error = %e, "executor task aborted"),
                    Some(Ok(())) => {}
                    None => break,
                }
            }

            if cancel.is_cancelled() {
                ledger
                    .lock()
                    .await
                    .record(idx, skipped(entry, "cancelled before dispatch".to_string()));
                continue;
            }

            let blocker = {
                let ledger = ledger.lock().await;
                deps.iter()
                    .copied()
                    .find(|&d| !ledger.state(d).is_success())
            };
            if let Some(d) = blocker {
                let dep_key = entries.get(d).map(PlanEntry::key);
                let reason = match dep_key {
                    Some(k) => format!("dependency {k} did not succeed"),
                    None => "dependency did not succeed".to_string(),
                };
                warn!(key = %entry.key(), %reason, "skipping entry");
                ledger.lock().await.record(idx, skipped(entry, reason));
                continue;
            }

            let permit = tokio::select! {
                () = cancel.cancelled() => None,
                permit = Arc::clone(&permits).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                ledger
                    .lock()
                    .await
                    .record(idx, skipped(entry, "cancelled before dispatch".to_string()));
                continue;
            };

            ledger.lock().await.mark_in_flight(idx);
            debug!(key = %entry.key(), operation = %entry.operation, "dispatching");

            let gateway = Arc::clone(&self.gateway);
            let ledger = Arc::clone(&ledger);
            let cancel = cancel.clone();
            let retry = self.options.retry;
            let entry = entry.clone();
            tasks.spawn(async move {
                let key = entry.key();
                let label = key.to_string();
                let (result, attempts) = retry_transient(&retry, &cancel, &label, || {
                    gateway::apply(gateway.as_ref(), &entry.descriptor)
                })
                .await;
                drop(permit);

                let outcome = match result {
                    Ok(Applied::Created) => Outcome::Created,
                    Ok(Applied::AlreadyExists) => Outcome::AlreadyExisted,
                    Err(e) => Outcome::Failed {
                        kind: e.kind,
                        reason: e.message,
                    },
                };
                match &outcome {
                    Outcome::Failed { reason, .. } => {
                        warn!(%key, attempts, %reason, optional = entry.optional, "operation failed");
                    }
                    other => info!(%key, attempts, outcome = ?other.state(), "operation resolved"),
                }
                ledger.lock().await.record(
                    idx,
                    OperationResult {
                        key,
                        operation: entry.operation,
                        optional: entry.optional,
                        outcome,
                        attempts,
                    },
                );
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "executor task aborted");
            }
        }

        let mut ledger = ledger.lock().await;
        entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| {
                ledger
                    .results
                    .get_mut(idx)
                    .and_then(Option::take)
                    .unwrap_or_else(|| OperationResult {
                        key: entry.key(),
                        operation: entry.operation,
                        optional: entry.optional,
                        outcome: Outcome::Failed {
                            kind: ProviderErrorKind::Permanent,
                            reason: "task aborted before reporting".to_string(),
                        },
                        attempts: 0,
                    })
            })
            .collect()
    }
}
