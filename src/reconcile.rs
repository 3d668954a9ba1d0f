//! Idempotent reconciler.
//!
//! Turns the configuration and a repository into a [`Plan`] whose execution
//! converges the project to the desired state, whatever state it starts in.
//! Nothing is checked before it is created: every entry is attempted and an
//! "already exists" answer counts as success. That avoids the race between
//! an existence check and the create that follows it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::descriptor::{
    Descriptor, PoolDescriptor, ProviderDescriptor, RepoId, RoleBindingDescriptor,
    ServiceAccountDescriptor, TrustBindingDescriptor,
};
use crate::error::{PreconditionError, ProvisionError};
use crate::executor::{retry_transient, Executor, ExecutorOptions};
use crate::gateway::ProviderGateway;
use crate::plan::{Operation, Plan, PlanEntry};
use crate::report::{self, Report};

/// Identifiers known once the project number has been resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub repository: RepoId,
    pub project_id: String,
    pub project_number: String,
    pub provider_resource_name: String,
    pub service_account_email: String,
}

pub struct Reconciler {
    config: Config,
    gateway: Arc<dyn ProviderGateway>,
}

impl Reconciler {
    pub fn new(config: Config, gateway: Arc<dyn ProviderGateway>) -> Self {
        Self { config, gateway }
    }

    /// Full run: preconditions, planning, execution, report.
    ///
    /// Only validation and precondition failures are returned as errors.
    /// Failures during execution are part of the returned [`Report`].
    pub async fn converge(
        &self,
        repo: &RepoId,
        cancel: CancellationToken,
    ) -> Result<Report, ProvisionError> {
        self.config.validate()?;
        self.gateway.check_access(&self.config.project_id).await?;

        let (plan, identity) = self.plan(repo, &cancel).await?;
        info!(
            gateway = self.gateway.gateway_id(),
            project = %identity.project_id,
            region = %self.config.region,
            entries = plan.len(),
            "executing plan"
        );

        let executor = Executor::new(
            Arc::clone(&self.gateway),
            ExecutorOptions {
                retry: self.config.retry,
                max_parallel: self.config.max_parallel,
            },
        );
        let results = executor.run(&plan, cancel).await;
        Ok(report::emit(&results, &identity))
    }

    /// Resolves the project number, then builds the plan.
    pub async fn plan(
        &self,
        repo: &RepoId,
        cancel: &CancellationToken,
    ) -> Result<(Plan, ResolvedIdentity), ProvisionError> {
        let project_id = self.config.project_id.clone();
        let (number, _attempts) = retry_transient(&self.config.retry, cancel, "project number", || {
            self.gateway.project_number(&project_id)
        })
        .await;
        let number = number.map_err(|e| PreconditionError::ProjectInaccessible {
            project: project_id.clone(),
            reason: e.message,
        })?;
        self.build_plan(repo, &number)
    }

    /// Builds the plan for a known project number. Pure.
    pub fn build_plan(
        &self,
        repo: &RepoId,
        project_number: &str,
    ) -> Result<(Plan, ResolvedIdentity), ProvisionError> {
        let c = &self.config;
        c.validate()?;

        let pool = PoolDescriptor {
            project_id: c.project_id.clone(),
            pool_id: c.pool_id.clone(),
            display_name: c.pool_display_name.clone(),
        };
        let provider = ProviderDescriptor::github(
            &c.project_id,
            &c.pool_id,
            &c.provider_id,
            &c.provider_display_name,
            repo,
        );
        let account = ServiceAccountDescriptor {
            project_id: c.project_id.clone(),
            account_id: c.service_account_id.clone(),
            display_name: c.service_account_display_name.clone(),
        };
        // Needs the number, so it can only be built after resolution.
        let trust = TrustBindingDescriptor::for_repository(&pool, project_number, &account, repo)?;

        let identity = ResolvedIdentity {
            repository: repo.clone(),
            project_id: c.project_id.clone(),
            project_number: project_number.to_string(),
            provider_resource_name: provider.resource_name(project_number),
            service_account_email: account.email(),
        };

        let mut descriptors = vec![
            Descriptor::Pool(pool),
            Descriptor::Provider(provider),
            Descriptor::ServiceAccount(account.clone()),
        ];
        for grant in &c.roles {
            descriptors.push(Descriptor::RoleBinding(
                RoleBindingDescriptor::for_service_account(&account, &grant.role, grant.optional)?,
            ));
        }
        descriptors.push(Descriptor::TrustBinding(trust));

        let plan = Plan::new(order(descriptors)?)?;
        Ok((plan, identity))
    }
}

/// Kahn's algorithm over the static kind DAG, layer by layer, keeping
/// declaration order inside a layer. Roots come first so that independent
/// branches can start together.
fn order(descriptors: Vec<Descriptor>) -> Result<Vec<PlanEntry>, ProvisionError> {
    let keys: Vec<_> = descriptors.iter().map(Descriptor::key).collect();
    let mut pending: Vec<PlanEntry> = descriptors
        .into_iter()
        .map(|descriptor| {
            let needs = descriptor.kind().dependencies();
            let depends_on = keys
                .iter()
                .filter(|k| needs.contains(&k.kind))
                .cloned()
                .collect();
            PlanEntry {
                operation: Operation::for_kind(descriptor.kind()),
                optional: descriptor.is_optional(),
                descriptor,
                depends_on,
            }
        })
        .collect();

    let mut ordered: Vec<PlanEntry> = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let placed: Vec<_> = ordered.iter().map(PlanEntry::key).collect();
        let (ready, blocked): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|e| e.depends_on.iter().all(|d| placed.contains(d)));
        if ready.is_empty() {
            return Err(ProvisionError::Plan(format!(
                "dependency cycle among {} entries",
                blocked.len()
            )));
        }
        ordered.extend(ready);
        pending = blocked;
    }
    Ok(ordered)
}
