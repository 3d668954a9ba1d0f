//! Provider Gateway: the only place that talks to the cloud IAM API.
//!
//! The engine is written against [`ProviderGateway`]. Two backends ship:
//!
//! | Backend | Transport | Use |
//! |---------|-----------|-----|
//! | [`gcloud`] | `gcloud` CLI subprocess | Production |
//! | [`memory`] | in-process state | Tests, `--dry-run` |
//!
//! Each mutating method performs exactly one mutation and never retries;
//! retrying is the executor's job. A resource that already exists is
//! reported as [`Applied::AlreadyExists`], not as an error, so re-runs stay
//! quiet.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::descriptor::{
    Descriptor, PoolDescriptor, ProviderDescriptor, RoleBindingDescriptor,
    ServiceAccountDescriptor, TrustBindingDescriptor,
};
use crate::error::{PreconditionError, ProviderError};

pub mod gcloud;
pub mod memory;

/// Successful result of a mutating gateway call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Applied {
    Created,
    AlreadyExists,
}

pub type GatewayResult = Result<Applied, ProviderError>;

#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Short backend name for logs.
    fn gateway_id(&self) -> &'static str;

    /// Verifies credentials and project access. Called once, before planning.
    async fn check_access(&self, project_id: &str) -> Result<(), PreconditionError>;

    /// Numeric project identifier, needed for principal-set members.
    async fn project_number(&self, project_id: &str) -> Result<String, ProviderError>;

    async fn ensure_pool(&self, pool: &PoolDescriptor) -> GatewayResult;

    async fn ensure_provider(&self, provider: &ProviderDescriptor) -> GatewayResult;

    async fn ensure_service_account(&self, account: &ServiceAccountDescriptor) -> GatewayResult;

    async fn bind_role(&self, binding: &RoleBindingDescriptor) -> GatewayResult;

    async fn bind_trust(&self, binding: &TrustBindingDescriptor) -> GatewayResult;
}

/// Routes a descriptor to the matching gateway method.
pub async fn apply(gateway: &dyn ProviderGateway, descriptor: &Descriptor) -> GatewayResult {
    match descriptor {
        Descriptor::Pool(d) => gateway.ensure_pool(d).await,
        Descriptor::Provider(d) => gateway.ensure_provider(d).await,
        Descriptor::ServiceAccount(d) => gateway.ensure_service_account(d).await,
        Descriptor::RoleBinding(d) => gateway.bind_role(d).await,
        Descriptor::TrustBinding(d) => gateway.bind_trust(d).await,
    }
}
