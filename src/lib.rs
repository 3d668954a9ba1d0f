//! # wif-bootstrap
//!
//! Idempotent Workload Identity Federation provisioning for GitHub Actions.
//!
//! Given a repository (`owner/repo`) and a project, wif-bootstrap makes sure
//! a workload identity pool, a GitHub OIDC provider, a deploy service
//! account, its project roles, and the trust binding that lets the
//! repository impersonate it all exist. It prints the two values a workflow
//! needs (`WIF_PROVIDER`, `WIF_SERVICE_ACCOUNT`). Running it again against
//! an already provisioned project changes nothing and prints the same values.
//!
//! ## Properties
//!
//! - **`#![forbid(unsafe_code)]`**: no `unsafe` blocks.
//! - **Create-and-ignore-conflict**: every resource is created
//!   unconditionally; "already exists" is a success, so there is no
//!   check-then-create race.
//! - **Fail-fast dependents**: nothing is attempted on top of a resource
//!   that failed. Independent branches still complete.
//! - **No credentials held**: authentication is delegated to the `gcloud`
//!   CLI, and its stderr is redacted before it reaches a log or report.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`descriptor`] | Validated repository ids and resource descriptors |
//! | [`config`] | Defaults, config file, overrides |
//! | [`gateway`] | Cloud IAM access (`gcloud` and in-memory backends) |
//! | [`reconcile`] | Builds the dependency-ordered plan |
//! | [`plan`] | Plan entries and ordering checks |
//! | [`executor`] | Runs a plan with retries, bounded concurrency, cancellation |
//! | [`report`] | Final verdict and its renderings |

#![forbid(unsafe_code)]

/// Defaults, JSON config file loading, and override precedence.
pub mod config;

/// Resource descriptors: pool, provider, service account, role and trust
/// bindings, plus the repository identifier they are derived from.
pub mod descriptor;

/// Error taxonomy shared by every layer.
pub mod error;

/// Runs a plan: dependency waits, bounded concurrency, retries with
/// backoff, fail-fast skips, and cancellation.
pub mod executor;

/// The boundary to the cloud IAM API.
pub mod gateway;

/// Plan entries and the topological-order check every plan passes.
pub mod plan;

/// Turns configuration and a repository into an executable plan.
pub mod reconcile;

/// Final verdict plus its text and JSON renderings.
pub mod report;

/// Detects whether the `gcloud` CLI is installed.
pub mod toolcheck;

pub use config::Config;
pub use descriptor::RepoId;
pub use error::ProvisionError;
pub use reconcile::Reconciler;
pub use report::Report;
