//! Report emitter: folds executor results into the final verdict.
//!
//! [`emit`] is pure. The renderings are what the binary prints: two
//! `KEY=value` lines for a ready identity (easy to paste into CI secrets),
//! or a JSON document carrying every operation result.

use std::fmt::Write as _;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::descriptor::{RepoId, ResourceKey};
use crate::executor::{OperationResult, Outcome};
use crate::reconcile::ResolvedIdentity;

pub const REPORT_SCHEMA: &str = "wif-bootstrap/report/v1";

/// Secret name used for the provider resource name.
pub const PROVIDER_SECRET: &str = "WIF_PROVIDER";
/// Secret name used for the service-account email.
pub const SERVICE_ACCOUNT_SECRET: &str = "WIF_SERVICE_ACCOUNT";

/// The two values a workflow needs to authenticate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedIdentity {
    pub provider_resource_name: String,
    pub service_account_email: String,
}

/// A required entry that did not end up existing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntry {
    pub key: ResourceKey,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Ready(ProvisionedIdentity),
    Failed(Vec<FailedEntry>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub repository: RepoId,
    pub project_id: String,
    pub outcome: ReportOutcome,
    pub results: Vec<OperationResult>,
}

impl Report {
    pub fn is_ready(&self) -> bool {
        matches!(self.outcome, ReportOutcome::Ready(_))
    }

    pub fn identity(&self) -> Option<&ProvisionedIdentity> {
        match &self.outcome {
            ReportOutcome::Ready(identity) => Some(identity),
            ReportOutcome::Failed(_) => None,
        }
    }

    pub fn failures(&self) -> &[FailedEntry] {
        match &self.outcome {
            ReportOutcome::Ready(_) => &[],
            ReportOutcome::Failed(failures) => failures,
        }
    }

    /// Failed optional entries. They never make a report `Failed`, but the
    /// operator should still hear about them.
    pub fn warnings(&self) -> Vec<FailedEntry> {
        self.results
            .iter()
            .filter(|r| r.optional)
            .filter_map(failure_of)
            .collect()
    }

    /// 0 when ready, 2 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_ready() {
            0
        } else {
            2
        }
    }
}

fn failure_of(result: &OperationResult) -> Option<FailedEntry> {
    let reason = match &result.outcome {
        Outcome::Created | Outcome::AlreadyExisted => return None,
        Outcome::Failed { reason, .. } => reason.clone(),
        Outcome::Skipped { reason } => format!("skipped: {reason}"),
    };
    Some(FailedEntry {
        key: result.key.clone(),
        reason,
    })
}

/// Builds the report. Ready only if every non-optional entry succeeded.
pub fn emit(results: &[OperationResult], identity: &ResolvedIdentity) -> Report {
    let failures: Vec<FailedEntry> = results
        .iter()
        .filter(|r| !r.optional)
        .filter_map(failure_of)
        .collect();
    let outcome = if failures.is_empty() && !results.is_empty() {
        ReportOutcome::Ready(ProvisionedIdentity {
            provider_resource_name: identity.provider_resource_name.clone(),
            service_account_email: identity.service_account_email.clone(),
        })
    } else {
        ReportOutcome::Failed(failures)
    };
    Report {
        repository: identity.repository.clone(),
        project_id: identity.project_id.clone(),
        outcome,
        results: results.to_vec(),
    }
}

/// `WIF_PROVIDER=...` and `WIF_SERVICE_ACCOUNT=...`, or nothing on failure.
pub fn render_text(report: &Report) -> String {
    match report.identity() {
        Some(id) => format!(
            "{PROVIDER_SECRET}={}\n{SERVICE_ACCOUNT_SECRET}={}\n",
            id.provider_resource_name, id.service_account_email
        ),
        None => String::new(),
    }
}

/// One `resource <key>: <reason>` line per failure.
pub fn render_failures(report: &Report) -> String {
    let mut out = String::new();
    for f in report.failures() {
        let _ = writeln!(out, "resource {}: {}", f.key, f.reason);
    }
    out
}

pub fn render_json(report: &Report) -> Result<Value> {
    let ts = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let result = if report.is_ready() { "READY" } else { "FAILED" };
    Ok(json!({
        "report_schema": REPORT_SCHEMA,
        "version": env!("CARGO_PKG_VERSION"),
        "generated_at": ts,
        "repository": report.repository,
        "project_id": report.project_id,
        "result": result,
        "identity": report.identity(),
        "failures": report.failures(),
        "warnings": report.warnings(),
        "operations": report.results,
    }))
}

/// `gh secret set` commands that store the identity for `repo`.
pub fn secret_commands(repo: &RepoId, identity: &ProvisionedIdentity) -> [String; 2] {
    [
        format!(
            "gh secret set {PROVIDER_SECRET} --repo {repo} --body '{}'",
            identity.provider_resource_name
        ),
        format!(
            "gh secret set {SERVICE_ACCOUNT_SECRET} --repo {repo} --body '{}'",
            identity.service_account_email
        ),
    ]
}
