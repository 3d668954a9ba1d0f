//! Desired-state model for the five resource kinds.
//!
//! Everything here is a plain value: no I/O, no gateway access. Constructors
//! validate their inputs and return [`ValidationError`] on bad data, so a
//! descriptor that exists is always well-formed.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Location used by every resource in the graph.
pub const GLOBAL_LOCATION: &str = "global";

/// OIDC issuer for GitHub Actions tokens.
pub const GITHUB_OIDC_ISSUER: &str = "https://token.actions.githubusercontent.com";

/// Role granted to the external principal set on the service account.
pub const WORKLOAD_IDENTITY_USER_ROLE: &str = "roles/iam.workloadIdentityUser";

/// Claims copied from the GitHub token into Google attributes.
pub const GITHUB_ATTRIBUTE_MAPPING: &str = "google.subject=assertion.sub,\
attribute.actor=assertion.actor,\
attribute.repository=assertion.repository,\
attribute.repository_owner=assertion.repository_owner";

// Scheme, optional user, and the github.com host (URL or scp-like syntax).
const GITHUB_PREFIX_PATTERN: &str =
    r"(?i)^(?:(?:https?|ssh|git)://)?(?:[a-z0-9._-]+@)?(?:www\.)?github\.com[/:]";
const REPO_ID_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9-]{0,38}/[A-Za-z0-9._-]{1,100}$";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Pool,
    Provider,
    ServiceAccount,
    RoleBinding,
    TrustBinding,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pool => "pool",
            Self::Provider => "provider",
            Self::ServiceAccount => "service_account",
            Self::RoleBinding => "role_binding",
            Self::TrustBinding => "trust_binding",
        }
    }

    /// Kinds this kind must wait for. This is the whole dependency DAG.
    pub fn dependencies(self) -> &'static [ResourceKind] {
        match self {
            Self::Pool | Self::ServiceAccount => &[],
            Self::Provider => &[Self::Pool],
            Self::RoleBinding => &[Self::ServiceAccount],
            Self::TrustBinding => &[Self::ServiceAccount, Self::Pool],
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-qualified identifier of one resource. Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub project: String,
    pub location: String,
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceKey {
    pub fn global(project: &str, kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            project: project.to_string(),
            location: GLOBAL_LOCATION.to_string(),
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}/{}",
            self.kind, self.project, self.location, self.name
        )
    }
}

/// A GitHub repository in normalized `owner/repo` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoId {
    owner: String,
    name: String,
}

impl RepoId {
    /// Parses a repository identifier, accepting full URLs, scp-style
    /// remotes, a trailing `.git` and a trailing `/`.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidRepository {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let prefix = Regex::new(GITHUB_PREFIX_PATTERN).map_err(|e| invalid(&e.to_string()))?;
        let shape = Regex::new(REPO_ID_PATTERN).map_err(|e| invalid(&e.to_string()))?;

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty"));
        }
        let mut s = prefix.replace(trimmed, "").into_owned();
        if s.contains("://") || s.contains('@') {
            return Err(invalid("only github.com repositories are supported"));
        }
        while s.ends_with('/') {
            s.pop();
        }
        if let Some(stripped) = s.strip_suffix(".git") {
            s = stripped.trim_end_matches('/').to_string();
        }

        if !shape.is_match(&s) {
            return Err(invalid("malformed owner or repository name"));
        }
        let Some((owner, name)) = s.split_once('/') else {
            return Err(invalid("missing '/'"));
        };
        if name == "." || name == ".." {
            return Err(invalid("repository name cannot be '.' or '..'"));
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl std::str::FromStr for RepoId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RepoId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RepoId> for String {
    fn from(value: RepoId) -> Self {
        value.to_string()
    }
}

pub fn require_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    Ok(())
}

pub fn validate_role(role: &str) -> Result<(), ValidationError> {
    if role.is_empty() || role.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidRole {
            role: role.to_string(),
        });
    }
    Ok(())
}

/// Checks a lowercase IAM resource id (`[a-z][a-z0-9-]*[a-z0-9]`) of
/// `min..=max` characters.
pub fn validate_resource_id(
    field: &'static str,
    value: &str,
    min: usize,
    max: usize,
) -> Result<(), ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidField {
        field,
        value: value.to_string(),
        reason,
    };
    let len = value.chars().count();
    if len < min || len > max {
        return Err(invalid(format!("length must be {min}..={max}")));
    }
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let starts_ok = value.starts_with(|c: char| c.is_ascii_lowercase());
    let ends_ok = !value.ends_with('-');
    if !(valid_chars && starts_ok && ends_ok) {
        return Err(invalid(
            "use lowercase letters, digits and '-', starting with a letter".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDescriptor {
    pub project_id: String,
    pub pool_id: String,
    pub display_name: String,
}

impl PoolDescriptor {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::global(&self.project_id, ResourceKind::Pool, &self.pool_id)
    }

    pub fn resource_name(&self, project_number: &str) -> String {
        format!(
            "projects/{project_number}/locations/{GLOBAL_LOCATION}/workloadIdentityPools/{}",
            self.pool_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub project_id: String,
    pub pool_id: String,
    pub provider_id: String,
    pub display_name: String,
    pub issuer_uri: String,
    pub attribute_mapping: String,
    pub attribute_condition: String,
}

impl ProviderDescriptor {
    /// OIDC provider for GitHub Actions, restricted to one repository.
    pub fn github(
        project_id: &str,
        pool_id: &str,
        provider_id: &str,
        display_name: &str,
        repo: &RepoId,
    ) -> Self {
        Self {
            project_id: project_id.to_string(),
            pool_id: pool_id.to_string(),
            provider_id: provider_id.to_string(),
            display_name: display_name.to_string(),
            issuer_uri: GITHUB_OIDC_ISSUER.to_string(),
            attribute_mapping: GITHUB_ATTRIBUTE_MAPPING.to_string(),
            attribute_condition: format!("assertion.repository == '{repo}'"),
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::global(
            &self.project_id,
            ResourceKind::Provider,
            format!("{}/{}", self.pool_id, self.provider_id),
        )
    }

    /// Full resource name consumed by `google-github-actions/auth`.
    pub fn resource_name(&self, project_number: &str) -> String {
        format!(
            "projects/{project_number}/locations/{GLOBAL_LOCATION}/workloadIdentityPools/{}/providers/{}",
            self.pool_id, self.provider_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccountDescriptor {
    pub project_id: String,
    pub account_id: String,
    pub display_name: String,
}

impl ServiceAccountDescriptor {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::global(
            &self.project_id,
            ResourceKind::ServiceAccount,
            &self.account_id,
        )
    }

    pub fn email(&self) -> String {
        format!(
            "{}@{}.iam.gserviceaccount.com",
            self.account_id, self.project_id
        )
    }
}

/// Project-level grant of `role` to `member`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBindingDescriptor {
    pub project_id: String,
    pub member: String,
    pub role: String,
    pub optional: bool,
}

impl RoleBindingDescriptor {
    pub fn for_service_account(
        sa: &ServiceAccountDescriptor,
        role: &str,
        optional: bool,
    ) -> Result<Self, ValidationError> {
        validate_role(role)?;
        Ok(Self {
            project_id: sa.project_id.clone(),
            member: format!("serviceAccount:{}", sa.email()),
            role: role.to_string(),
            optional,
        })
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::global(&self.project_id, ResourceKind::RoleBinding, &self.role)
    }
}

/// Lets the repository's principal set impersonate the service account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustBindingDescriptor {
    pub project_id: String,
    pub service_account_email: String,
    pub member: String,
    pub role: String,
}

impl TrustBindingDescriptor {
    /// Needs the numeric project id: principal sets are addressed by number.
    pub fn for_repository(
        pool: &PoolDescriptor,
        project_number: &str,
        sa: &ServiceAccountDescriptor,
        repo: &RepoId,
    ) -> Result<Self, ValidationError> {
        require_non_empty("project number", project_number)?;
        if !project_number.chars().all(|c| c.is_ascii_digit()) {
            return Err(ValidationError::InvalidField {
                field: "project number",
                value: project_number.to_string(),
                reason: "must be numeric".to_string(),
            });
        }
        Ok(Self {
            project_id: sa.project_id.clone(),
            service_account_email: sa.email(),
            member: format!(
                "principalSet://iam.googleapis.com/{}/attribute.repository/{repo}",
                pool.resource_name(project_number)
            ),
            role: WORKLOAD_IDENTITY_USER_ROLE.to_string(),
        })
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::global(&self.project_id, ResourceKind::TrustBinding, &self.member)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Descriptor {
    Pool(PoolDescriptor),
    Provider(ProviderDescriptor),
    ServiceAccount(ServiceAccountDescriptor),
    RoleBinding(RoleBindingDescriptor),
    TrustBinding(TrustBindingDescriptor),
}

impl Descriptor {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Pool(_) => ResourceKind::Pool,
            Self::Provider(_) => ResourceKind::Provider,
            Self::ServiceAccount(_) => ResourceKind::ServiceAccount,
            Self::RoleBinding(_) => ResourceKind::RoleBinding,
            Self::TrustBinding(_) => ResourceKind::TrustBinding,
        }
    }

    pub fn key(&self) -> ResourceKey {
        match self {
            Self::Pool(d) => d.key(),
            Self::Provider(d) => d.key(),
            Self::ServiceAccount(d) => d.key(),
            Self::RoleBinding(d) => d.key(),
            Self::TrustBinding(d) => d.key(),
        }
    }

    /// Only role bindings can be marked optional.
    pub fn is_optional(&self) -> bool {
        matches!(self, Self::RoleBinding(d) if d.optional)
    }
}
