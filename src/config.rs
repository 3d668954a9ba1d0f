use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::descriptor::{require_non_empty, validate_resource_id, validate_role};
use crate::error::ValidationError;

/// Maximum config file size (1 MB).
const MAX_CONFIG_BYTES: u64 = 1024 * 1024;

pub const DEFAULT_PROJECT_ID: &str = "ai-hybrid-coach";
pub const DEFAULT_REGION: &str = "us-central1";

/// Upper bound for `max_parallel`.
pub const MAX_PARALLEL_LIMIT: usize = 64;

/// Environment variables consulted for the project id, in order.
pub const PROJECT_ENV_VARS: &[&str] = &["PROJECT_ID", "GOOGLE_CLOUD_PROJECT", "GCP_PROJECT"];

/// One project-level role granted to the deploy service account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGrant {
    pub role: String,
    /// A failed optional grant does not fail the run.
    #[serde(default)]
    pub optional: bool,
}

impl RoleGrant {
    pub fn required(role: &str) -> Self {
        Self {
            role: role.to_string(),
            optional: false,
        }
    }
}

/// Bounded exponential backoff for transient provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Single attempt, no waiting. Handy for tests.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }
}

/// Everything the engine needs, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub project_id: String,
    pub region: String,
    pub pool_id: String,
    pub pool_display_name: String,
    pub provider_id: String,
    pub provider_display_name: String,
    pub service_account_id: String,
    pub service_account_display_name: String,
    pub roles: Vec<RoleGrant>,
    pub retry: RetryPolicy,
    pub max_parallel: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_id: DEFAULT_PROJECT_ID.to_string(),
            region: DEFAULT_REGION.to_string(),
            pool_id: "github-pool".to_string(),
            pool_display_name: "GitHub Actions Pool".to_string(),
            provider_id: "github-provider".to_string(),
            provider_display_name: "GitHub Actions Provider".to_string(),
            service_account_id: "github-actions-deploy".to_string(),
            service_account_display_name: "GitHub Actions Deploy".to_string(),
            roles: vec![
                RoleGrant::required("roles/run.admin"),
                RoleGrant::required("roles/iam.serviceAccountUser"),
                RoleGrant::required("roles/artifactregistry.writer"),
            ],
            retry: RetryPolicy::default(),
            max_parallel: 4,
        }
    }
}

/// Partial overrides read from a JSON config file. Absent fields keep
/// their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub project_id: Option<String>,
    pub region: Option<String>,
    pub pool_id: Option<String>,
    pub pool_display_name: Option<String>,
    pub provider_id: Option<String>,
    pub provider_display_name: Option<String>,
    pub service_account_id: Option<String>,
    pub service_account_display_name: Option<String>,
    pub roles: Option<Vec<RoleGrant>>,
    pub retry: Option<RetryPolicy>,
    pub max_parallel: Option<usize>,
}

impl ConfigFile {
    /// Reads a config file, refusing symlinks and anything over 1 MB.
    pub fn load(path: &Path) -> Result<Self> {
        let meta =
            fs::symlink_metadata(path).with_context(|| format!("stat {}", path.display()))?;
        if meta.file_type().is_symlink() {
            return Err(anyhow!("Refusing to read symlink: {}", path.display()));
        }
        if meta.len() > MAX_CONFIG_BYTES {
            return Err(anyhow!(
                "Config file too large: {} ({} bytes, max {MAX_CONFIG_BYTES} bytes)",
                path.display(),
                meta.len(),
            ));
        }
        let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
    }
}

impl Config {
    pub fn apply_file(mut self, file: ConfigFile) -> Self {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if let Some(v) = file.$field { self.$field = v; })*
            };
        }
        take!(
            project_id,
            region,
            pool_id,
            pool_display_name,
            provider_id,
            provider_display_name,
            service_account_id,
            service_account_display_name,
            roles,
            retry,
            max_parallel
        );
        self
    }

    /// Applies environment/flag overrides for project and region.
    pub fn with_overrides(mut self, project_id: Option<String>, region: Option<String>) -> Self {
        if let Some(p) = project_id {
            self.project_id = p;
        }
        if let Some(r) = region {
            self.region = r;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("project id", &self.project_id)?;
        require_non_empty("region", &self.region)?;
        validate_resource_id("pool id", &self.pool_id, 4, 32)?;
        validate_resource_id("provider id", &self.provider_id, 4, 32)?;
        validate_resource_id("service account id", &self.service_account_id, 6, 30)?;
        if self.roles.is_empty() {
            return Err(ValidationError::Empty { field: "roles" });
        }
        for (idx, grant) in self.roles.iter().enumerate() {
            validate_role(&grant.role)?;
            if self.roles.iter().take(idx).any(|g| g.role == grant.role) {
                return Err(ValidationError::InvalidField {
                    field: "roles",
                    value: grant.role.clone(),
                    reason: "listed more than once".to_string(),
                });
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ValidationError::InvalidField {
                field: "retry.max_attempts",
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }
        if !(1..=MAX_PARALLEL_LIMIT).contains(&self.max_parallel) {
            return Err(ValidationError::InvalidField {
                field: "max_parallel",
                value: self.max_parallel.to_string(),
                reason: format!("must be between 1 and {MAX_PARALLEL_LIMIT}"),
            });
        }
        Ok(())
    }
}

/// First non-empty value among `explicit` and [`PROJECT_ENV_VARS`].
pub fn project_override(
    explicit: Option<String>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<String> {
    explicit.filter(|s| !s.is_empty()).or_else(|| {
        PROJECT_ENV_VARS
            .iter()
            .find_map(|var| lookup(var).filter(|s| !s.is_empty()))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.project_id, DEFAULT_PROJECT_ID);
        assert_eq!(config.region, DEFAULT_REGION);
        assert_eq!(config.pool_id, "github-pool");
        assert_eq!(config.provider_id, "github-provider");
        assert_eq!(config.service_account_id, "github-actions-deploy");
        assert_eq!(config.roles.len(), 3);
        assert!(config.roles.iter().all(|r| !r.optional));
    }

    #[test]
    fn test_load_from_file_overrides_only_given_fields() {
        let mut f = NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{
                "pool_id": "ci-pool",
                "roles": [
                    {{"role": "roles/run.admin"}},
                    {{"role": "roles/storage.admin", "optional": true}}
                ],
                "retry": {{"max_attempts": 5, "base_delay_ms": 10, "max_delay_ms": 100}}
            }}"#
        )
        .unwrap();

        let file = ConfigFile::load(f.path()).unwrap();
        let config = Config::default().apply_file(file);
        assert_eq!(config.pool_id, "ci-pool");
        assert_eq!(config.provider_id, "github-provider");
        assert_eq!(config.roles.len(), 2);
        assert!(config.roles[1].optional);
        assert_eq!(config.retry.max_attempts, 5);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_rejects_unknown_fields() {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, r#"{{"pool": "typo"}}"#).unwrap();
        assert!(ConfigFile::load(f.path()).is_err());
    }

    #[test]
    fn test_load_invalid_json_fails() {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, "not valid json").unwrap();
        assert!(ConfigFile::load(f.path()).is_err());
    }

    #[test]
    fn test_load_nonexistent_file_fails() {
        assert!(ConfigFile::load(Path::new("/nonexistent/wif.json")).is_err());
    }

    #[test]
    fn test_load_rejects_oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let big_file = dir.path().join("huge.json");
        #[allow(clippy::cast_possible_truncation)]
        let data = vec![b' '; (MAX_CONFIG_BYTES as usize) + 1];
        std::fs::write(&big_file, &data).unwrap();

        let err = ConfigFile::load(&big_file).unwrap_err().to_string();
        assert!(err.contains("too large"), "error should mention size: {err}");
    }

    #[cfg(unix)]
    #[test]
    fn test_load_rejects_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let real_file = dir.path().join("real.json");
        std::fs::write(&real_file, "{}").unwrap();
        let link = dir.path().join("link.json");
        std::os::unix::fs::symlink(&real_file, &link).unwrap();

        let err = ConfigFile::load(&link).unwrap_err().to_string();
        assert!(err.contains("symlink"), "error should mention symlink");
    }

    #[test]
    fn test_overrides_win_over_file() {
        let file = ConfigFile {
            project_id: Some("from-file".into()),
            ..ConfigFile::default()
        };
        let config = Config::default()
            .apply_file(file)
            .with_overrides(Some("from-env".into()), None);
        assert_eq!(config.project_id, "from-env");
        assert_eq!(config.region, DEFAULT_REGION);
    }

    #[test]
    fn test_validate_rejects_empty_project_and_region() {
        let config = Config::default().with_overrides(Some(" ".into()), None);
        assert_eq!(
            config.validate().unwrap_err(),
            ValidationError::Empty { field: "project id" }
        );
        let config = Config::default().with_overrides(None, Some(String::new()));
        assert_eq!(
            config.validate().unwrap_err(),
            ValidationError::Empty { field: "region" }
        );
    }

    #[test]
    fn test_validate_rejects_bad_roles_and_limits() {
        let mut config = Config::default();
        config.roles.push(RoleGrant::required(""));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.roles.push(RoleGrant::required("roles/run.admin"));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.roles.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.max_parallel = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_caps_max_parallel() {
        let mut config = Config::default();
        config.max_parallel = MAX_PARALLEL_LIMIT;
        config.validate().unwrap();

        config.max_parallel = MAX_PARALLEL_LIMIT + 1;
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::InvalidField { field: "max_parallel", .. }
        ));

        let file: ConfigFile = serde_json::from_str(r#"{"max_parallel": 18446744073709551615}"#).unwrap();
        let config = Config::default().apply_file(file);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_project_override_precedence() {
        let env = |var: &str| match var {
            "GOOGLE_CLOUD_PROJECT" => Some("gcp-env".to_string()),
            "GCP_PROJECT" => Some("legacy-env".to_string()),
            _ => None,
        };
        assert_eq!(
            project_override(Some("flag".into()), env).as_deref(),
            Some("flag")
        );
        assert_eq!(project_override(None, env).as_deref(), Some("gcp-env"));
        assert_eq!(project_override(None, |_| None), None);
        assert_eq!(
            project_override(Some(String::new()), |v| (v == "GCP_PROJECT")
                .then(|| "legacy".to_string()))
            .as_deref(),
            Some("legacy")
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_millis(1_000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(2_000));
        assert_eq!(policy.delay_after(10), Duration::from_millis(5_000));
    }
}
