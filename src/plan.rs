//! Plans: dependency-ordered lists of operations.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::descriptor::{Descriptor, ResourceKey, ResourceKind};
use crate::error::ProvisionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Create a resource (pool, provider, service account).
    Create,
    /// Add an IAM binding.
    Grant,
}

impl Operation {
    pub fn for_kind(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Pool | ResourceKind::Provider | ResourceKind::ServiceAccount => {
                Self::Create
            }
            ResourceKind::RoleBinding | ResourceKind::TrustBinding => Self::Grant,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Grant => "grant",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub operation: Operation,
    pub descriptor: Descriptor,
    /// Keys of the entries that must resolve successfully first.
    pub depends_on: Vec<ResourceKey>,
    pub optional: bool,
}

impl PlanEntry {
    pub fn key(&self) -> ResourceKey {
        self.descriptor.key()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    entries: Vec<PlanEntry>,
}

impl Plan {
    /// Wraps `entries`, rejecting duplicates, dangling dependencies and
    /// any order that is not topological.
    pub fn new(entries: Vec<PlanEntry>) -> Result<Self, ProvisionError> {
        let plan = Self { entries };
        plan.validate()?;
        Ok(plan)
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position(&self, key: &ResourceKey) -> Option<usize> {
        self.entries.iter().position(|e| &e.key() == key)
    }

    /// Index of the first entry of `kind`.
    pub fn position_of_kind(&self, kind: ResourceKind) -> Option<usize> {
        self.entries.iter().position(|e| e.descriptor.kind() == kind)
    }

    fn validate(&self) -> Result<(), ProvisionError> {
        let mut seen: HashSet<ResourceKey> = HashSet::new();
        for entry in &self.entries {
            let key = entry.key();
            for dep in &entry.depends_on {
                if seen.contains(dep) {
                    continue;
                }
                let reason = if self.position(dep).is_some() {
                    format!("{key} is scheduled before its dependency {dep}")
                } else {
                    format!("{key} depends on {dep}, which is not in the plan")
                };
                return Err(ProvisionError::Plan(reason));
            }
            if !seen.insert(key.clone()) {
                return Err(ProvisionError::Plan(format!("duplicate entry for {key}")));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, entry) in self.entries.iter().enumerate() {
            write!(f, "{:>2}. {} {}", idx + 1, entry.operation, entry.key())?;
            if entry.optional {
                f.write_str(" (optional)")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
