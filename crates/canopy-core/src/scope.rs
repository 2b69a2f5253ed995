//! Scope identity: the (tenant, domain) pair isolating one hierarchy tree.
//!
//! Every node, rule, and lock belongs to exactly one scope. Scope segments
//! are restricted to a filesystem- and SQL-safe charset because they are
//! embedded in lock file names and used as equality keys everywhere.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A scope segment (tenant or domain) failed charset validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "invalid scope segment '{segment}': use lowercase letters, digits, '.', '-', '_' (no leading '.')"
)]
pub struct InvalidScope {
    pub segment: String,
}

/// The (tenant, domain) pair that isolates one hierarchy tree from all others.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    tenant: String,
    domain: String,
}

impl Scope {
    /// Build a scope from validated segments.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidScope`] if either segment is empty, starts with `.`,
    /// or contains characters outside `[a-z0-9._-]`.
    pub fn new(tenant: impl Into<String>, domain: impl Into<String>) -> Result<Self, InvalidScope> {
        let tenant = tenant.into();
        let domain = domain.into();
        check_segment(&tenant)?;
        check_segment(&domain)?;
        Ok(Self { tenant, domain })
    }

    #[must_use]
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// File name of this scope's advisory lock, unique per scope.
    ///
    /// `__` cannot collide across scopes because segments never contain `/`
    /// and the pair is rendered in a fixed order.
    #[must_use]
    pub fn lock_file_name(&self) -> String {
        format!("{}__{}.lock", self.tenant, self.domain)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.domain)
    }
}

impl FromStr for Scope {
    type Err = InvalidScope;

    /// Parse `tenant/domain` (exactly one `/`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((tenant, domain)) = s.split_once('/') else {
            return Err(InvalidScope {
                segment: s.to_string(),
            });
        };
        if domain.contains('/') {
            return Err(InvalidScope {
                segment: s.to_string(),
            });
        }
        Self::new(tenant, domain)
    }
}

fn check_segment(segment: &str) -> Result<(), InvalidScope> {
    let valid = !segment.is_empty()
        && !segment.starts_with('.')
        && segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'));

    if valid {
        Ok(())
    } else {
        Err(InvalidScope {
            segment: segment.to_string(),
        })
    }
}
