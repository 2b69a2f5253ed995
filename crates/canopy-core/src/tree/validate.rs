//! Placement rules for the organizational tree.
//!
//! Every mutation that attaches a node somewhere (create, reparent) runs
//! through this module before any bound shifts. Checks are read-only and run
//! inside the caller's transaction, so a passed validation cannot be
//! invalidated by a concurrent writer.
//!
//! # Terminology
//!
//! - **Unit type**: the organizational kind of a node (`hq`, `province`,
//!   `ward`, ...). Types are scope-specific, defined by level rules.
//! - **Level rule**: one row per unit type saying which parent type it may
//!   attach under, its numeric level, and optional child-count bounds.
//!   The single rule with no `parent_type` is the root rule.
//! - **Validity window**: optional `[valid_from_us, valid_to_us)` range.
//!   A child's window must lie inside its parent's.
//!
//! # Cycle prevention
//!
//! `validate_reparent` rejects any destination whose interval lies inside
//! the moved node's interval. That single containment test covers a
//! descendant destination, the node itself, and the root (whose interval
//! contains everything, so the root can never move).
//!
//! # Error handling
//!
//! All checks return [`PlacementError`], which distinguishes domain
//! refusals (bad parent, cycle, window, limits) from database errors.

#![allow(clippy::must_use_candidate, clippy::module_name_repetitions)]

use anyhow::Context as AnyhowContext;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::db::query::{self, NodeRow};
use crate::error::ErrorCode;
use crate::model::{NodeSpec, Window};
use crate::scope::Scope;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One placement rule: where a unit type may attach and in what numbers.
///
/// `parent_type = None` marks the root rule; exactly one per scope.
/// A rule may name its own type as parent to allow recursive nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelRule {
    pub unit_type: String,
    pub level: i64,
    #[serde(default)]
    pub parent_type: Option<String>,
    #[serde(default)]
    pub min_children: i64,
    #[serde(default)]
    pub max_children: Option<i64>,
}

/// Result of a successful create validation: the resolved parent row and
/// the level the new node will carry.
#[derive(Debug, Clone)]
pub struct CreatePlacement {
    pub parent: NodeRow,
    pub level: i64,
}

/// Errors that can occur while validating a placement.
#[derive(Debug)]
pub enum PlacementError {
    /// The named parent does not exist anywhere in the store.
    ParentNotFound { parent_id: String },
    /// The node exists but belongs to a different scope than requested.
    ScopeMismatch { node_id: String },
    /// The target parent is deactivated.
    NodeInactive { node_id: String },
    /// No level rule defines the requested unit type.
    UnknownUnitType { unit_type: String },
    /// The rules forbid this unit type under this parent type.
    TypeNotPermitted {
        unit_type: String,
        parent_type: String,
    },
    /// The scope already has a root node.
    RootAlreadyExists,
    /// A sibling under the same parent already uses this code.
    DuplicateCode { code: String, parent_id: String },
    /// The child's validity window extends outside the parent's.
    WindowOutsideParent,
    /// The parent already holds the maximum number of children of this type.
    ChildLimitReached {
        parent_id: String,
        unit_type: String,
        limit: i64,
    },
    /// The proposed destination lies inside the moved node's own subtree.
    CycleDetected {
        node_id: String,
        new_parent_id: String,
    },
    /// An underlying database error.
    Db(anyhow::Error),
}

impl PlacementError {
    /// Machine-readable code associated with this refusal.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::ParentNotFound { .. } => ErrorCode::ParentNotFound,
            Self::ScopeMismatch { .. } => ErrorCode::ScopeMismatch,
            Self::NodeInactive { .. } => ErrorCode::NodeInactive,
            Self::UnknownUnitType { .. } | Self::TypeNotPermitted { .. } => {
                ErrorCode::TypeNotPermitted
            }
            Self::RootAlreadyExists => ErrorCode::RootAlreadyExists,
            Self::DuplicateCode { .. } => ErrorCode::DuplicateCode,
            Self::WindowOutsideParent => ErrorCode::WindowOutsideParent,
            Self::ChildLimitReached { .. } => ErrorCode::ChildLimitReached,
            Self::CycleDetected { .. } => ErrorCode::CycleDetected,
            Self::Db(_) => ErrorCode::StorageFailure,
        }
    }
}

impl fmt::Display for PlacementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ParentNotFound { parent_id } => {
                write!(f, "parent node not found: '{parent_id}'")
            }
            Self::ScopeMismatch { node_id } => {
                write!(f, "node '{node_id}' belongs to a different scope")
            }
            Self::NodeInactive { node_id } => {
                write!(f, "node '{node_id}' is deactivated and accepts no children")
            }
            Self::UnknownUnitType { unit_type } => {
                write!(f, "no level rule defines unit type '{unit_type}'")
            }
            Self::TypeNotPermitted {
                unit_type,
                parent_type,
            } => write!(
                f,
                "unit type '{unit_type}' is not permitted under '{parent_type}'"
            ),
            Self::RootAlreadyExists => write!(f, "scope already has a root node"),
            Self::DuplicateCode { code, parent_id } => write!(
                f,
                "code '{code}' is already used by a sibling under '{parent_id}'"
            ),
            Self::WindowOutsideParent => {
                write!(f, "validity window extends outside the parent's window")
            }
            Self::ChildLimitReached {
                parent_id,
                unit_type,
                limit,
            } => write!(
                f,
                "parent '{parent_id}' already has {limit} children of type '{unit_type}'"
            ),
            Self::CycleDetected {
                node_id,
                new_parent_id,
            } => write!(
                f,
                "moving '{node_id}' under '{new_parent_id}' would create a cycle"
            ),
            Self::Db(e) => write!(f, "database error: {e}"),
        }
    }
}

impl std::error::Error for PlacementError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Self::Db(e) = self {
            Some(e.as_ref())
        } else {
            None
        }
    }
}

impl From<anyhow::Error> for PlacementError {
    fn from(e: anyhow::Error) -> Self {
        Self::Db(e)
    }
}

// ---------------------------------------------------------------------------
// Rule persistence
// ---------------------------------------------------------------------------

/// Load a scope's level rules, lowest level first.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn load_rules(conn: &Connection, scope: &Scope) -> anyhow::Result<Vec<LevelRule>> {
    let mut stmt = conn
        .prepare(
            "SELECT unit_type, level, parent_type, min_children, max_children \
             FROM level_rules \
             WHERE tenant = ?1 AND domain = ?2 \
             ORDER BY level ASC, unit_type ASC",
        )
        .context("prepare load_rules query")?;

    let rows = stmt
        .query_map(params![scope.tenant(), scope.domain()], |row| {
            Ok(LevelRule {
                unit_type: row.get(0)?,
                level: row.get(1)?,
                parent_type: row.get(2)?,
                min_children: row.get(3)?,
                max_children: row.get(4)?,
            })
        })
        .with_context(|| format!("execute load_rules for '{scope}'"))?;

    let mut rules = Vec::new();
    for row in rows {
        rules.push(row.context("read level rule row")?);
    }
    Ok(rules)
}

/// Persist a scope's level rules. Insert-only; rules are written once at
/// scope creation.
///
/// # Errors
///
/// Returns an error if any insert fails.
pub fn save_rules(conn: &Connection, scope: &Scope, rules: &[LevelRule]) -> anyhow::Result<()> {
    let mut stmt = conn
        .prepare(
            "INSERT INTO level_rules \
             (tenant, domain, unit_type, level, parent_type, min_children, max_children) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .context("prepare save_rules insert")?;

    for rule in rules {
        stmt.execute(params![
            scope.tenant(),
            scope.domain(),
            rule.unit_type,
            rule.level,
            rule.parent_type,
            rule.min_children,
            rule.max_children,
        ])
        .with_context(|| format!("insert level rule for '{}'", rule.unit_type))?;
    }
    Ok(())
}

/// Sanity-check a rule set before provisioning a scope with it.
///
/// Returns the root rule on success, or a human-readable reason on refusal.
/// Checked here rather than left to SQL so the caller gets one clear message
/// instead of a constraint violation.
///
/// # Errors
///
/// Returns a reason string when the rule set is unusable: empty, multiple or
/// missing root rules, duplicate unit types, or a `parent_type` that no rule
/// defines.
pub fn check_rules(rules: &[LevelRule]) -> Result<&LevelRule, String> {
    if rules.is_empty() {
        return Err("rule set is empty".to_string());
    }

    let mut seen = std::collections::HashSet::new();
    for rule in rules {
        if !seen.insert(rule.unit_type.as_str()) {
            return Err(format!("duplicate rule for unit type '{}'", rule.unit_type));
        }
    }

    let mut roots = rules.iter().filter(|r| r.parent_type.is_none());
    let root = roots
        .next()
        .ok_or_else(|| "no root rule (one rule must omit parent_type)".to_string())?;
    if let Some(extra) = roots.next() {
        return Err(format!(
            "multiple root rules: '{}' and '{}'",
            root.unit_type, extra.unit_type
        ));
    }

    for rule in rules {
        if let Some(parent_type) = &rule.parent_type {
            if !seen.contains(parent_type.as_str()) {
                return Err(format!(
                    "rule for '{}' names undefined parent type '{parent_type}'",
                    rule.unit_type
                ));
            }
        }
    }

    Ok(root)
}

/// Find the rule governing `child_type` and check it may attach under a
/// parent of `parent_type`.
///
/// # Errors
///
/// Returns [`PlacementError::UnknownUnitType`] when no rule defines the
/// child type, or [`PlacementError::TypeNotPermitted`] when the rule names
/// a different parent type.
pub fn check_type_permitted<'a>(
    rules: &'a [LevelRule],
    parent_type: &str,
    child_type: &str,
) -> Result<&'a LevelRule, PlacementError> {
    let rule = rules
        .iter()
        .find(|r| r.unit_type == child_type)
        .ok_or_else(|| PlacementError::UnknownUnitType {
            unit_type: child_type.to_string(),
        })?;

    match rule.parent_type.as_deref() {
        Some(expected) if expected == parent_type => Ok(rule),
        _ => Err(PlacementError::TypeNotPermitted {
            unit_type: child_type.to_string(),
            parent_type: parent_type.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Placement checks
// ---------------------------------------------------------------------------

/// Validate a node creation against the scope's rules and the parent's
/// current state.
///
/// # Errors
///
/// Returns a [`PlacementError`] describing the first failed check: parent
/// lookup, parent activity, type permission, window containment, sibling
/// code uniqueness, then child limit.
pub fn validate_create(
    conn: &Connection,
    scope: &Scope,
    spec: &NodeSpec,
) -> Result<CreatePlacement, PlacementError> {
    let parent = query::get_node_any_scope(conn, &spec.parent_id)?.ok_or_else(|| {
        PlacementError::ParentNotFound {
            parent_id: spec.parent_id.clone(),
        }
    })?;

    if parent.tenant != scope.tenant() || parent.domain != scope.domain() {
        return Err(PlacementError::ScopeMismatch {
            node_id: parent.node_id,
        });
    }
    if !parent.active {
        return Err(PlacementError::NodeInactive {
            node_id: parent.node_id,
        });
    }

    let rules = load_rules(conn, scope)?;
    let rule = check_type_permitted(&rules, &parent.unit_type, &spec.unit_type)?;

    check_window(&spec.window, &parent)?;
    check_sibling_code(conn, &parent.node_id, &spec.code, None)?;
    check_child_limit(conn, &parent.node_id, rule, None)?;

    Ok(CreatePlacement {
        level: rule.level,
        parent,
    })
}

/// Validate moving `node` under `new_parent_id`.
///
/// The moved subtree keeps its internal shape, so only the node itself is
/// re-checked against the destination: cycle, destination activity, type
/// permission, window containment, sibling code, and child limit. The code
/// and limit checks exclude the node itself so a same-parent move is a
/// no-op rather than a refusal.
///
/// # Errors
///
/// Returns a [`PlacementError`] describing the first failed check.
pub fn validate_reparent(
    conn: &Connection,
    scope: &Scope,
    node: &NodeRow,
    new_parent_id: &str,
) -> Result<(), PlacementError> {
    let new_parent = query::get_node_any_scope(conn, new_parent_id)?.ok_or_else(|| {
        PlacementError::ParentNotFound {
            parent_id: new_parent_id.to_string(),
        }
    })?;

    if new_parent.tenant != scope.tenant() || new_parent.domain != scope.domain() {
        return Err(PlacementError::ScopeMismatch {
            node_id: new_parent.node_id,
        });
    }

    // Destination inside the moved interval covers descendant, self, and
    // root-move cases in one comparison.
    if new_parent.lft >= node.lft && new_parent.rgt <= node.rgt {
        return Err(PlacementError::CycleDetected {
            node_id: node.node_id.clone(),
            new_parent_id: new_parent.node_id,
        });
    }

    if !new_parent.active {
        return Err(PlacementError::NodeInactive {
            node_id: new_parent.node_id,
        });
    }

    let rules = load_rules(conn, scope)?;
    let rule = check_type_permitted(&rules, &new_parent.unit_type, &node.unit_type)?;

    check_window(&node.window(), &new_parent)?;
    check_sibling_code(conn, &new_parent.node_id, &node.code, Some(&node.node_id))?;
    check_child_limit(conn, &new_parent.node_id, rule, Some(&node.node_id))?;

    Ok(())
}

fn check_window(window: &Window, parent: &NodeRow) -> Result<(), PlacementError> {
    if window.within(&parent.window()) {
        Ok(())
    } else {
        Err(PlacementError::WindowOutsideParent)
    }
}

fn check_sibling_code(
    conn: &Connection,
    parent_id: &str,
    code: &str,
    exclude: Option<&str>,
) -> Result<(), PlacementError> {
    let taken: bool = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1 FROM nodes
                WHERE parent_id = ?1 AND code = ?2 AND node_id <> ?3
             )",
            params![parent_id, code, exclude.unwrap_or("")],
            |row| row.get(0),
        )
        .context("query sibling codes")?;

    if taken {
        Err(PlacementError::DuplicateCode {
            code: code.to_string(),
            parent_id: parent_id.to_string(),
        })
    } else {
        Ok(())
    }
}

fn check_child_limit(
    conn: &Connection,
    parent_id: &str,
    rule: &LevelRule,
    exclude: Option<&str>,
) -> Result<(), PlacementError> {
    let Some(limit) = rule.max_children else {
        return Ok(());
    };

    // Deactivated children free their slot.
    let have: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM nodes
             WHERE parent_id = ?1 AND unit_type = ?2 AND active = 1 AND node_id <> ?3",
            params![parent_id, rule.unit_type, exclude.unwrap_or("")],
            |row| row.get(0),
        )
        .context("count children for limit check")?;

    if have >= limit {
        Err(PlacementError::ChildLimitReached {
            parent_id: parent_id.to_string(),
            unit_type: rule.unit_type.clone(),
            limit,
        })
    } else {
        Ok(())
    }
}
