//! Scope integrity verification.
//!
//! A scope's interval set must be pairwise disjoint-or-nested, depths must
//! track the parent chain, paths must match adjacency, and staffing floors
//! from the level rules should be met. `verify_scope` scans for all four;
//! only interval overlap is fatal. A fatal finding marks the scope's
//! `scope_meta.integrity` as failed, which refuses further structural
//! writes while reads and counter updates continue. The flag stays until
//! an operator repairs the scope and calls [`clear_integrity_failure`].

use anyhow::Context;
use rusqlite::{Connection, TransactionBehavior, params};
use serde::Serialize;

use crate::db::query::IntegrityStatus;
use crate::error::EngineError;
use crate::scope::Scope;
use crate::tree::path;
use crate::tree::validate;

// ---------------------------------------------------------------------------
// Findings
// ---------------------------------------------------------------------------

/// One problem found during verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    /// Two intervals intersect without either containing the other. The
    /// scope's structure can no longer be trusted.
    RangeOverlap { node_a: String, node_b: String },
    /// A node's stored depth disagrees with its parent's depth plus one
    /// (or a root's depth is not zero).
    DepthMismatch {
        node_id: String,
        stored: i64,
        expected: i64,
    },
    /// A stored materialized path disagrees with the one derived from
    /// `parent_id` adjacency. Healed by reconciliation.
    PathMismatch {
        node_id: String,
        stored: String,
        derived: String,
    },
    /// An active parent has fewer active children of a required type than
    /// the level rules ask for. Advisory: creation order makes transient
    /// shortfalls normal.
    ChildShortfall {
        parent_id: String,
        unit_type: String,
        have: i64,
        min: i64,
    },
}

impl Finding {
    /// Whether this finding poisons the scope for structural writes.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::RangeOverlap { .. })
    }
}

/// Report returned by a verification pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub scope: Scope,
    pub nodes_scanned: usize,
    pub findings: Vec<Finding>,
    /// True when this pass marked (or found) the scope failed.
    pub integrity_failed: bool,
}

impl VerifyReport {
    /// Whether the scan found nothing at all.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.findings.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Scan a scope for structural problems.
///
/// Fatal findings (interval overlap) set `scope_meta.integrity` to
/// 'failed' and are logged at error level; everything else is logged at
/// warn level and left for reconciliation or operators. A clean pass never
/// resets a failed flag, that is [`clear_integrity_failure`]'s job.
///
/// # Errors
///
/// Returns [`EngineError::Storage`] if the scan itself fails.
pub fn verify_scope(conn: &mut Connection, scope: &Scope) -> Result<VerifyReport, EngineError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("begin verify transaction")?;

    let (nodes_scanned, findings) = scan(&tx, scope)?;
    let fatal = findings.iter().filter(|f| f.is_fatal()).count();

    if fatal > 0 {
        tx.execute(
            "UPDATE scope_meta SET integrity = ?3 WHERE tenant = ?1 AND domain = ?2",
            params![
                scope.tenant(),
                scope.domain(),
                IntegrityStatus::Failed.as_str(),
            ],
        )
        .context("mark scope integrity failed")?;
        tracing::error!(
            %scope,
            overlaps = fatal,
            "interval overlap detected, structural writes refused for this scope"
        );
    } else if !findings.is_empty() {
        tracing::warn!(%scope, findings = findings.len(), "verification found non-fatal drift");
    }

    tx.commit().context("commit verify transaction")?;

    tracing::info!(
        %scope,
        nodes_scanned,
        findings = findings.len(),
        fatal,
        "verification complete"
    );

    Ok(VerifyReport {
        scope: scope.clone(),
        nodes_scanned,
        findings,
        integrity_failed: fatal > 0,
    })
}

/// Re-verify a repaired scope and reset its integrity flag.
///
/// # Errors
///
/// Returns [`EngineError::IntegrityFailed`] if the scope still has fatal
/// findings, leaving the flag in place.
pub fn clear_integrity_failure(
    conn: &mut Connection,
    scope: &Scope,
) -> Result<VerifyReport, EngineError> {
    let report = verify_scope(conn, scope)?;
    if report.integrity_failed {
        return Err(EngineError::IntegrityFailed(scope.clone()));
    }

    conn.execute(
        "UPDATE scope_meta SET integrity = ?3 WHERE tenant = ?1 AND domain = ?2",
        params![scope.tenant(), scope.domain(), IntegrityStatus::Ok.as_str()],
    )
    .context("reset scope integrity")?;
    tracing::info!(%scope, "integrity failure cleared");

    Ok(report)
}

fn scan(conn: &Connection, scope: &Scope) -> anyhow::Result<(usize, Vec<Finding>)> {
    let nodes_scanned: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM nodes WHERE tenant = ?1 AND domain = ?2",
            params![scope.tenant(), scope.domain()],
            |row| row.get(0),
        )
        .context("count scope nodes")?;

    let mut findings = Vec::new();
    find_overlaps(conn, scope, &mut findings)?;
    find_depth_mismatches(conn, scope, &mut findings)?;
    find_path_mismatches(conn, scope, &mut findings)?;
    find_child_shortfalls(conn, scope, &mut findings)?;

    Ok((usize::try_from(nodes_scanned).unwrap_or(0), findings))
}

/// Report every pair of intervals that intersect without either strictly
/// containing the other. Proper nesting and disjointness never match.
fn find_overlaps(conn: &Connection, scope: &Scope, out: &mut Vec<Finding>) -> anyhow::Result<()> {
    let mut stmt = conn
        .prepare(
            "SELECT a.node_id, b.node_id
             FROM nodes a
             JOIN nodes b ON b.tenant = a.tenant AND b.domain = a.domain
             WHERE a.tenant = ?1 AND a.domain = ?2
               AND a.node_id < b.node_id
               AND a.lft <= b.rgt AND b.lft <= a.rgt
               AND NOT (a.lft < b.lft AND b.rgt < a.rgt)
               AND NOT (b.lft < a.lft AND a.rgt < b.rgt)
             ORDER BY a.lft ASC, b.lft ASC",
        )
        .context("prepare overlap query")?;
    let rows = stmt
        .query_map(params![scope.tenant(), scope.domain()], |row| {
            Ok(Finding::RangeOverlap {
                node_a: row.get(0)?,
                node_b: row.get(1)?,
            })
        })
        .context("execute overlap query")?;
    for row in rows {
        out.push(row.context("read overlap row")?);
    }
    Ok(())
}

fn find_depth_mismatches(
    conn: &Connection,
    scope: &Scope,
    out: &mut Vec<Finding>,
) -> anyhow::Result<()> {
    let mut stmt = conn
        .prepare(
            "SELECT c.node_id, c.depth, p.depth + 1
             FROM nodes c
             JOIN nodes p ON p.node_id = c.parent_id
             WHERE c.tenant = ?1 AND c.domain = ?2 AND c.depth <> p.depth + 1
             ORDER BY c.lft ASC",
        )
        .context("prepare depth query")?;
    let rows = stmt
        .query_map(params![scope.tenant(), scope.domain()], |row| {
            Ok(Finding::DepthMismatch {
                node_id: row.get(0)?,
                stored: row.get(1)?,
                expected: row.get(2)?,
            })
        })
        .context("execute depth query")?;
    for row in rows {
        out.push(row.context("read depth row")?);
    }

    let mut stmt = conn
        .prepare(
            "SELECT node_id, depth FROM nodes
             WHERE tenant = ?1 AND domain = ?2 AND parent_id IS NULL AND depth <> 0",
        )
        .context("prepare root depth query")?;
    let rows = stmt
        .query_map(params![scope.tenant(), scope.domain()], |row| {
            Ok(Finding::DepthMismatch {
                node_id: row.get(0)?,
                stored: row.get(1)?,
                expected: 0,
            })
        })
        .context("execute root depth query")?;
    for row in rows {
        out.push(row.context("read root depth row")?);
    }
    Ok(())
}

fn find_path_mismatches(
    conn: &Connection,
    scope: &Scope,
    out: &mut Vec<Finding>,
) -> anyhow::Result<()> {
    let derived = path::derive_paths(conn, scope)?;

    let mut stmt = conn
        .prepare(
            "SELECT node_id, path FROM nodes
             WHERE tenant = ?1 AND domain = ?2 ORDER BY lft ASC",
        )
        .context("prepare stored path query")?;
    let rows = stmt
        .query_map(params![scope.tenant(), scope.domain()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .context("execute stored path query")?;
    for row in rows {
        let (node_id, stored) = row.context("read stored path")?;
        if let Some(expected) = derived.get(&node_id) {
            if &stored != expected {
                out.push(Finding::PathMismatch {
                    node_id,
                    stored,
                    derived: expected.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Check `min_children` floors: each active parent of a rule's parent type
/// must have at least that many active children of the rule's type.
fn find_child_shortfalls(
    conn: &Connection,
    scope: &Scope,
    out: &mut Vec<Finding>,
) -> anyhow::Result<()> {
    let rules = validate::load_rules(conn, scope)?;

    let mut stmt = conn
        .prepare(
            "SELECT p.node_id, COUNT(c.node_id)
             FROM nodes p
             LEFT JOIN nodes c
               ON c.parent_id = p.node_id AND c.unit_type = ?3 AND c.active = 1
             WHERE p.tenant = ?1 AND p.domain = ?2
               AND p.unit_type = ?4 AND p.active = 1
             GROUP BY p.node_id
             HAVING COUNT(c.node_id) < ?5
             ORDER BY p.node_id ASC",
        )
        .context("prepare child shortfall query")?;

    for rule in &rules {
        let Some(parent_type) = rule.parent_type.as_deref() else {
            continue;
        };
        if rule.min_children == 0 {
            continue;
        }
        let rows = stmt
            .query_map(
                params![
                    scope.tenant(),
                    scope.domain(),
                    rule.unit_type,
                    parent_type,
                    rule.min_children,
                ],
                |row| {
                    Ok(Finding::ChildShortfall {
                        parent_id: row.get(0)?,
                        unit_type: rule.unit_type.clone(),
                        have: row.get(1)?,
                        min: rule.min_children,
                    })
                },
            )
            .context("execute child shortfall query")?;
        for row in rows {
            out.push(row.context("read shortfall row")?);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
