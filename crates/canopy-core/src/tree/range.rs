//! Nested-interval bound maintenance.
//!
//! Every node owns an interval `[lft, rgt]`; a parent's interval strictly
//! contains each child's. That encoding buys the hot reads: ancestors of a
//! node are one range scan, descendants another, and no recursion ever
//! touches SQL.
//!
//! The price is paid here, on writes. Inserting opens a two-slot gap at the
//! parent's right bound; moving a subtree detaches it, closes the old gap,
//! opens a new one at the destination, and re-homes the detached rows by a
//! constant offset. All bound arithmetic happens in bulk `UPDATE`s inside
//! the caller's transaction.
//!
//! Two rules keep the `lft < rgt` table check satisfied mid-flight:
//!
//! - shifts that grow bounds update `rgt` before `lft`; shifts that shrink
//!   update `lft` before `rgt`
//! - a detached subtree is parked at `(-rgt, -lft)`, negated *and* swapped,
//!   so each parked row still has `lft < rgt`
//!
//! Functions here maintain bounds, depths, and counters only. Materialized
//! paths are rewritten separately; see [`crate::tree::path`].

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, params};

use crate::db::query::{self, NodeRow};
use crate::model::{NodeSpec, RootSpec};
use crate::scope::Scope;

/// Insert the root node of a freshly provisioned scope with bounds `[1, 2]`.
///
/// # Errors
///
/// Returns an error if the insert fails, including when the scope already
/// has a root (unique index).
pub fn insert_root(
    conn: &Connection,
    scope: &Scope,
    node_id: &str,
    unit_type: &str,
    level: i64,
    root: &RootSpec,
    now_us: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO nodes (
            node_id, tenant, domain, unit_type, level, code, name,
            parent_id, lft, rgt, depth, path,
            valid_from_us, valid_to_us, active, created_at_us, updated_at_us
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, 1, 2, 0, ?1, ?8, ?9, 1, ?10, ?10)",
        params![
            node_id,
            scope.tenant(),
            scope.domain(),
            unit_type,
            level,
            root.code,
            root.name,
            root.window.valid_from_us,
            root.window.valid_to_us,
            now_us,
        ],
    )
    .with_context(|| format!("insert root '{node_id}' for '{scope}'"))?;
    Ok(())
}

/// Insert a new leaf under `parent`, shifting every bound at or past the
/// parent's right bound up by two.
///
/// Bound shifts deliberately do not stamp `updated_at_us`: the shifted rows
/// did not change in any caller-visible way.
///
/// # Errors
///
/// Returns an error if any statement fails.
pub fn insert_child(
    conn: &Connection,
    scope: &Scope,
    parent: &NodeRow,
    node_id: &str,
    level: i64,
    spec: &NodeSpec,
    now_us: i64,
) -> Result<()> {
    let gap = parent.rgt;

    // Grow: rgt before lft.
    conn.execute(
        "UPDATE nodes SET rgt = rgt + 2 \
         WHERE tenant = ?1 AND domain = ?2 AND rgt >= ?3",
        params![scope.tenant(), scope.domain(), gap],
    )
    .context("open gap (rgt)")?;
    conn.execute(
        "UPDATE nodes SET lft = lft + 2 \
         WHERE tenant = ?1 AND domain = ?2 AND lft >= ?3",
        params![scope.tenant(), scope.domain(), gap],
    )
    .context("open gap (lft)")?;

    conn.execute(
        "INSERT INTO nodes (
            node_id, tenant, domain, unit_type, level, code, name,
            parent_id, lft, rgt, depth, path,
            valid_from_us, valid_to_us, active, created_at_us, updated_at_us
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 1, ?15, ?15)",
        params![
            node_id,
            scope.tenant(),
            scope.domain(),
            spec.unit_type,
            level,
            spec.code,
            spec.name,
            parent.node_id,
            gap,
            gap + 1,
            parent.depth + 1,
            format!("{}/{}", parent.path, node_id),
            spec.window.valid_from_us,
            spec.window.valid_to_us,
            now_us,
        ],
    )
    .with_context(|| format!("insert child '{node_id}' under '{}'", parent.node_id))?;

    Ok(())
}

/// Move a whole subtree under a new parent, keeping its internal shape.
///
/// The caller has already validated the move (no cycle, destination active
/// and permitted). Steps, all on the same connection and transaction:
///
/// 1. subtract the subtree's counters from the old ancestor chain
/// 2. park the subtree at negated-and-swapped bounds
/// 3. close the vacated gap
/// 4. re-read the destination (its bounds may just have shifted) and open
///    a gap of the subtree's width at its right bound
/// 5. re-home the parked rows by a constant offset and depth delta
/// 6. repoint `parent_id` and stamp the moved node
/// 7. add the subtree's counters onto the new ancestor chain
///
/// Materialized paths are left untouched; callers rewrite them via
/// [`crate::tree::path::rewrite_subtree_paths`].
///
/// # Errors
///
/// Returns an error if the node or destination vanished mid-transaction or
/// any statement fails.
pub fn move_subtree(
    conn: &Connection,
    scope: &Scope,
    node_id: &str,
    new_parent_id: &str,
    now_us: i64,
) -> Result<()> {
    let Some(node) = query::get_node(conn, scope, node_id)? else {
        bail!("node '{node_id}' vanished before move");
    };
    let width = node.width();

    // 1. Counters off the old chain. The chain-minimum invariant (every
    // ancestor carries at least its descendants' counters) keeps the
    // non-negative table check satisfied.
    conn.execute(
        "UPDATE nodes \
         SET total_count = total_count - ?4, active_count = active_count - ?5 \
         WHERE tenant = ?1 AND domain = ?2 \
           AND lft < ?3 AND rgt > ?6",
        params![
            scope.tenant(),
            scope.domain(),
            node.lft,
            node.total_count,
            node.active_count,
            node.rgt,
        ],
    )
    .context("counters off old chain")?;

    // 2. Park the subtree at (-rgt, -lft).
    conn.execute(
        "UPDATE nodes SET lft = -rgt, rgt = -lft \
         WHERE tenant = ?1 AND domain = ?2 AND lft >= ?3 AND rgt <= ?4",
        params![scope.tenant(), scope.domain(), node.lft, node.rgt],
    )
    .context("park subtree")?;

    // 3. Close the gap. Shrink: lft before rgt. Parked rows are negative
    // and never match.
    conn.execute(
        "UPDATE nodes SET lft = lft - ?4 \
         WHERE tenant = ?1 AND domain = ?2 AND lft > ?3",
        params![scope.tenant(), scope.domain(), node.rgt, width],
    )
    .context("close gap (lft)")?;
    conn.execute(
        "UPDATE nodes SET rgt = rgt - ?4 \
         WHERE tenant = ?1 AND domain = ?2 AND rgt > ?3",
        params![scope.tenant(), scope.domain(), node.rgt, width],
    )
    .context("close gap (rgt)")?;

    // 4. Re-read the destination and open a gap at its right bound.
    let Some(dest) = query::get_node(conn, scope, new_parent_id)? else {
        bail!("destination '{new_parent_id}' vanished before move");
    };
    let gap = dest.rgt;

    // Grow: rgt before lft.
    conn.execute(
        "UPDATE nodes SET rgt = rgt + ?4 \
         WHERE tenant = ?1 AND domain = ?2 AND rgt >= ?3",
        params![scope.tenant(), scope.domain(), gap, width],
    )
    .context("open gap (rgt)")?;
    conn.execute(
        "UPDATE nodes SET lft = lft + ?4 \
         WHERE tenant = ?1 AND domain = ?2 AND lft >= ?3",
        params![scope.tenant(), scope.domain(), gap, width],
    )
    .context("open gap (lft)")?;

    // 5. Re-home. A parked row (-r, -l) lands at (l + offset, r + offset);
    // SET expressions read the pre-update values.
    let offset = gap - node.lft;
    let depth_delta = dest.depth + 1 - node.depth;
    conn.execute(
        "UPDATE nodes \
         SET lft = -rgt + ?3, rgt = -lft + ?3, depth = depth + ?4 \
         WHERE tenant = ?1 AND domain = ?2 AND lft < 0",
        params![scope.tenant(), scope.domain(), offset, depth_delta],
    )
    .context("re-home subtree")?;

    // 6. Repoint the moved node.
    conn.execute(
        "UPDATE nodes SET parent_id = ?2, updated_at_us = ?3 WHERE node_id = ?1",
        params![node.node_id, dest.node_id, now_us],
    )
    .context("repoint parent")?;

    // 7. Counters onto the new chain. The subtree now spans
    // [gap, gap + width - 1]; strict ancestors surround that interval.
    conn.execute(
        "UPDATE nodes \
         SET total_count = total_count + ?4, active_count = active_count + ?5 \
         WHERE tenant = ?1 AND domain = ?2 \
           AND lft < ?3 AND rgt > ?6",
        params![
            scope.tenant(),
            scope.domain(),
            gap,
            node.total_count,
            node.active_count,
            gap + width - 1,
        ],
    )
    .context("counters onto new chain")?;

    Ok(())
}
