//! Cumulative membership counter propagation.
//!
//! Each node carries `total_count` and `active_count` for its whole
//! subtree, so a delta applied at a node must land on the node *and* every
//! ancestor. In interval terms that chain is exactly the rows whose
//! interval contains the target's, so one bulk `UPDATE` with a containment
//! predicate touches `depth + 1` rows and nothing else.
//!
//! Underflow is checked on the target node only. The chain-minimum
//! invariant (an ancestor's counters are at least any descendant's) makes
//! that check sufficient for the whole chain; if drift has broken the
//! invariant, the non-negative table check aborts the statement and
//! reconciliation repairs the chain.

use anyhow::Context as AnyhowContext;
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::db::query::NodeRow;
use crate::error::EngineError;
use crate::model::MembershipTransition;
use crate::scope::Scope;

/// What happened to a requested counter change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeltaOutcome {
    /// The delta landed on the target and its ancestor chain.
    Applied { rows_touched: usize },
    /// Per-delta propagation is switched off for the scope; counters are
    /// left for a closing reconciliation pass.
    Suppressed,
}

/// Apply a membership delta at `node`, propagating up the ancestor chain.
///
/// Returns the number of rows touched (`depth + 1` on success, `0` for a
/// zero delta).
///
/// # Errors
///
/// Returns [`EngineError::CounterUnderflow`] when the node's own counters
/// would drop below zero, or [`EngineError::Storage`] on database failure.
pub fn apply_delta(
    conn: &Connection,
    scope: &Scope,
    node: &NodeRow,
    total_delta: i64,
    active_delta: i64,
) -> Result<usize, EngineError> {
    if total_delta == 0 && active_delta == 0 {
        return Ok(0);
    }

    if node.total_count + total_delta < 0 || node.active_count + active_delta < 0 {
        return Err(EngineError::CounterUnderflow {
            node_id: node.node_id.clone(),
            total: node.total_count,
            active: node.active_count,
            total_delta,
            active_delta,
        });
    }

    let rows_touched = conn
        .execute(
            "UPDATE nodes \
             SET total_count = total_count + ?5, active_count = active_count + ?6 \
             WHERE tenant = ?1 AND domain = ?2 AND lft <= ?3 AND rgt >= ?4",
            params![
                scope.tenant(),
                scope.domain(),
                node.lft,
                node.rgt,
                total_delta,
                active_delta,
            ],
        )
        .with_context(|| format!("apply delta at '{}'", node.node_id))?;

    Ok(rows_touched)
}

/// Apply a member state transition at `node`.
///
/// The transition's state pair maps onto a `(total, active)` delta; pairs
/// with no counter effect (for example pending to lapsed) touch no rows.
///
/// # Errors
///
/// Same as [`apply_delta`].
pub fn apply_transition(
    conn: &Connection,
    scope: &Scope,
    node: &NodeRow,
    transition: &MembershipTransition,
) -> Result<usize, EngineError> {
    let (total_delta, active_delta) = transition.deltas();
    apply_delta(conn, scope, node, total_delta, active_delta)
}

/// Move one member's tallies from `from`'s chain to `to`'s chain.
///
/// `active` says whether the member counts toward active membership; the
/// total always moves. Shared ancestors are decremented and re-incremented
/// in the same transaction, so their counters see no net change. A transfer
/// onto the same node touches no rows.
///
/// # Errors
///
/// Returns [`EngineError::CounterUnderflow`] when `from` has no member to
/// give up, or [`EngineError::Storage`] on database failure.
pub fn transfer_member(
    conn: &Connection,
    scope: &Scope,
    from: &NodeRow,
    to: &NodeRow,
    active: bool,
) -> Result<usize, EngineError> {
    if from.node_id == to.node_id {
        return Ok(0);
    }

    let active_delta = i64::from(active);
    let removed = apply_delta(conn, scope, from, -1, -active_delta)?;
    let added = apply_delta(conn, scope, to, 1, active_delta)?;
    Ok(removed + added)
}
