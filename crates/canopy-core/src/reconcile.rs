//! Counter and path reconciliation against an authoritative tally feed.
//!
//! Cumulative counters drift when per-delta propagation was switched off
//! for a bulk import, or when an external membership system and this store
//! disagree. `cnp reconcile` replays authority over the whole scope: every
//! node's counters are recomputed from the feed's per-node tallies and
//! overwritten where they differ, and stale materialized paths are repaired
//! from `parent_id` adjacency. Each correction is logged; the operation is
//! idempotent, so a second run right after reports zero corrections.

use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use rusqlite::{Connection, TransactionBehavior, params};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::model::now_us;
use crate::scope::Scope;
use crate::tree::path;

// ---------------------------------------------------------------------------
// Tally feed
// ---------------------------------------------------------------------------

/// Authoritative per-node membership tallies.
///
/// `total`/`active` count the members registered directly at the node, not
/// its subtree; reconciliation derives the cumulative values itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberTally {
    pub node_id: String,
    pub total: i64,
    pub active: i64,
}

/// A source of authoritative tallies, typically the membership register
/// this store aggregates for.
pub trait MembershipSource {
    /// Fetch the scope's per-node tallies.
    ///
    /// Called outside the reconciliation transaction: a slow or failing
    /// feed never holds the database write lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed cannot be read.
    fn tallies(&self, scope: &Scope) -> anyhow::Result<Vec<MemberTally>>;
}

/// Tally feed backed by a JSON file: an array of `{node_id, total, active}`
/// objects, the hand-off format of the bulk-import pipeline.
#[derive(Debug, Clone)]
pub struct JsonTallySource {
    path: std::path::PathBuf,
}

impl JsonTallySource {
    #[must_use]
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MembershipSource for JsonTallySource {
    fn tallies(&self, _scope: &Scope) -> anyhow::Result<Vec<MemberTally>> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read tally file {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parse tally file {}", self.path.display()))
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// One corrected counter pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterCorrection {
    pub node_id: String,
    pub stored_total: i64,
    pub stored_active: i64,
    pub expected_total: i64,
    pub expected_active: i64,
}

/// Report returned after a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub scope: Scope,
    /// Nodes examined (every node in the scope).
    pub nodes_scanned: usize,
    /// Counter pairs that were overwritten.
    pub corrections: Vec<CounterCorrection>,
    /// Materialized paths rewritten from adjacency.
    pub paths_repaired: usize,
    /// Tally entries naming nodes this scope does not have, skipped.
    pub unknown_nodes: Vec<String>,
    /// Wall-clock elapsed time.
    #[serde(skip)]
    pub elapsed: Duration,
}

impl ReconcileReport {
    /// Whether the pass found nothing to fix.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.corrections.is_empty() && self.paths_repaired == 0 && self.unknown_nodes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Reconcile a scope's counters and paths against an authoritative feed.
///
/// 1. Fetches tallies from `source` (outside the transaction)
/// 2. Partitions out tallies for unknown nodes
/// 3. Loads the known tallies into a temp table
/// 4. Recomputes each node's cumulative counters with one containment
///    subquery and overwrites mismatches
/// 5. Recomputes materialized paths from adjacency and repairs mismatches
/// 6. Stamps `scope_meta` with the reconcile time and correction count
///
/// Nodes absent from the feed count zero direct members; deactivated nodes
/// are treated like any other, so historical counters survive verbatim
/// when the feed still reports them.
///
/// # Errors
///
/// Returns [`EngineError::Storage`] if the feed fails, the feed contains
/// duplicate node ids, or any statement fails.
pub fn reconcile_scope(
    conn: &mut Connection,
    scope: &Scope,
    source: &dyn MembershipSource,
) -> Result<ReconcileReport, EngineError> {
    let start = Instant::now();

    let tallies = source
        .tallies(scope)
        .with_context(|| format!("fetch tallies for '{scope}'"))?;

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("begin reconcile transaction")?;

    let (known, unknown_nodes) = partition_tallies(&tx, scope, tallies)?;
    for node_id in &unknown_nodes {
        tracing::warn!(%scope, node_id, "tally references unknown node, skipped");
    }

    load_tally_table(&tx, &known)?;

    let (nodes_scanned, corrections) = correct_counters(&tx, scope)?;
    let paths_repaired = repair_paths(&tx, scope)?;

    tx.execute(
        "UPDATE scope_meta \
         SET last_reconcile_at_us = ?3, corrections_total = corrections_total + ?4 \
         WHERE tenant = ?1 AND domain = ?2",
        params![
            scope.tenant(),
            scope.domain(),
            now_us(),
            i64::try_from(corrections.len() + paths_repaired).unwrap_or(i64::MAX),
        ],
    )
    .context("stamp scope_meta after reconcile")?;

    tx.commit().context("commit reconcile transaction")?;

    let elapsed = start.elapsed();
    tracing::info!(
        %scope,
        nodes_scanned,
        corrections = corrections.len(),
        paths_repaired,
        unknown_nodes = unknown_nodes.len(),
        elapsed_ms = elapsed.as_millis(),
        "reconciliation complete"
    );

    Ok(ReconcileReport {
        scope: scope.clone(),
        nodes_scanned,
        corrections,
        paths_repaired,
        unknown_nodes,
        elapsed,
    })
}

/// Split the feed into tallies for nodes this scope has and ids it does
/// not. Duplicate ids in the feed are a malformed feed, not drift.
fn partition_tallies(
    conn: &Connection,
    scope: &Scope,
    tallies: Vec<MemberTally>,
) -> anyhow::Result<(Vec<MemberTally>, Vec<String>)> {
    let mut stmt = conn
        .prepare("SELECT node_id FROM nodes WHERE tenant = ?1 AND domain = ?2")
        .context("prepare node id query")?;
    let rows = stmt
        .query_map(params![scope.tenant(), scope.domain()], |row| {
            row.get::<_, String>(0)
        })
        .context("execute node id query")?;

    let mut valid = std::collections::HashSet::new();
    for row in rows {
        valid.insert(row.context("read node id")?);
    }

    let mut seen = std::collections::HashSet::new();
    let mut known = Vec::new();
    let mut unknown = Vec::new();
    for tally in tallies {
        if !seen.insert(tally.node_id.clone()) {
            bail!("duplicate tally for node '{}'", tally.node_id);
        }
        if valid.contains(&tally.node_id) {
            known.push(tally);
        } else {
            unknown.push(tally.node_id);
        }
    }
    unknown.sort_unstable();

    Ok((known, unknown))
}

fn load_tally_table(conn: &Connection, tallies: &[MemberTally]) -> anyhow::Result<()> {
    conn.execute_batch(
        "CREATE TEMP TABLE IF NOT EXISTS reconcile_tallies (
            node_id TEXT PRIMARY KEY,
            total INTEGER NOT NULL,
            active INTEGER NOT NULL
         );
         DELETE FROM reconcile_tallies;",
    )
    .context("prepare tally temp table")?;

    let mut stmt = conn
        .prepare("INSERT INTO reconcile_tallies (node_id, total, active) VALUES (?1, ?2, ?3)")
        .context("prepare tally insert")?;
    for tally in tallies {
        stmt.execute(params![tally.node_id, tally.total, tally.active])
            .with_context(|| format!("insert tally for '{}'", tally.node_id))?;
    }
    Ok(())
}

/// Recompute cumulative counters for every node and overwrite mismatches.
///
/// The expected value for a node is the sum of direct tallies over its
/// subtree, i.e. over all rows whose interval its own contains.
fn correct_counters(
    conn: &Connection,
    scope: &Scope,
) -> anyhow::Result<(usize, Vec<CounterCorrection>)> {
    let mut stmt = conn
        .prepare(
            "SELECT n.node_id, n.total_count, n.active_count,
                    COALESCE((
                        SELECT SUM(t.total)
                        FROM reconcile_tallies t
                        JOIN nodes m ON m.node_id = t.node_id
                        WHERE m.tenant = n.tenant AND m.domain = n.domain
                          AND m.lft >= n.lft AND m.rgt <= n.rgt
                    ), 0) AS expected_total,
                    COALESCE((
                        SELECT SUM(t.active)
                        FROM reconcile_tallies t
                        JOIN nodes m ON m.node_id = t.node_id
                        WHERE m.tenant = n.tenant AND m.domain = n.domain
                          AND m.lft >= n.lft AND m.rgt <= n.rgt
                    ), 0) AS expected_active
             FROM nodes n
             WHERE n.tenant = ?1 AND n.domain = ?2
             ORDER BY n.lft ASC",
        )
        .context("prepare counter recompute query")?;

    let rows = stmt
        .query_map(params![scope.tenant(), scope.domain()], |row| {
            Ok(CounterCorrection {
                node_id: row.get(0)?,
                stored_total: row.get(1)?,
                stored_active: row.get(2)?,
                expected_total: row.get(3)?,
                expected_active: row.get(4)?,
            })
        })
        .context("execute counter recompute query")?;

    let mut nodes_scanned = 0usize;
    let mut corrections = Vec::new();
    for row in rows {
        let candidate = row.context("read recomputed counters")?;
        nodes_scanned += 1;
        if candidate.stored_total != candidate.expected_total
            || candidate.stored_active != candidate.expected_active
        {
            corrections.push(candidate);
        }
    }

    for correction in &corrections {
        conn.execute(
            "UPDATE nodes SET total_count = ?2, active_count = ?3 WHERE node_id = ?1",
            params![
                correction.node_id,
                correction.expected_total,
                correction.expected_active,
            ],
        )
        .with_context(|| format!("overwrite counters on '{}'", correction.node_id))?;

        tracing::warn!(
            %scope,
            node_id = correction.node_id,
            stored_total = correction.stored_total,
            stored_active = correction.stored_active,
            expected_total = correction.expected_total,
            expected_active = correction.expected_active,
            "counter drift corrected"
        );
    }

    Ok((nodes_scanned, corrections))
}

/// Rewrite any stored path that disagrees with the adjacency-derived one.
fn repair_paths(conn: &Connection, scope: &Scope) -> anyhow::Result<usize> {
    let derived = path::derive_paths(conn, scope)?;

    let mut stmt = conn
        .prepare("SELECT node_id, path FROM nodes WHERE tenant = ?1 AND domain = ?2")
        .context("prepare stored path query")?;
    let rows = stmt
        .query_map(params![scope.tenant(), scope.domain()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .context("execute stored path query")?;

    let mut repaired = 0usize;
    for row in rows {
        let (node_id, stored) = row.context("read stored path")?;
        let Some(expected) = derived.get(&node_id) else {
            continue;
        };
        if &stored != expected {
            conn.execute(
                "UPDATE nodes SET path = ?2 WHERE node_id = ?1",
                params![node_id, expected],
            )
            .with_context(|| format!("repair path on '{node_id}'"))?;
            tracing::warn!(%scope, node_id, stored, expected, "materialized path repaired");
            repaired += 1;
        }
    }

    Ok(repaired)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
