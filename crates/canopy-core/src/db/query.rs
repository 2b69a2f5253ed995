//! `SQLite` query helpers for the hierarchy store.
//!
//! Provides typed Rust structs and composable query functions for the read
//! paths: node lookup, ancestor and descendant listings via interval
//! containment, O(1) subtree counters, leaderboards, and scope metadata.
//!
//! All functions take a shared `&Connection` reference and return
//! `anyhow::Result<T>` with typed structs (never raw rows).

use crate::model::Window;
use crate::scope::Scope;
use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// A node row from the `nodes` table.
///
/// `lft`/`rgt` are the nested-interval bounds: an ancestor's interval
/// strictly contains every descendant's. `total_count`/`active_count` are
/// cumulative over the whole subtree rooted here, not per-node tallies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRow {
    pub node_id: String,
    pub tenant: String,
    pub domain: String,
    pub unit_type: String,
    pub level: i64,
    pub code: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub lft: i64,
    pub rgt: i64,
    pub depth: i64,
    pub path: String,
    pub total_count: i64,
    pub active_count: i64,
    pub valid_from_us: Option<i64>,
    pub valid_to_us: Option<i64>,
    pub active: bool,
    pub created_at_us: i64,
    pub updated_at_us: i64,
}

impl NodeRow {
    /// Validity window of this node.
    #[must_use]
    pub const fn window(&self) -> Window {
        Window {
            valid_from_us: self.valid_from_us,
            valid_to_us: self.valid_to_us,
        }
    }

    /// Interval width, i.e. `2 * subtree_size`.
    #[must_use]
    pub const fn width(&self) -> i64 {
        self.rgt - self.lft + 1
    }

    /// Whether this node's interval strictly contains `other`'s, which in
    /// the nested-interval encoding means "is an ancestor of".
    #[must_use]
    pub const fn contains(&self, other: &Self) -> bool {
        self.lft < other.lft && self.rgt > other.rgt
    }
}

/// Cumulative membership counters of a subtree, read from its root node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubtreeCount {
    pub total: i64,
    pub active: i64,
}

/// Per-scope integrity state, as recorded in `scope_meta`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityStatus {
    Ok,
    Failed,
}

impl IntegrityStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
        }
    }

    /// Whether mutations that restructure the tree are allowed.
    #[must_use]
    pub const fn allows_structural_writes(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for IntegrityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for unrecognized integrity strings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown integrity status '{got}': expected 'ok' or 'failed'")]
pub struct ParseIntegrityError {
    pub got: String,
}

impl FromStr for IntegrityStatus {
    type Err = ParseIntegrityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "failed" => Ok(Self::Failed),
            other => Err(ParseIntegrityError {
                got: other.to_string(),
            }),
        }
    }
}

/// A `scope_meta` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeMeta {
    pub scope: Scope,
    pub integrity: IntegrityStatus,
    pub delta_propagation: bool,
    pub last_reconcile_at_us: Option<i64>,
    pub corrections_total: i64,
    pub created_at_us: i64,
}

// ---------------------------------------------------------------------------
// Node lookup
// ---------------------------------------------------------------------------

const NODE_COLUMNS: &str = "node_id, tenant, domain, unit_type, level, code, name, \
     parent_id, lft, rgt, depth, path, total_count, active_count, \
     valid_from_us, valid_to_us, active, created_at_us, updated_at_us";

/// Fetch a single node by id within a scope.
///
/// Returns `None` if the node does not exist in that scope.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_node(conn: &Connection, scope: &Scope, node_id: &str) -> Result<Option<NodeRow>> {
    let sql = format!(
        "SELECT {NODE_COLUMNS} FROM nodes \
         WHERE tenant = ?1 AND domain = ?2 AND node_id = ?3"
    );
    let mut stmt = conn.prepare(&sql).context("prepare get_node query")?;

    let result = stmt.query_row(params![scope.tenant(), scope.domain(), node_id], row_to_node);

    match result {
        Ok(node) => Ok(Some(node)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e).context(format!("get_node for '{node_id}'")),
    }
}

/// Fetch a node by id regardless of scope.
///
/// Used to distinguish "unknown id" from "id belongs to another scope".
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_node_any_scope(conn: &Connection, node_id: &str) -> Result<Option<NodeRow>> {
    let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE node_id = ?1");
    let mut stmt = conn
        .prepare(&sql)
        .context("prepare get_node_any_scope query")?;

    let result = stmt.query_row(params![node_id], row_to_node);

    match result {
        Ok(node) => Ok(Some(node)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e).context(format!("get_node_any_scope for '{node_id}'")),
    }
}

/// Fetch the root node of a scope, if the scope has been initialized.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_root(conn: &Connection, scope: &Scope) -> Result<Option<NodeRow>> {
    let sql = format!(
        "SELECT {NODE_COLUMNS} FROM nodes \
         WHERE tenant = ?1 AND domain = ?2 AND parent_id IS NULL"
    );
    let mut stmt = conn.prepare(&sql).context("prepare get_root query")?;

    let result = stmt.query_row(params![scope.tenant(), scope.domain()], row_to_node);

    match result {
        Ok(node) => Ok(Some(node)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e).context(format!("get_root for '{scope}'")),
    }
}

/// List direct children of a node, ordered by code.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn get_children(conn: &Connection, parent_id: &str) -> Result<Vec<NodeRow>> {
    let sql = format!(
        "SELECT {NODE_COLUMNS} FROM nodes \
         WHERE parent_id = ?1 \
         ORDER BY code ASC"
    );
    let mut stmt = conn.prepare(&sql).context("prepare get_children query")?;

    let rows = stmt
        .query_map(params![parent_id], row_to_node)
        .with_context(|| format!("execute get_children for '{parent_id}'"))?;

    let mut children = Vec::new();
    for row in rows {
        children.push(row.context("read child row")?);
    }
    Ok(children)
}

// ---------------------------------------------------------------------------
// Interval-containment walks
// ---------------------------------------------------------------------------

/// List strict ancestors of a node, root first.
///
/// A single range scan: ancestors are exactly the rows whose interval
/// strictly contains the node's.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn ancestors_of(conn: &Connection, node: &NodeRow) -> Result<Vec<NodeRow>> {
    let sql = format!(
        "SELECT {NODE_COLUMNS} FROM nodes \
         WHERE tenant = ?1 AND domain = ?2 AND lft < ?3 AND rgt > ?4 \
         ORDER BY depth ASC"
    );
    let mut stmt = conn.prepare(&sql).context("prepare ancestors_of query")?;

    let rows = stmt
        .query_map(
            params![node.tenant, node.domain, node.lft, node.rgt],
            row_to_node,
        )
        .with_context(|| format!("execute ancestors_of for '{}'", node.node_id))?;

    let mut ancestors = Vec::new();
    for row in rows {
        ancestors.push(row.context("read ancestor row")?);
    }
    Ok(ancestors)
}

/// List strict ancestors by walking `parent_id` pointers, root first.
///
/// Slower than [`ancestors_of`]; exists as an independent second opinion for
/// consistency checks. The visited guard turns a corrupt parent cycle into an
/// error instead of an infinite loop.
///
/// # Errors
///
/// Returns an error if the database query fails or a parent cycle is found.
pub fn ancestors_by_parent_walk(conn: &Connection, node: &NodeRow) -> Result<Vec<NodeRow>> {
    let mut ancestors: Vec<NodeRow> = Vec::new();
    let mut visited: std::collections::HashSet<String> = std::collections::HashSet::new();
    visited.insert(node.node_id.clone());

    let mut current_parent = node.parent_id.clone();
    while let Some(parent_id) = current_parent {
        if !visited.insert(parent_id.clone()) {
            anyhow::bail!("parent cycle detected at '{parent_id}'");
        }
        let Some(parent) = get_node_any_scope(conn, &parent_id)? else {
            anyhow::bail!("dangling parent reference '{parent_id}'");
        };
        current_parent = parent.parent_id.clone();
        ancestors.push(parent);
    }

    ancestors.reverse();
    Ok(ancestors)
}

/// List strict descendants of a node, interval order (i.e. depth-first).
///
/// `max_depth` bounds the walk relative to the node: `Some(1)` returns only
/// direct children, `None` returns the whole subtree.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn descendants_of(
    conn: &Connection,
    node: &NodeRow,
    max_depth: Option<i64>,
) -> Result<Vec<NodeRow>> {
    let sql = match max_depth {
        Some(_) => format!(
            "SELECT {NODE_COLUMNS} FROM nodes \
             WHERE tenant = ?1 AND domain = ?2 AND lft > ?3 AND rgt < ?4 \
               AND depth <= ?5 \
             ORDER BY lft ASC"
        ),
        None => format!(
            "SELECT {NODE_COLUMNS} FROM nodes \
             WHERE tenant = ?1 AND domain = ?2 AND lft > ?3 AND rgt < ?4 \
             ORDER BY lft ASC"
        ),
    };
    let mut stmt = conn.prepare(&sql).context("prepare descendants_of query")?;

    let rows = match max_depth {
        Some(bound) => stmt.query_map(
            params![
                node.tenant,
                node.domain,
                node.lft,
                node.rgt,
                node.depth + bound
            ],
            row_to_node,
        ),
        None => stmt.query_map(
            params![node.tenant, node.domain, node.lft, node.rgt],
            row_to_node,
        ),
    }
    .with_context(|| format!("execute descendants_of for '{}'", node.node_id))?;

    let mut descendants = Vec::new();
    for row in rows {
        descendants.push(row.context("read descendant row")?);
    }
    Ok(descendants)
}

// ---------------------------------------------------------------------------
// Counters and rankings
// ---------------------------------------------------------------------------

/// Read a subtree's cumulative counters straight off its root node.
///
/// Returns `None` if the node does not exist in that scope.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn subtree_count(
    conn: &Connection,
    scope: &Scope,
    node_id: &str,
) -> Result<Option<SubtreeCount>> {
    let result = conn.query_row(
        "SELECT total_count, active_count FROM nodes \
         WHERE tenant = ?1 AND domain = ?2 AND node_id = ?3",
        params![scope.tenant(), scope.domain(), node_id],
        |row| {
            Ok(SubtreeCount {
                total: row.get(0)?,
                active: row.get(1)?,
            })
        },
    );

    match result {
        Ok(count) => Ok(Some(count)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e).context(format!("subtree_count for '{node_id}'")),
    }
}

/// Rank active units at a level by active membership.
///
/// Ties break by `total_count` descending, then `node_id` ascending so the
/// ordering is stable across runs. Deactivated units are excluded; their
/// counters survive but they no longer compete.
///
/// # Errors
///
/// Returns an error if the database query fails.
pub fn leaderboard(
    conn: &Connection,
    scope: &Scope,
    level: i64,
    limit: u32,
) -> Result<Vec<NodeRow>> {
    let sql = format!(
        "SELECT {NODE_COLUMNS} FROM nodes \
         WHERE tenant = ?1 AND domain = ?2 AND level = ?3 AND active = 1 \
         ORDER BY active_count DESC, total_count DESC, node_id ASC \
         LIMIT ?4"
    );
    let mut stmt = conn.prepare(&sql).context("prepare leaderboard query")?;

    let rows = stmt
        .query_map(
            params![scope.tenant(), scope.domain(), level, limit],
            row_to_node,
        )
        .with_context(|| format!("execute leaderboard for '{scope}' level {level}"))?;

    let mut ranked = Vec::new();
    for row in rows {
        ranked.push(row.context("read leaderboard row")?);
    }
    Ok(ranked)
}

// ---------------------------------------------------------------------------
// Scope metadata
// ---------------------------------------------------------------------------

/// Fetch the metadata row for a scope.
///
/// Returns `None` if the scope has not been created.
///
/// # Errors
///
/// Returns an error if the database query fails or stored values are
/// malformed.
pub fn get_scope_meta(conn: &Connection, scope: &Scope) -> Result<Option<ScopeMeta>> {
    let result = conn.query_row(
        "SELECT integrity, delta_propagation, last_reconcile_at_us, \
                corrections_total, created_at_us \
         FROM scope_meta \
         WHERE tenant = ?1 AND domain = ?2",
        params![scope.tenant(), scope.domain()],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)? != 0,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        },
    );

    let (integrity_raw, delta_propagation, last_reconcile_at_us, corrections_total, created_at_us) =
        match result {
            Ok(values) => values,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e).context(format!("get_scope_meta for '{scope}'")),
        };

    let integrity = integrity_raw
        .parse::<IntegrityStatus>()
        .with_context(|| format!("scope_meta integrity for '{scope}'"))?;

    Ok(Some(ScopeMeta {
        scope: scope.clone(),
        integrity,
        delta_propagation,
        last_reconcile_at_us,
        corrections_total,
        created_at_us,
    }))
}

/// List every scope in the store, ordered by tenant then domain.
///
/// # Errors
///
/// Returns an error if the database query fails or stored values are
/// malformed.
pub fn list_scopes(conn: &Connection) -> Result<Vec<ScopeMeta>> {
    let mut stmt = conn
        .prepare(
            "SELECT tenant, domain, integrity, delta_propagation, \
                    last_reconcile_at_us, corrections_total, created_at_us \
             FROM scope_meta \
             ORDER BY tenant ASC, domain ASC",
        )
        .context("prepare list_scopes query")?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)? != 0,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })
        .context("execute list_scopes query")?;

    let mut scopes = Vec::new();
    for row in rows {
        let (
            tenant,
            domain,
            integrity_raw,
            delta_propagation,
            last_reconcile_at_us,
            corrections_total,
            created_at_us,
        ) = row.context("read scope_meta row")?;

        let scope = Scope::new(&tenant, &domain)
            .with_context(|| format!("stored scope '{tenant}/{domain}'"))?;
        let integrity = integrity_raw
            .parse::<IntegrityStatus>()
            .with_context(|| format!("scope_meta integrity for '{scope}'"))?;

        scopes.push(ScopeMeta {
            scope,
            integrity,
            delta_propagation,
            last_reconcile_at_us,
            corrections_total,
            created_at_us,
        });
    }
    Ok(scopes)
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeRow> {
    Ok(NodeRow {
        node_id: row.get(0)?,
        tenant: row.get(1)?,
        domain: row.get(2)?,
        unit_type: row.get(3)?,
        level: row.get(4)?,
        code: row.get(5)?,
        name: row.get(6)?,
        parent_id: row.get(7)?,
        lft: row.get(8)?,
        rgt: row.get(9)?,
        depth: row.get(10)?,
        path: row.get(11)?,
        total_count: row.get(12)?,
        active_count: row.get(13)?,
        valid_from_us: row.get(14)?,
        valid_to_us: row.get(15)?,
        active: row.get::<_, i64>(16)? != 0,
        created_at_us: row.get(17)?,
        updated_at_us: row.get(18)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations;
    use rusqlite::Connection;

    fn test_db() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open in-memory db");
        migrations::migrate(&mut conn).expect("migrate");
        conn
    }

    fn test_scope() -> Scope {
        Scope::new("acme", "np").expect("valid scope")
    }

    /// Insert a node row with explicit interval bounds.
    #[allow(clippy::too_many_arguments)]
    fn insert_node(
        conn: &Connection,
        id: &str,
        parent: Option<&str>,
        unit_type: &str,
        level: i64,
        code: &str,
        lft: i64,
        rgt: i64,
        depth: i64,
        path: &str,
    ) {
        conn.execute(
            "INSERT INTO nodes (
                node_id, tenant, domain, unit_type, level, code, name,
                parent_id, lft, rgt, depth, path,
                total_count, active_count, active, created_at_us, updated_at_us
             ) VALUES (?1, 'acme', 'np', ?2, ?3, ?4, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0, 1, 1, 1)",
            params![id, unit_type, level, code, parent, lft, rgt, depth, path],
        )
        .expect("insert node");
    }

    fn set_counters(conn: &Connection, id: &str, total: i64, active: i64) {
        conn.execute(
            "UPDATE nodes SET total_count = ?2, active_count = ?3 WHERE node_id = ?1",
            params![id, total, active],
        )
        .expect("set counters");
    }

    /// Six-node tree: hq -> (p1 -> (w1, w2), p2 -> w3).
    fn seed_tree(conn: &Connection) {
        insert_node(conn, "cn-hq", None, "hq", 0, "HQ", 1, 12, 0, "cn-hq");
        insert_node(conn, "cn-p1", Some("cn-hq"), "province", 1, "P1", 2, 7, 1, "cn-hq/cn-p1");
        insert_node(conn, "cn-w1", Some("cn-p1"), "ward", 2, "W1", 3, 4, 2, "cn-hq/cn-p1/cn-w1");
        insert_node(conn, "cn-w2", Some("cn-p1"), "ward", 2, "W2", 5, 6, 2, "cn-hq/cn-p1/cn-w2");
        insert_node(conn, "cn-p2", Some("cn-hq"), "province", 1, "P2", 8, 11, 1, "cn-hq/cn-p2");
        insert_node(conn, "cn-w3", Some("cn-p2"), "ward", 2, "W3", 9, 10, 2, "cn-hq/cn-p2/cn-w3");
    }

    fn insert_scope_meta(conn: &Connection, tenant: &str, domain: &str) {
        conn.execute(
            "INSERT INTO scope_meta (tenant, domain, created_at_us) VALUES (?1, ?2, 42)",
            params![tenant, domain],
        )
        .expect("insert scope_meta");
    }

    // -----------------------------------------------------------------------
    // Node lookup
    // -----------------------------------------------------------------------

    #[test]
    fn get_node_is_scoped() {
        let conn = test_db();
        seed_tree(&conn);
        let scope = test_scope();
        let other = Scope::new("acme", "internal").expect("valid scope");

        let hit = get_node(&conn, &scope, "cn-p1").expect("query");
        assert_eq!(hit.map(|n| n.code), Some("P1".to_string()));

        let miss = get_node(&conn, &other, "cn-p1").expect("query");
        assert!(miss.is_none());

        let any = get_node_any_scope(&conn, "cn-p1").expect("query");
        assert_eq!(any.map(|n| n.tenant), Some("acme".to_string()));
    }

    #[test]
    fn get_root_finds_the_parentless_node() {
        let conn = test_db();
        seed_tree(&conn);

        let root = get_root(&conn, &test_scope())
            .expect("query")
            .expect("root exists");
        assert_eq!(root.node_id, "cn-hq");
        assert_eq!(root.depth, 0);
        assert_eq!(root.width(), 12);
    }

    #[test]
    fn children_are_ordered_by_code() {
        let conn = test_db();
        seed_tree(&conn);

        let children = get_children(&conn, "cn-hq").expect("query");
        let codes: Vec<&str> = children.iter().map(|n| n.code.as_str()).collect();
        assert_eq!(codes, vec!["P1", "P2"]);
    }

    // -----------------------------------------------------------------------
    // Interval-containment walks
    // -----------------------------------------------------------------------

    #[test]
    fn ancestors_come_root_first_and_exclude_self() {
        let conn = test_db();
        seed_tree(&conn);
        let scope = test_scope();

        let w2 = get_node(&conn, &scope, "cn-w2")
            .expect("query")
            .expect("w2 exists");
        let ancestors = ancestors_of(&conn, &w2).expect("query");
        let ids: Vec<&str> = ancestors.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["cn-hq", "cn-p1"]);
    }

    #[test]
    fn ancestor_walks_agree() {
        let conn = test_db();
        seed_tree(&conn);
        let scope = test_scope();

        for id in ["cn-hq", "cn-p1", "cn-w1", "cn-w2", "cn-p2", "cn-w3"] {
            let node = get_node(&conn, &scope, id)
                .expect("query")
                .expect("node exists");
            let by_range = ancestors_of(&conn, &node).expect("range walk");
            let by_parent = ancestors_by_parent_walk(&conn, &node).expect("parent walk");
            assert_eq!(by_range, by_parent, "walks disagree for {id}");
        }
    }

    #[test]
    fn descendants_respect_depth_bound() {
        let conn = test_db();
        seed_tree(&conn);
        let scope = test_scope();

        let hq = get_node(&conn, &scope, "cn-hq")
            .expect("query")
            .expect("hq exists");

        let all = descendants_of(&conn, &hq, None).expect("query");
        let ids: Vec<&str> = all.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["cn-p1", "cn-w1", "cn-w2", "cn-p2", "cn-w3"]);

        let direct = descendants_of(&conn, &hq, Some(1)).expect("query");
        let ids: Vec<&str> = direct.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["cn-p1", "cn-p2"]);
    }

    #[test]
    fn containment_matches_ancestry() {
        let conn = test_db();
        seed_tree(&conn);
        let scope = test_scope();

        let hq = get_node(&conn, &scope, "cn-hq").expect("q").expect("hq");
        let p1 = get_node(&conn, &scope, "cn-p1").expect("q").expect("p1");
        let p2 = get_node(&conn, &scope, "cn-p2").expect("q").expect("p2");
        let w1 = get_node(&conn, &scope, "cn-w1").expect("q").expect("w1");

        assert!(hq.contains(&w1));
        assert!(p1.contains(&w1));
        assert!(!p2.contains(&w1));
        assert!(!w1.contains(&p1));
        assert!(!p1.contains(&p1), "containment is strict");
    }

    // -----------------------------------------------------------------------
    // Counters and rankings
    // -----------------------------------------------------------------------

    #[test]
    fn subtree_count_reads_node_counters() {
        let conn = test_db();
        seed_tree(&conn);
        set_counters(&conn, "cn-p1", 120, 80);

        let count = subtree_count(&conn, &test_scope(), "cn-p1")
            .expect("query")
            .expect("node exists");
        assert_eq!(count, SubtreeCount { total: 120, active: 80 });

        let missing = subtree_count(&conn, &test_scope(), "cn-ghost").expect("query");
        assert!(missing.is_none());
    }

    #[test]
    fn leaderboard_ranks_and_breaks_ties_deterministically() {
        let conn = test_db();
        seed_tree(&conn);
        set_counters(&conn, "cn-w1", 50, 30);
        set_counters(&conn, "cn-w2", 40, 30);
        set_counters(&conn, "cn-w3", 10, 9);

        let ranked = leaderboard(&conn, &test_scope(), 2, 10).expect("query");
        let ids: Vec<&str> = ranked.iter().map(|n| n.node_id.as_str()).collect();
        // w1 and w2 tie on active; total breaks it.
        assert_eq!(ids, vec!["cn-w1", "cn-w2", "cn-w3"]);

        let top_one = leaderboard(&conn, &test_scope(), 2, 1).expect("query");
        assert_eq!(top_one.len(), 1);
        assert_eq!(top_one[0].node_id, "cn-w1");
    }

    #[test]
    fn leaderboard_skips_deactivated_units() {
        let conn = test_db();
        seed_tree(&conn);
        set_counters(&conn, "cn-w1", 50, 30);
        conn.execute("UPDATE nodes SET active = 0 WHERE node_id = 'cn-w1'", [])
            .expect("deactivate");

        let ranked = leaderboard(&conn, &test_scope(), 2, 10).expect("query");
        assert!(ranked.iter().all(|n| n.node_id != "cn-w1"));
    }

    // -----------------------------------------------------------------------
    // Scope metadata
    // -----------------------------------------------------------------------

    #[test]
    fn scope_meta_roundtrip() {
        let conn = test_db();
        insert_scope_meta(&conn, "acme", "np");

        let meta = get_scope_meta(&conn, &test_scope())
            .expect("query")
            .expect("meta exists");
        assert_eq!(meta.integrity, IntegrityStatus::Ok);
        assert!(meta.delta_propagation);
        assert_eq!(meta.last_reconcile_at_us, None);
        assert_eq!(meta.corrections_total, 0);

        let missing = get_scope_meta(&conn, &Scope::new("acme", "internal").expect("scope"))
            .expect("query");
        assert!(missing.is_none());
    }

    #[test]
    fn list_scopes_is_ordered() {
        let conn = test_db();
        insert_scope_meta(&conn, "zeta", "np");
        insert_scope_meta(&conn, "acme", "np");
        insert_scope_meta(&conn, "acme", "internal");

        let scopes = list_scopes(&conn).expect("query");
        let names: Vec<String> = scopes.iter().map(|m| m.scope.to_string()).collect();
        assert_eq!(names, vec!["acme/internal", "acme/np", "zeta/np"]);
    }

    #[test]
    fn integrity_status_parses_both_values() {
        assert_eq!("ok".parse::<IntegrityStatus>(), Ok(IntegrityStatus::Ok));
        assert_eq!(
            "failed".parse::<IntegrityStatus>(),
            Ok(IntegrityStatus::Failed)
        );
        assert!("degraded".parse::<IntegrityStatus>().is_err());
        assert!(IntegrityStatus::Ok.allows_structural_writes());
        assert!(!IntegrityStatus::Failed.allows_structural_writes());
    }
}
