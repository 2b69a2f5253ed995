//! Materialized-path upkeep.
//!
//! Every node stores its full ancestor chain as a `/`-joined string of node
//! ids, root first. Node ids are `cn-` plus hex, so a path never contains
//! the SQL `LIKE` wildcards `%` or `_` and prefix rewrites can use `LIKE`
//! directly.
//!
//! Paths are denormalized from `parent_id`; [`derive_paths`] recomputes
//! them from the adjacency alone so reconciliation and verification can
//! cross-check the stored copies.

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, params};
use std::collections::HashMap;

use crate::scope::Scope;

/// Path separator between node ids.
pub const PATH_SEPARATOR: char = '/';

/// Rewrite the stored paths of a subtree after a move.
///
/// Replaces `old_prefix` with `new_prefix` on the subtree root and every
/// descendant. The component boundary in the `LIKE` pattern keeps ids that
/// merely share a string prefix untouched.
///
/// Returns the number of rewritten rows.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn rewrite_subtree_paths(
    conn: &Connection,
    scope: &Scope,
    old_prefix: &str,
    new_prefix: &str,
) -> Result<usize> {
    let old_len = i64::try_from(old_prefix.len()).context("path length out of range")?;

    let rewritten = conn
        .execute(
            "UPDATE nodes \
             SET path = ?4 || substr(path, ?5) \
             WHERE tenant = ?1 AND domain = ?2 \
               AND (path = ?3 OR path LIKE ?3 || '/%')",
            params![
                scope.tenant(),
                scope.domain(),
                old_prefix,
                new_prefix,
                old_len + 1,
            ],
        )
        .with_context(|| format!("rewrite paths under '{old_prefix}'"))?;

    Ok(rewritten)
}

/// Recompute every node's path in a scope from `parent_id` adjacency.
///
/// Walks breadth-first from the root. A node that cannot be reached from
/// the root (orphaned or caught in a corrupt parent cycle) is an error:
/// its true path does not exist.
///
/// # Errors
///
/// Returns an error if the query fails, the scope has no root, or some
/// node is unreachable from the root.
pub fn derive_paths(conn: &Connection, scope: &Scope) -> Result<HashMap<String, String>> {
    let mut stmt = conn
        .prepare(
            "SELECT node_id, parent_id FROM nodes \
             WHERE tenant = ?1 AND domain = ?2",
        )
        .context("prepare adjacency query")?;

    let rows = stmt
        .query_map(params![scope.tenant(), scope.domain()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })
        .with_context(|| format!("load adjacency for '{scope}'"))?;

    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    let mut root: Option<String> = None;
    let mut node_count = 0usize;

    for row in rows {
        let (node_id, parent_id) = row.context("read adjacency row")?;
        node_count += 1;
        match parent_id {
            None => root = Some(node_id),
            Some(parent) => children.entry(parent).or_default().push(node_id),
        }
    }

    let Some(root) = root else {
        if node_count == 0 {
            return Ok(HashMap::new());
        }
        bail!("scope '{scope}' has nodes but no root");
    };

    let mut paths: HashMap<String, String> = HashMap::with_capacity(node_count);
    let mut queue = std::collections::VecDeque::new();
    queue.push_back((root.clone(), root));

    while let Some((current, base)) = queue.pop_front() {
        if let Some(kids) = children.get(&current) {
            for kid in kids {
                queue.push_back((kid.clone(), format!("{base}{PATH_SEPARATOR}{kid}")));
            }
        }
        paths.insert(current, base);
    }

    if paths.len() != node_count {
        bail!(
            "scope '{scope}' has {} nodes unreachable from the root",
            node_count - paths.len()
        );
    }

    Ok(paths)
}
