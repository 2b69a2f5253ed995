//! Canonical SQLite schema for the hierarchy store.
//!
//! One database holds every scope's tree:
//! - `nodes` carries the nested-interval encoding (`lft`/`rgt`), the
//!   materialized path, and the cumulative membership counters
//! - `scope_meta` tracks per-scope integrity state and the bulk-import
//!   delta-propagation switch
//! - `level_rules` is the per-scope placement configuration consumed by the
//!   validator
//! - `engine_meta` tracks the schema version for migrations
//!
//! Interval bounds go negative transiently while a move detaches a subtree;
//! the `lft < rgt` check still holds because the detach step swaps the
//! negated bounds.

/// Migration v1: core tables plus engine metadata.
pub const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    node_id TEXT PRIMARY KEY,
    tenant TEXT NOT NULL,
    domain TEXT NOT NULL,
    unit_type TEXT NOT NULL CHECK (length(trim(unit_type)) > 0),
    level INTEGER NOT NULL CHECK (level >= 0),
    code TEXT NOT NULL CHECK (length(trim(code)) > 0),
    name TEXT NOT NULL,
    parent_id TEXT REFERENCES nodes(node_id),
    lft INTEGER NOT NULL,
    rgt INTEGER NOT NULL,
    depth INTEGER NOT NULL CHECK (depth >= 0),
    path TEXT NOT NULL,
    total_count INTEGER NOT NULL DEFAULT 0 CHECK (total_count >= 0),
    active_count INTEGER NOT NULL DEFAULT 0 CHECK (active_count >= 0),
    valid_from_us INTEGER,
    valid_to_us INTEGER,
    active INTEGER NOT NULL DEFAULT 1 CHECK (active IN (0, 1)),
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    CHECK (node_id LIKE 'cn-%'),
    CHECK (lft < rgt)
);

CREATE TABLE IF NOT EXISTS scope_meta (
    tenant TEXT NOT NULL,
    domain TEXT NOT NULL,
    integrity TEXT NOT NULL DEFAULT 'ok' CHECK (integrity IN ('ok', 'failed')),
    delta_propagation INTEGER NOT NULL DEFAULT 1 CHECK (delta_propagation IN (0, 1)),
    last_reconcile_at_us INTEGER,
    corrections_total INTEGER NOT NULL DEFAULT 0 CHECK (corrections_total >= 0),
    created_at_us INTEGER NOT NULL,
    PRIMARY KEY (tenant, domain)
);

CREATE TABLE IF NOT EXISTS level_rules (
    tenant TEXT NOT NULL,
    domain TEXT NOT NULL,
    unit_type TEXT NOT NULL CHECK (length(trim(unit_type)) > 0),
    level INTEGER NOT NULL CHECK (level >= 0),
    parent_type TEXT CHECK (parent_type IS NULL OR length(trim(parent_type)) > 0),
    min_children INTEGER NOT NULL DEFAULT 0 CHECK (min_children >= 0),
    max_children INTEGER CHECK (max_children IS NULL OR max_children >= 1),
    PRIMARY KEY (tenant, domain, unit_type)
);

CREATE TABLE IF NOT EXISTS engine_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    created_at_us INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO engine_meta (id, schema_version, created_at_us)
VALUES (1, 1, 0);
"#;

/// Migration v2: read-path and uniqueness indexes.
pub const MIGRATION_V2_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_nodes_scope_lft
    ON nodes(tenant, domain, lft);

CREATE INDEX IF NOT EXISTS idx_nodes_scope_rgt
    ON nodes(tenant, domain, rgt);

CREATE INDEX IF NOT EXISTS idx_nodes_parent
    ON nodes(parent_id);

CREATE INDEX IF NOT EXISTS idx_nodes_leaderboard
    ON nodes(tenant, domain, level, active_count DESC, total_count DESC, node_id);

CREATE INDEX IF NOT EXISTS idx_nodes_scope_path
    ON nodes(tenant, domain, path);

CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_scope_root
    ON nodes(tenant, domain) WHERE parent_id IS NULL;

CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_sibling_code
    ON nodes(tenant, domain, parent_id, code) WHERE parent_id IS NOT NULL;
"#;

/// Indexes expected by the containment, tree-walk, and leaderboard paths.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_nodes_scope_lft",
    "idx_nodes_scope_rgt",
    "idx_nodes_parent",
    "idx_nodes_leaderboard",
    "idx_nodes_scope_path",
    "idx_nodes_scope_root",
    "idx_nodes_sibling_code",
];
