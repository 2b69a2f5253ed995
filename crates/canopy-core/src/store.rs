//! Engine facade: the primary entry point for callers.
//!
//! [`Engine`] ties together the SQLite store, per-scope advisory locks,
//! placement validation, interval maintenance, counter propagation, and
//! reconciliation behind one struct. Callers are arbitrarily many
//! concurrent processes sharing a data directory:
//!
//! - structural mutations (provisioning, create, deactivate, reparent)
//!   take the scope's exclusive lock,
//! - counter mutations, reconciliation, and verification take the shared
//!   lock and run concurrently with each other,
//! - reads take no lock at all and see whatever the last commit left.
//!
//! Every mutation is a single SQLite transaction: a failure or lock
//! timeout leaves the store exactly as it was.

use std::path::{Path, PathBuf};

use anyhow::Context;
use rusqlite::{Connection, TransactionBehavior, params};

use crate::config::{self, EngineConfig};
use crate::db::{
    self,
    query::{self, NodeRow, ScopeMeta, SubtreeCount},
};
use crate::error::EngineError;
use crate::lock::{ScopeReadLock, ScopeWriteLock};
use crate::model::{MembershipTransition, NodeSpec, RootSpec, generate_node_id, now_us};
use crate::reconcile::{self, MembershipSource, ReconcileReport};
use crate::scope::Scope;
use crate::stats::{self, DeltaOutcome};
use crate::tree::{
    path, range,
    validate::{self, LevelRule},
};
use crate::verify::{self, VerifyReport};

/// File name of the SQLite store inside the data directory.
pub const DB_FILE: &str = "canopy.db";

/// Directory of per-scope lock files inside the data directory.
pub const LOCKS_DIR: &str = "locks";

/// The aggregation engine over one data directory.
///
/// Cheap to clone; each operation opens its own connection, so one engine
/// value can be shared freely across threads.
#[derive(Debug, Clone)]
pub struct Engine {
    data_dir: PathBuf,
    config: EngineConfig,
}

impl Engine {
    /// Open (and if necessary initialize) the engine at `data_dir`.
    ///
    /// Loads `canopy.toml` from the data directory when present and runs
    /// any pending schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] if the directory, config, or
    /// database cannot be set up.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let data_dir = data_dir.into();
        let config = config::load_engine_config(&data_dir)?;
        Self::with_config(data_dir, config)
    }

    /// Open the engine with an explicit config, ignoring `canopy.toml`.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::open`].
    pub fn with_config(
        data_dir: impl Into<PathBuf>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let engine = Self {
            data_dir: data_dir.into(),
            config,
        };
        // Opening runs migrations, so later connections are read-ready.
        drop(engine.connect()?);
        tracing::debug!(data_dir = %engine.data_dir.display(), "engine opened");
        Ok(engine)
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    #[must_use]
    pub fn locks_dir(&self) -> PathBuf {
        self.data_dir.join(LOCKS_DIR)
    }

    fn connect(&self) -> Result<Connection, EngineError> {
        Ok(db::open_store_with_timeout(
            &self.db_path(),
            self.config.storage.busy_timeout(),
        )?)
    }

    fn exclusive(&self, scope: &Scope) -> Result<ScopeWriteLock, EngineError> {
        Ok(ScopeWriteLock::acquire(
            &self.locks_dir(),
            scope,
            self.config.locking.acquire_timeout(),
        )?)
    }

    fn shared(&self, scope: &Scope) -> Result<ScopeReadLock, EngineError> {
        Ok(ScopeReadLock::acquire(
            &self.locks_dir(),
            scope,
            self.config.locking.acquire_timeout(),
        )?)
    }

    fn require_scope(conn: &Connection, scope: &Scope) -> Result<ScopeMeta, EngineError> {
        query::get_scope_meta(conn, scope)?.ok_or_else(|| EngineError::ScopeNotFound(scope.clone()))
    }

    /// Structural writes are refused while the scope is integrity-failed.
    fn require_writable(meta: &ScopeMeta, scope: &Scope) -> Result<(), EngineError> {
        if meta.integrity.allows_structural_writes() {
            Ok(())
        } else {
            Err(EngineError::IntegrityFailed(scope.clone()))
        }
    }

    fn fetch_node(conn: &Connection, scope: &Scope, node_id: &str) -> Result<NodeRow, EngineError> {
        query::get_node(conn, scope, node_id)?.ok_or_else(|| EngineError::NodeNotFound {
            scope: scope.clone(),
            node_id: node_id.to_string(),
        })
    }

    // -----------------------------------------------------------------------
    // Structural mutations (exclusive scope lock)
    // -----------------------------------------------------------------------

    /// Provision a scope: store its level rules and create the root node.
    ///
    /// The root's unit type and level come from the one rule without a
    /// parent type.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ScopeExists`] for an already-provisioned
    /// scope, [`EngineError::InvalidRules`] for an inconsistent rule set,
    /// [`EngineError::Conflict`] on lock timeout.
    pub fn create_scope(
        &self,
        scope: &Scope,
        rules: &[LevelRule],
        root: &RootSpec,
    ) -> Result<NodeRow, EngineError> {
        let _guard = self.exclusive(scope)?;
        let mut conn = self.connect()?;

        if query::get_scope_meta(&conn, scope)?.is_some() {
            return Err(EngineError::ScopeExists(scope.clone()));
        }
        let root_rule =
            validate::check_rules(rules).map_err(|reason| EngineError::InvalidRules { reason })?;

        let now = now_us();
        let node_id = generate_node_id();

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin scope provisioning")?;
        tx.execute(
            "INSERT INTO scope_meta (tenant, domain, created_at_us) VALUES (?1, ?2, ?3)",
            params![scope.tenant(), scope.domain(), now],
        )
        .with_context(|| format!("insert scope_meta for '{scope}'"))?;
        validate::save_rules(&tx, scope, rules)?;
        range::insert_root(
            &tx,
            scope,
            &node_id,
            &root_rule.unit_type,
            root_rule.level,
            root,
            now,
        )?;
        let node = Self::fetch_node(&tx, scope, &node_id)?;
        tx.commit().context("commit scope provisioning")?;

        tracing::info!(%scope, root_id = node.node_id, rules = rules.len(), "scope provisioned");
        Ok(node)
    }

    /// Create a node under an existing parent, as its rightmost child.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Placement`] when the validator rejects the
    /// placement, [`EngineError::IntegrityFailed`] for a poisoned scope,
    /// [`EngineError::Conflict`] on lock timeout.
    pub fn create_node(&self, scope: &Scope, spec: &NodeSpec) -> Result<NodeRow, EngineError> {
        let _guard = self.exclusive(scope)?;
        let mut conn = self.connect()?;
        let meta = Self::require_scope(&conn, scope)?;
        Self::require_writable(&meta, scope)?;

        let now = now_us();
        let node_id = generate_node_id();

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin node creation")?;
        let placement = validate::validate_create(&tx, scope, spec)?;
        range::insert_child(
            &tx,
            scope,
            &placement.parent,
            &node_id,
            placement.level,
            spec,
            now,
        )?;
        let node = Self::fetch_node(&tx, scope, &node_id)?;
        tx.commit().context("commit node creation")?;

        tracing::info!(
            %scope,
            node_id = node.node_id,
            parent_id = spec.parent_id,
            unit_type = spec.unit_type,
            "node created"
        );
        Ok(node)
    }

    /// Deactivate a node: close its validity window and drop it from
    /// placement and leaderboards. The row, its interval, and its counters
    /// all stay; there is no physical deletion.
    ///
    /// Deactivating an already-inactive node is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NodeNotFound`] for a missing node,
    /// [`EngineError::IntegrityFailed`] for a poisoned scope,
    /// [`EngineError::Conflict`] on lock timeout.
    pub fn deactivate_node(&self, scope: &Scope, node_id: &str) -> Result<NodeRow, EngineError> {
        let _guard = self.exclusive(scope)?;
        let mut conn = self.connect()?;
        let meta = Self::require_scope(&conn, scope)?;
        Self::require_writable(&meta, scope)?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin deactivation")?;
        let node = Self::fetch_node(&tx, scope, node_id)?;
        if !node.active {
            tracing::debug!(%scope, node_id, "node already inactive");
            return Ok(node);
        }

        let active_children: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM nodes WHERE parent_id = ?1 AND active = 1",
                params![node_id],
                |row| row.get(0),
            )
            .context("count active children")?;
        if active_children > 0 {
            tracing::warn!(%scope, node_id, active_children, "deactivating node with active children");
        }

        let now = now_us();
        // Clamp the window: never extend a validity that already ended.
        tx.execute(
            "UPDATE nodes SET active = 0, updated_at_us = ?2,
                valid_to_us = CASE
                    WHEN valid_to_us IS NULL OR valid_to_us > ?2 THEN ?2
                    ELSE valid_to_us
                END
             WHERE node_id = ?1",
            params![node_id, now],
        )
        .with_context(|| format!("deactivate '{node_id}'"))?;
        let node = Self::fetch_node(&tx, scope, node_id)?;
        tx.commit().context("commit deactivation")?;

        tracing::info!(%scope, node_id, "node deactivated");
        Ok(node)
    }

    /// Move a subtree under a new parent, keeping its internal shape.
    ///
    /// Re-homes the subtree's intervals and depths, repoints the parent,
    /// rewrites every moved path, and shifts the subtree's cumulative
    /// counters from the old ancestor chain onto the new one. Counters
    /// reported before the move are not rewritten.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Placement`] when the validator rejects the
    /// destination (including a destination inside the moved subtree),
    /// [`EngineError::IntegrityFailed`] for a poisoned scope,
    /// [`EngineError::Conflict`] on lock timeout.
    pub fn reparent_node(
        &self,
        scope: &Scope,
        node_id: &str,
        new_parent_id: &str,
    ) -> Result<NodeRow, EngineError> {
        let _guard = self.exclusive(scope)?;
        let mut conn = self.connect()?;
        let meta = Self::require_scope(&conn, scope)?;
        Self::require_writable(&meta, scope)?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin reparent")?;
        let node = Self::fetch_node(&tx, scope, node_id)?;
        validate::validate_reparent(&tx, scope, &node, new_parent_id)?;

        let now = now_us();
        range::move_subtree(&tx, scope, node_id, new_parent_id, now)?;

        // The destination's own path is stable: the cycle check guarantees
        // it is outside the moved subtree.
        let new_parent = Self::fetch_node(&tx, scope, new_parent_id)?;
        let new_prefix = format!("{}{}{}", new_parent.path, path::PATH_SEPARATOR, node_id);
        let rewritten = path::rewrite_subtree_paths(&tx, scope, &node.path, &new_prefix)?;

        let moved = Self::fetch_node(&tx, scope, node_id)?;
        tx.commit().context("commit reparent")?;

        tracing::info!(
            %scope,
            node_id,
            from_parent = node.parent_id.as_deref().unwrap_or("-"),
            to_parent = new_parent_id,
            paths_rewritten = rewritten,
            "subtree moved"
        );
        Ok(moved)
    }

    /// Toggle per-delta counter propagation for a scope.
    ///
    /// Bulk imports switch propagation off, load nodes, then switch it back
    /// on and run [`Engine::reconcile`] once to install correct counters.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ScopeNotFound`] for an unknown scope,
    /// [`EngineError::Conflict`] on lock timeout.
    pub fn set_delta_propagation(&self, scope: &Scope, enabled: bool) -> Result<(), EngineError> {
        let _guard = self.exclusive(scope)?;
        let conn = self.connect()?;
        Self::require_scope(&conn, scope)?;

        conn.execute(
            "UPDATE scope_meta SET delta_propagation = ?3 WHERE tenant = ?1 AND domain = ?2",
            params![scope.tenant(), scope.domain(), i64::from(enabled)],
        )
        .context("toggle delta propagation")?;
        tracing::info!(%scope, enabled, "delta propagation toggled");
        Ok(())
    }

    /// Re-verify a repaired scope and clear its integrity-failed flag.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IntegrityFailed`] while fatal findings
    /// remain, [`EngineError::Conflict`] on lock timeout.
    pub fn clear_integrity_failure(&self, scope: &Scope) -> Result<VerifyReport, EngineError> {
        let _guard = self.exclusive(scope)?;
        let mut conn = self.connect()?;
        Self::require_scope(&conn, scope)?;
        verify::clear_integrity_failure(&mut conn, scope)
    }

    // -----------------------------------------------------------------------
    // Counter mutations (shared scope lock)
    // -----------------------------------------------------------------------

    /// Apply a membership delta at a node, propagating up its ancestor
    /// chain in one bulk interval-containment update.
    ///
    /// When the scope has delta propagation switched off the delta is
    /// suppressed and left for the closing reconciliation pass.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::CounterUnderflow`] when the node's counters
    /// would go negative, [`EngineError::Conflict`] on lock timeout.
    pub fn apply_membership_delta(
        &self,
        scope: &Scope,
        node_id: &str,
        total_delta: i64,
        active_delta: i64,
    ) -> Result<DeltaOutcome, EngineError> {
        let _guard = self.shared(scope)?;
        let conn = self.connect()?;
        let meta = Self::require_scope(&conn, scope)?;
        if !meta.delta_propagation {
            tracing::debug!(%scope, node_id, "delta suppressed: propagation off");
            return Ok(DeltaOutcome::Suppressed);
        }

        let node = Self::fetch_node(&conn, scope, node_id)?;
        let rows_touched = stats::apply_delta(&conn, scope, &node, total_delta, active_delta)?;
        Ok(DeltaOutcome::Applied { rows_touched })
    }

    /// Apply a member state-transition event at the node it names.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::apply_membership_delta`].
    pub fn apply_transition(
        &self,
        scope: &Scope,
        transition: &MembershipTransition,
    ) -> Result<DeltaOutcome, EngineError> {
        let _guard = self.shared(scope)?;
        let conn = self.connect()?;
        let meta = Self::require_scope(&conn, scope)?;
        if !meta.delta_propagation {
            tracing::debug!(
                %scope,
                node_id = transition.node_id,
                member_id = transition.member_id,
                "transition suppressed: propagation off"
            );
            return Ok(DeltaOutcome::Suppressed);
        }

        let node = Self::fetch_node(&conn, scope, &transition.node_id)?;
        let rows_touched = stats::apply_transition(&conn, scope, &node, transition)?;
        Ok(DeltaOutcome::Applied { rows_touched })
    }

    /// Transfer one member between two nodes in the same scope,
    /// atomically. Ancestors shared by both chains see no net change.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::CounterUnderflow`] when the source has no
    /// member to give up, [`EngineError::Conflict`] on lock timeout.
    pub fn transfer_member(
        &self,
        scope: &Scope,
        from_id: &str,
        to_id: &str,
        active: bool,
    ) -> Result<DeltaOutcome, EngineError> {
        let _guard = self.shared(scope)?;
        let mut conn = self.connect()?;
        let meta = Self::require_scope(&conn, scope)?;
        if !meta.delta_propagation {
            tracing::debug!(%scope, from_id, to_id, "transfer suppressed: propagation off");
            return Ok(DeltaOutcome::Suppressed);
        }

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin transfer")?;
        let from = Self::fetch_node(&tx, scope, from_id)?;
        let to = Self::fetch_node(&tx, scope, to_id)?;
        let rows_touched = stats::transfer_member(&tx, scope, &from, &to, active)?;
        tx.commit().context("commit transfer")?;

        Ok(DeltaOutcome::Applied { rows_touched })
    }

    /// Reconcile a scope's counters and paths against an authoritative
    /// tally feed. Safe to run alongside live counter traffic.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ScopeNotFound`] for an unknown scope,
    /// [`EngineError::Conflict`] on lock timeout, [`EngineError::Storage`]
    /// when the feed or a statement fails.
    pub fn reconcile(
        &self,
        scope: &Scope,
        source: &dyn MembershipSource,
    ) -> Result<ReconcileReport, EngineError> {
        let _guard = self.shared(scope)?;
        let mut conn = self.connect()?;
        Self::require_scope(&conn, scope)?;
        reconcile::reconcile_scope(&mut conn, scope, source)
    }

    /// Scan a scope for structural problems; a fatal finding flips the
    /// scope to integrity-failed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ScopeNotFound`] for an unknown scope,
    /// [`EngineError::Conflict`] on lock timeout.
    pub fn verify_scope(&self, scope: &Scope) -> Result<VerifyReport, EngineError> {
        let _guard = self.shared(scope)?;
        let mut conn = self.connect()?;
        Self::require_scope(&conn, scope)?;
        verify::verify_scope(&mut conn, scope)
    }

    // -----------------------------------------------------------------------
    // Reads (no lock)
    // -----------------------------------------------------------------------

    /// Check whether a child type may be placed under a parent type in
    /// this scope, without touching any node.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Placement`] with the refusing rule's reason,
    /// or [`EngineError::ScopeNotFound`] for an unknown scope.
    pub fn validate_placement(
        &self,
        scope: &Scope,
        parent_type: &str,
        child_type: &str,
    ) -> Result<(), EngineError> {
        let conn = self.connect()?;
        Self::require_scope(&conn, scope)?;
        let rules = validate::load_rules(&conn, scope)?;
        validate::check_type_permitted(&rules, parent_type, child_type)?;
        Ok(())
    }

    /// Fetch one node.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NodeNotFound`] if it does not exist.
    pub fn get_node(&self, scope: &Scope, node_id: &str) -> Result<NodeRow, EngineError> {
        let conn = self.connect()?;
        Self::require_scope(&conn, scope)?;
        Self::fetch_node(&conn, scope, node_id)
    }

    /// Fetch a scope's root node.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ScopeNotFound`] for an unknown scope.
    pub fn get_root(&self, scope: &Scope) -> Result<Option<NodeRow>, EngineError> {
        let conn = self.connect()?;
        Self::require_scope(&conn, scope)?;
        Ok(query::get_root(&conn, scope)?)
    }

    /// Ancestors of a node, root first, excluding the node itself.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NodeNotFound`] for a missing node.
    pub fn get_ancestors(&self, scope: &Scope, node_id: &str) -> Result<Vec<NodeRow>, EngineError> {
        let conn = self.connect()?;
        Self::require_scope(&conn, scope)?;
        let node = Self::fetch_node(&conn, scope, node_id)?;
        Ok(query::ancestors_of(&conn, &node)?)
    }

    /// Descendants of a node in interval order, excluding the node itself,
    /// optionally bounded by relative depth.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NodeNotFound`] for a missing node.
    pub fn get_descendants(
        &self,
        scope: &Scope,
        node_id: &str,
        max_depth: Option<i64>,
    ) -> Result<Vec<NodeRow>, EngineError> {
        let conn = self.connect()?;
        Self::require_scope(&conn, scope)?;
        let node = Self::fetch_node(&conn, scope, node_id)?;
        Ok(query::descendants_of(&conn, &node, max_depth)?)
    }

    /// A node's cumulative counters, already aggregated by construction.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NodeNotFound`] for a missing node.
    pub fn get_subtree_count(
        &self,
        scope: &Scope,
        node_id: &str,
    ) -> Result<SubtreeCount, EngineError> {
        let conn = self.connect()?;
        Self::require_scope(&conn, scope)?;
        query::subtree_count(&conn, scope, node_id)?.ok_or_else(|| EngineError::NodeNotFound {
            scope: scope.clone(),
            node_id: node_id.to_string(),
        })
    }

    /// Active nodes of a level ranked by active count, then total count,
    /// then id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ScopeNotFound`] for an unknown scope.
    pub fn leaderboard(
        &self,
        scope: &Scope,
        level: i64,
        limit: u32,
    ) -> Result<Vec<NodeRow>, EngineError> {
        let conn = self.connect()?;
        Self::require_scope(&conn, scope)?;
        Ok(query::leaderboard(&conn, scope, level, limit)?)
    }

    /// Metadata for one scope.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ScopeNotFound`] for an unknown scope.
    pub fn scope_meta(&self, scope: &Scope) -> Result<ScopeMeta, EngineError> {
        let conn = self.connect()?;
        Self::require_scope(&conn, scope)
    }

    /// All provisioned scopes.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] on database failure.
    pub fn list_scopes(&self) -> Result<Vec<ScopeMeta>, EngineError> {
        let conn = self.connect()?;
        Ok(query::list_scopes(&conn)?)
    }

    /// The scope's level rules.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ScopeNotFound`] for an unknown scope.
    pub fn level_rules(&self, scope: &Scope) -> Result<Vec<LevelRule>, EngineError> {
        let conn = self.connect()?;
        Self::require_scope(&conn, scope)?;
        Ok(validate::load_rules(&conn, scope)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::model::MemberState;
    use crate::reconcile::MemberTally;

    fn scope() -> Scope {
        Scope::new("acme", "np").expect("valid scope")
    }

    fn rules() -> Vec<LevelRule> {
        vec![
            LevelRule {
                unit_type: "hq".to_string(),
                level: 0,
                parent_type: None,
                min_children: 0,
                max_children: None,
            },
            LevelRule {
                unit_type: "province".to_string(),
                level: 1,
                parent_type: Some("hq".to_string()),
                min_children: 0,
                max_children: None,
            },
            LevelRule {
                unit_type: "ward".to_string(),
                level: 2,
                parent_type: Some("province".to_string()),
                min_children: 0,
                max_children: Some(2),
            },
        ]
    }

    fn root_spec() -> RootSpec {
        RootSpec {
            code: "HQ".to_string(),
            name: "Headquarters".to_string(),
            window: crate::model::Window::open(),
        }
    }

    fn spec(parent_id: &str, unit_type: &str, code: &str) -> NodeSpec {
        NodeSpec {
            parent_id: parent_id.to_string(),
            unit_type: unit_type.to_string(),
            code: code.to_string(),
            name: code.to_string(),
            window: crate::model::Window::open(),
        }
    }

    fn engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let engine = Engine::open(dir.path().join("data")).expect("open engine");
        (dir, engine)
    }

    /// Engine plus a provisioned hq -> (p1 -> w1, w2; p2) tree.
    #[allow(clippy::similar_names)]
    fn seeded() -> (tempfile::TempDir, Engine, NodeRow, Vec<NodeRow>) {
        let (dir, engine) = engine();
        let root = engine
            .create_scope(&scope(), &rules(), &root_spec())
            .expect("provision");
        let p1 = engine
            .create_node(&scope(), &spec(&root.node_id, "province", "P1"))
            .expect("p1");
        let w1 = engine
            .create_node(&scope(), &spec(&p1.node_id, "ward", "W1"))
            .expect("w1");
        let w2 = engine
            .create_node(&scope(), &spec(&p1.node_id, "ward", "W2"))
            .expect("w2");
        let p2 = engine
            .create_node(&scope(), &spec(&root.node_id, "province", "P2"))
            .expect("p2");
        (dir, engine, root, vec![p1, w1, w2, p2])
    }

    struct FixedSource(Vec<MemberTally>);

    impl MembershipSource for FixedSource {
        fn tallies(&self, _scope: &Scope) -> anyhow::Result<Vec<MemberTally>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn provisioning_creates_root_meta_and_rules() {
        let (_dir, engine) = engine();
        let root = engine
            .create_scope(&scope(), &rules(), &root_spec())
            .expect("provision");

        assert_eq!((root.lft, root.rgt, root.depth), (1, 2, 0));
        assert_eq!(root.unit_type, "hq");
        assert_eq!(root.path, root.node_id);

        let meta = engine.scope_meta(&scope()).expect("meta");
        assert!(meta.delta_propagation);
        assert_eq!(meta.corrections_total, 0);
        assert_eq!(engine.level_rules(&scope()).expect("rules").len(), 3);
    }

    #[test]
    fn provisioning_twice_is_refused() {
        let (_dir, engine) = engine();
        engine
            .create_scope(&scope(), &rules(), &root_spec())
            .expect("provision");

        let err = engine
            .create_scope(&scope(), &rules(), &root_spec())
            .expect_err("refused");
        assert_eq!(err.code(), ErrorCode::ScopeExists);
    }

    #[test]
    fn rootless_rule_sets_are_refused() {
        let (_dir, engine) = engine();
        let mut bad = rules();
        bad.remove(0); // no rule without a parent type left

        let err = engine
            .create_scope(&scope(), &bad, &root_spec())
            .expect_err("refused");
        assert_eq!(err.code(), ErrorCode::ConfigParseError);
    }

    #[test]
    fn operations_on_unknown_scopes_are_refused() {
        let (_dir, engine) = engine();
        let err = engine
            .create_node(&scope(), &spec("cn-nope", "province", "P1"))
            .expect_err("refused");
        assert_eq!(err.code(), ErrorCode::ScopeNotFound);
        assert!(err.hint().is_some());
    }

    #[test]
    fn created_nodes_nest_inside_their_parent() {
        let (_dir, engine, root, nodes) = seeded();
        let p1 = &nodes[0];
        let w1 = &nodes[1];

        let root = engine.get_node(&scope(), &root.node_id).expect("root");
        let p1 = engine.get_node(&scope(), &p1.node_id).expect("p1");
        let w1 = engine.get_node(&scope(), &w1.node_id).expect("w1");

        assert!(root.contains(&p1));
        assert!(p1.contains(&w1));
        assert_eq!(w1.depth, 2);
        assert_eq!(
            w1.path,
            format!("{}/{}/{}", root.node_id, p1.node_id, w1.node_id)
        );
    }

    #[test]
    fn rejected_placement_reports_the_rule() {
        let (_dir, engine, root, _) = seeded();

        // Wards may only sit under provinces.
        let err = engine
            .create_node(&scope(), &spec(&root.node_id, "ward", "W9"))
            .expect_err("refused");
        assert_eq!(err.code(), ErrorCode::TypeNotPermitted);
        assert!(err.to_string().contains("ward"));
    }

    #[test]
    fn deltas_land_on_the_whole_ancestor_chain() {
        let (_dir, engine, root, nodes) = seeded();
        let w1 = &nodes[1];

        let outcome = engine
            .apply_membership_delta(&scope(), &w1.node_id, 1, 1)
            .expect("delta");
        assert_eq!(outcome, DeltaOutcome::Applied { rows_touched: 3 });

        let counts = engine
            .get_subtree_count(&scope(), &root.node_id)
            .expect("counts");
        assert_eq!((counts.total, counts.active), (1, 1));
    }

    #[test]
    fn propagation_toggle_suppresses_and_restores_deltas() {
        let (_dir, engine, _root, nodes) = seeded();
        let w1 = &nodes[1];

        engine
            .set_delta_propagation(&scope(), false)
            .expect("toggle off");
        let outcome = engine
            .apply_membership_delta(&scope(), &w1.node_id, 1, 1)
            .expect("delta");
        assert_eq!(outcome, DeltaOutcome::Suppressed);
        let counts = engine
            .get_subtree_count(&scope(), &w1.node_id)
            .expect("counts");
        assert_eq!(counts.total, 0);

        engine
            .set_delta_propagation(&scope(), true)
            .expect("toggle on");
        let outcome = engine
            .apply_membership_delta(&scope(), &w1.node_id, 1, 1)
            .expect("delta");
        assert!(matches!(outcome, DeltaOutcome::Applied { .. }));
    }

    #[test]
    fn transitions_map_states_to_deltas() {
        let (_dir, engine, _root, nodes) = seeded();
        let w1 = &nodes[1];

        let transition = |old_state, new_state| MembershipTransition {
            member_id: "m-100".to_string(),
            node_id: w1.node_id.clone(),
            old_state,
            new_state,
        };
        engine
            .apply_transition(&scope(), &transition(MemberState::None, MemberState::Pending))
            .expect("joined");
        engine
            .apply_transition(
                &scope(),
                &transition(MemberState::Pending, MemberState::Active),
            )
            .expect("activated");

        let counts = engine
            .get_subtree_count(&scope(), &w1.node_id)
            .expect("counts");
        assert_eq!((counts.total, counts.active), (1, 1));
    }

    #[test]
    fn transfer_nets_zero_at_shared_ancestors() {
        let (_dir, engine, root, nodes) = seeded();
        let (p1, w1, w2) = (&nodes[0], &nodes[1], &nodes[2]);

        engine
            .apply_membership_delta(&scope(), &w1.node_id, 3, 2)
            .expect("seed counters");
        engine
            .transfer_member(&scope(), &w1.node_id, &w2.node_id, true)
            .expect("transfer");

        let count = |id: &str| {
            let c = engine.get_subtree_count(&scope(), id).expect("counts");
            (c.total, c.active)
        };
        assert_eq!(count(&w1.node_id), (2, 1));
        assert_eq!(count(&w2.node_id), (1, 1));
        assert_eq!(count(&p1.node_id), (3, 2));
        assert_eq!(count(&root.node_id), (3, 2));
    }

    #[test]
    fn reparent_moves_counters_and_paths() {
        let (_dir, engine, root, nodes) = seeded();
        let (p1, w1, p2) = (&nodes[0], &nodes[1], &nodes[3]);

        engine
            .apply_membership_delta(&scope(), &w1.node_id, 4, 2)
            .expect("seed counters");
        let moved = engine
            .reparent_node(&scope(), &w1.node_id, &p2.node_id)
            .expect("move");

        assert_eq!(moved.parent_id.as_deref(), Some(p2.node_id.as_str()));
        assert_eq!(
            moved.path,
            format!("{}/{}/{}", root.node_id, p2.node_id, w1.node_id)
        );

        let count = |id: &str| engine.get_subtree_count(&scope(), id).expect("counts");
        assert_eq!(count(&p1.node_id).total, 0);
        assert_eq!(count(&p2.node_id).total, 4);
        assert_eq!(count(&root.node_id).total, 4);
    }

    #[test]
    fn reparent_into_own_subtree_is_refused() {
        let (_dir, engine, _root, nodes) = seeded();
        let (p1, w1) = (&nodes[0], &nodes[1]);

        let err = engine
            .reparent_node(&scope(), &p1.node_id, &w1.node_id)
            .expect_err("refused");
        assert_eq!(err.code(), ErrorCode::CycleDetected);
    }

    #[test]
    fn deactivation_closes_the_window_and_is_idempotent() {
        let (_dir, engine, _root, nodes) = seeded();
        let w1 = &nodes[1];

        let first = engine
            .deactivate_node(&scope(), &w1.node_id)
            .expect("deactivate");
        assert!(!first.active);
        assert!(first.valid_to_us.is_some());

        let second = engine
            .deactivate_node(&scope(), &w1.node_id)
            .expect("idempotent");
        assert_eq!(second.valid_to_us, first.valid_to_us);
        assert_eq!(second.updated_at_us, first.updated_at_us);
    }

    #[test]
    fn deactivated_nodes_leave_the_leaderboard() {
        let (_dir, engine, _root, nodes) = seeded();
        let (w1, w2) = (&nodes[1], &nodes[2]);

        engine
            .apply_membership_delta(&scope(), &w1.node_id, 5, 5)
            .expect("w1 counters");
        engine
            .apply_membership_delta(&scope(), &w2.node_id, 1, 1)
            .expect("w2 counters");
        engine
            .deactivate_node(&scope(), &w1.node_id)
            .expect("deactivate");

        let board = engine.leaderboard(&scope(), 2, 10).expect("board");
        let ids: Vec<_> = board.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec![w2.node_id.as_str()]);
    }

    #[test]
    fn integrity_failure_gates_structure_but_not_counters() {
        let (_dir, engine, root, nodes) = seeded();
        let w1 = &nodes[1];

        // Corrupt w1's interval so it pokes out past the root.
        let root = engine.get_node(&scope(), &root.node_id).expect("root");
        let conn = rusqlite::Connection::open(engine.db_path()).expect("raw open");
        conn.execute(
            "UPDATE nodes SET lft = ?1, rgt = ?2 WHERE node_id = ?3",
            params![root.rgt - 1, root.rgt + 4, w1.node_id],
        )
        .expect("corrupt");
        drop(conn);

        let report = engine.verify_scope(&scope()).expect("verify");
        assert!(report.integrity_failed);

        let err = engine
            .create_node(&scope(), &spec(&root.node_id, "province", "P9"))
            .expect_err("structural write refused");
        assert_eq!(err.code(), ErrorCode::IntegrityFailed);

        // Counter traffic continues in degraded mode.
        engine
            .apply_membership_delta(&scope(), &nodes[2].node_id, 1, 0)
            .expect("delta still works");

        // Repair, clear, and structure opens up again.
        let conn = rusqlite::Connection::open(engine.db_path()).expect("raw open");
        conn.execute(
            "UPDATE nodes SET lft = ?1, rgt = ?2 WHERE node_id = ?3",
            params![w1.lft, w1.rgt, w1.node_id],
        )
        .expect("repair");
        drop(conn);

        engine.clear_integrity_failure(&scope()).expect("clear");
        engine
            .create_node(&scope(), &spec(&root.node_id, "province", "P9"))
            .expect("structural write allowed again");
    }

    #[test]
    fn bulk_import_flow_reconciles_suppressed_counters() {
        let (_dir, engine, root, nodes) = seeded();
        let (w1, w2) = (&nodes[1], &nodes[2]);

        engine
            .set_delta_propagation(&scope(), false)
            .expect("toggle off");
        for _ in 0..3 {
            engine
                .apply_membership_delta(&scope(), &w1.node_id, 1, 1)
                .expect("suppressed");
        }
        engine
            .set_delta_propagation(&scope(), true)
            .expect("toggle on");

        let source = FixedSource(vec![
            MemberTally {
                node_id: w1.node_id.clone(),
                total: 3,
                active: 3,
            },
            MemberTally {
                node_id: w2.node_id.clone(),
                total: 1,
                active: 0,
            },
        ]);
        let report = engine.reconcile(&scope(), &source).expect("reconcile");
        assert!(!report.corrections.is_empty());

        let counts = engine
            .get_subtree_count(&scope(), &root.node_id)
            .expect("counts");
        assert_eq!((counts.total, counts.active), (4, 3));
    }

    #[test]
    fn validate_placement_answers_without_mutation() {
        let (_dir, engine, _root, _) = seeded();

        engine
            .validate_placement(&scope(), "province", "ward")
            .expect("permitted");
        let err = engine
            .validate_placement(&scope(), "hq", "ward")
            .expect_err("refused");
        assert_eq!(err.code(), ErrorCode::TypeNotPermitted);
    }

    #[test]
    fn ancestors_and_descendants_agree_with_structure() {
        let (_dir, engine, root, nodes) = seeded();
        let (p1, w1) = (&nodes[0], &nodes[1]);

        let ancestors = engine
            .get_ancestors(&scope(), &w1.node_id)
            .expect("ancestors");
        let chain: Vec<_> = ancestors.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(chain, vec![root.node_id.as_str(), p1.node_id.as_str()]);

        let all = engine
            .get_descendants(&scope(), &root.node_id, None)
            .expect("descendants");
        assert_eq!(all.len(), 4);
        let shallow = engine
            .get_descendants(&scope(), &root.node_id, Some(1))
            .expect("bounded");
        assert_eq!(shallow.len(), 2); // the two provinces
    }

    #[test]
    fn list_scopes_sees_every_provisioned_scope() {
        let (_dir, engine) = engine();
        engine
            .create_scope(&scope(), &rules(), &root_spec())
            .expect("first");
        let other = Scope::new("acme", "in").expect("valid scope");
        engine
            .create_scope(&other, &rules(), &root_spec())
            .expect("second");

        let scopes = engine.list_scopes().expect("list");
        let names: Vec<_> = scopes.iter().map(|m| m.scope.to_string()).collect();
        assert_eq!(names, vec!["acme/in", "acme/np"]);
    }
}
