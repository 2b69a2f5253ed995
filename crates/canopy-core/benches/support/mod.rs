#![allow(dead_code)]

use canopy_core::model::{RootSpec, Window, generate_node_id, now_us};
use canopy_core::scope::Scope;
use canopy_core::store::Engine;
use canopy_core::tree::validate::LevelRule;
use rusqlite::{Connection, params};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Unit-type ladder used by the synthetic trees, one type per depth.
const TYPE_LADDER: [&str; 6] = ["hq", "province", "district", "palika", "ward", "cell"];

/// Fanout of the synthetic trees. Node `i`'s children are
/// `i*FANOUT+1 ..= i*FANOUT+FANOUT`, so parents always precede children.
const FANOUT: usize = 8;

#[derive(Clone, Copy, Debug)]
pub struct BenchmarkTier {
    pub name: &'static str,
    pub node_count: usize,
}

pub const TIER_S: BenchmarkTier = BenchmarkTier {
    name: "S",
    node_count: 100,
};

pub const TIER_M: BenchmarkTier = BenchmarkTier {
    name: "M",
    node_count: 1_000,
};

pub const TIER_L: BenchmarkTier = BenchmarkTier {
    name: "L",
    node_count: 5_000,
};

pub const TIERS: [BenchmarkTier; 3] = [TIER_S, TIER_M, TIER_L];

/// A provisioned scope with a fully seeded synthetic tree. The temp dir is
/// carried so the database outlives the benchmark loop.
#[derive(Debug)]
pub struct SeededScope {
    pub tier: BenchmarkTier,
    pub seed: u64,
    pub dir: TempDir,
    pub engine: Engine,
    pub scope: Scope,
    pub root_id: String,
    pub deepest_id: String,
    pub node_count: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct LatencySummary {
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

#[derive(Clone, Copy, Debug)]
struct Prng(u64);

impl Prng {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_u64(&mut self) -> u64 {
        // 64-bit LCG constants from Numerical Recipes.
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0
    }

    fn next_index(&mut self, upper_exclusive: usize) -> usize {
        if upper_exclusive == 0 {
            return 0;
        }
        (self.next_u64() as usize) % upper_exclusive
    }
}

struct SeedRow {
    node_id: String,
    parent: Option<usize>,
    depth: i64,
    path: String,
    lft: i64,
    rgt: i64,
    total: i64,
    active: i64,
}

pub fn seed_scope(tier: BenchmarkTier, seed: u64) -> SeededScope {
    seed_scope_with_node_limit(tier, seed, tier.node_count)
}

pub fn seed_scope_for_bench(tier: BenchmarkTier, seed: u64) -> SeededScope {
    let max_nodes = std::env::var("CANOPY_BENCH_MAX_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(5_000);
    let node_limit = tier.node_count.min(max_nodes).max(1);
    seed_scope_with_node_limit(tier, seed, node_limit)
}

/// Build the database the fast way: provision the scope through the engine,
/// then bulk-insert a heap-shaped tree whose interval bounds and cumulative
/// counters are computed up front in one pass. Inserting node by node through
/// `create_node` would shift bounds quadratically and drown the setup.
pub fn seed_scope_with_node_limit(
    tier: BenchmarkTier,
    seed: u64,
    node_count: usize,
) -> SeededScope {
    let dir = TempDir::new().expect("bench temp dir");
    let engine = Engine::open(dir.path().join("data")).expect("bench engine");
    let scope = Scope::new("bench", "np").expect("bench scope");

    let root = engine
        .create_scope(
            &scope,
            &ladder_rules(),
            &RootSpec {
                code: "HQ".to_string(),
                name: "Benchmark HQ".to_string(),
                window: Window::open(),
            },
        )
        .expect("bench provisioning");

    let mut prng = Prng::new(seed);
    let mut rows = Vec::with_capacity(node_count);
    for index in 0..node_count {
        let (node_id, parent, depth, path) = if index == 0 {
            (root.node_id.clone(), None, 0, root.path.clone())
        } else {
            let parent = (index - 1) / FANOUT;
            let node_id = generate_node_id();
            let path = format!("{}/{node_id}", rows[parent].path);
            (node_id, Some(parent), rows[parent].depth + 1, path)
        };
        assert!(
            (depth as usize) < TYPE_LADDER.len(),
            "tier too deep for type ladder"
        );

        let total = prng.next_index(40) as i64;
        let active = prng.next_index(total as usize + 1) as i64;
        rows.push(SeedRow {
            node_id,
            parent,
            depth,
            path,
            lft: 0,
            rgt: 0,
            total,
            active,
        });
    }

    let mut cursor = 1;
    layout(&mut rows, 0, &mut cursor);
    assert_eq!(cursor, 2 * node_count as i64 + 1, "bounds must tile");

    let mut conn = Connection::open(engine.db_path()).expect("bench db");
    let tx = conn.transaction().expect("bench tx");
    {
        let now = now_us();
        tx.execute(
            "UPDATE nodes SET rgt = ?1, total_count = ?2, active_count = ?3
             WHERE node_id = ?4",
            params![rows[0].rgt, rows[0].total, rows[0].active, rows[0].node_id],
        )
        .expect("bench root update");

        let mut insert = tx
            .prepare(
                "INSERT INTO nodes (
                    node_id, tenant, domain, unit_type, level, code, name,
                    parent_id, lft, rgt, depth, path,
                    total_count, active_count, active, created_at_us, updated_at_us
                 ) VALUES (?1, 'bench', 'np', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 1, ?13, ?13)",
            )
            .expect("bench insert stmt");
        for (index, row) in rows.iter().enumerate().skip(1) {
            let parent_id = row.parent.map(|p| rows[p].node_id.as_str());
            insert
                .execute(params![
                    row.node_id,
                    TYPE_LADDER[row.depth as usize],
                    row.depth,
                    format!("U{index}"),
                    format!("Unit {index}"),
                    parent_id,
                    row.lft,
                    row.rgt,
                    row.depth,
                    row.path,
                    row.total,
                    row.active,
                    now,
                ])
                .expect("bench insert");
        }
    }
    tx.commit().expect("bench commit");

    let deepest_id = rows[node_count - 1].node_id.clone();
    SeededScope {
        tier,
        seed,
        dir,
        engine,
        scope,
        root_id: root.node_id,
        deepest_id,
        node_count,
    }
}

/// Depth-first interval assignment over the heap layout. Returns the
/// subtree's cumulative `(total, active)` and folds it into the row.
fn layout(rows: &mut [SeedRow], index: usize, cursor: &mut i64) -> (i64, i64) {
    rows[index].lft = *cursor;
    *cursor += 1;

    let mut total = rows[index].total;
    let mut active = rows[index].active;
    let first_child = index * FANOUT + 1;
    for child in first_child..first_child + FANOUT {
        if child >= rows.len() {
            break;
        }
        let (t, a) = layout(rows, child, cursor);
        total += t;
        active += a;
    }

    rows[index].rgt = *cursor;
    *cursor += 1;
    rows[index].total = total;
    rows[index].active = active;
    (total, active)
}

fn ladder_rules() -> Vec<LevelRule> {
    TYPE_LADDER
        .iter()
        .enumerate()
        .map(|(level, unit_type)| LevelRule {
            unit_type: (*unit_type).to_string(),
            level: level as i64,
            parent_type: level
                .checked_sub(1)
                .map(|prev| TYPE_LADDER[prev].to_string()),
            min_children: 0,
            max_children: None,
        })
        .collect()
}

pub fn sample_latencies(iterations: usize, mut op: impl FnMut()) -> Vec<Duration> {
    let mut samples = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let start = Instant::now();
        op();
        samples.push(start.elapsed());
    }
    samples
}

pub fn summarize_latencies(samples: &[Duration]) -> LatencySummary {
    assert!(!samples.is_empty(), "at least one sample is required");

    let mut sorted = samples.to_vec();
    sorted.sort_unstable();

    LatencySummary {
        p50: percentile(&sorted, 50),
        p95: percentile(&sorted, 95),
        p99: percentile(&sorted, 99),
    }
}

fn percentile(sorted: &[Duration], percentile: usize) -> Duration {
    let idx = ((sorted.len() - 1) * percentile) / 100;
    sorted[idx]
}
