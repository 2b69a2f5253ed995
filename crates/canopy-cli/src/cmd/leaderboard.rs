//! `cnp leaderboard` — rank one level's active units by membership.

use std::io::Write;

use canopy_core::db::query::NodeRow;
use canopy_core::scope::Scope;
use canopy_core::store::Engine;
use clap::Args;
use serde::Serialize;

use crate::output::{OutputMode, engine_failure, render};

#[derive(Args, Debug)]
pub struct LeaderboardArgs {
    /// Scope of the tree, as `tenant/domain`.
    #[arg(long)]
    pub scope: Scope,

    /// Tree level to rank (0 is the root's level).
    #[arg(long)]
    pub level: i64,

    /// Number of rows to return.
    #[arg(long, default_value_t = 10)]
    pub limit: u32,
}

#[derive(Serialize)]
struct LeaderboardPayload {
    scope: String,
    level: i64,
    rows: Vec<NodeRow>,
}

pub fn run_leaderboard(
    args: &LeaderboardArgs,
    engine: &Engine,
    output: OutputMode,
) -> anyhow::Result<()> {
    let rows = engine
        .leaderboard(&args.scope, args.level, args.limit)
        .map_err(|err| engine_failure(output, &err))?;

    let payload = LeaderboardPayload {
        scope: args.scope.to_string(),
        level: args.level,
        rows,
    };
    render(output, &payload, |payload, w| {
        if payload.rows.is_empty() {
            return writeln!(w, "no active units at level {}", payload.level);
        }
        for (rank, row) in payload.rows.iter().enumerate() {
            writeln!(
                w,
                "{:>3}. {}  active={} total={}  {}",
                rank + 1,
                row.code,
                row.active_count,
                row.total_count,
                row.node_id,
            )?;
        }
        Ok(())
    })
}
