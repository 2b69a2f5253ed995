//! `cnp move` — reparent a subtree, counters and paths included.

use std::io::Write;

use canopy_core::scope::Scope;
use canopy_core::store::Engine;
use clap::Args;

use crate::output::{OutputMode, engine_failure, kv, render};

#[derive(Args, Debug)]
pub struct MoveArgs {
    /// Scope of the tree, as `tenant/domain`.
    #[arg(long)]
    pub scope: Scope,

    /// Node id to move (its whole subtree moves with it).
    #[arg(value_name = "NODE")]
    pub node: String,

    /// Destination parent node id.
    #[arg(long)]
    pub to: String,
}

pub fn run_move(args: &MoveArgs, engine: &Engine, output: OutputMode) -> anyhow::Result<()> {
    let node = engine
        .reparent_node(&args.scope, &args.node, &args.to)
        .map_err(|err| engine_failure(output, &err))?;

    render(output, &node, |node, w| {
        writeln!(w, "✓ Moved {} '{}'", node.unit_type, node.code)?;
        kv(w, "node_id", &node.node_id)?;
        kv(w, "new_parent", node.parent_id.as_deref().unwrap_or("-"))?;
        kv(w, "path", &node.path)
    })
}
