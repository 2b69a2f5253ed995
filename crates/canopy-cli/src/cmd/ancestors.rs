//! `cnp ancestors` — show a node's chain of command, root first.

use std::io::Write;

use canopy_core::db::query::NodeRow;
use canopy_core::scope::Scope;
use canopy_core::store::Engine;
use clap::Args;
use serde::Serialize;

use crate::output::{OutputMode, engine_failure, render};

#[derive(Args, Debug)]
pub struct AncestorsArgs {
    /// Scope of the tree, as `tenant/domain`.
    #[arg(long)]
    pub scope: Scope,

    /// Node id whose lineage to show.
    #[arg(value_name = "NODE")]
    pub node: String,
}

#[derive(Serialize)]
struct AncestorsPayload {
    scope: String,
    node: NodeRow,
    ancestors: Vec<NodeRow>,
}

pub fn run_ancestors(
    args: &AncestorsArgs,
    engine: &Engine,
    output: OutputMode,
) -> anyhow::Result<()> {
    let node = engine
        .get_node(&args.scope, &args.node)
        .map_err(|err| engine_failure(output, &err))?;
    let ancestors = engine
        .get_ancestors(&args.scope, &args.node)
        .map_err(|err| engine_failure(output, &err))?;

    let payload = AncestorsPayload {
        scope: args.scope.to_string(),
        node,
        ancestors,
    };
    render(output, &payload, |payload, w| {
        for ancestor in &payload.ancestors {
            let indent = usize::try_from(ancestor.depth).unwrap_or(0);
            writeln!(
                w,
                "{:indent$}{} [{}] {}",
                "",
                ancestor.code,
                ancestor.unit_type,
                ancestor.node_id,
                indent = indent * 2,
            )?;
        }
        let indent = usize::try_from(payload.node.depth).unwrap_or(0);
        writeln!(
            w,
            "{:indent$}{} [{}] {}  <- here",
            "",
            payload.node.code,
            payload.node.unit_type,
            payload.node.node_id,
            indent = indent * 2,
        )
    })
}
