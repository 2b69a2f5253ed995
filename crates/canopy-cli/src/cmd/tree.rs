//! `cnp tree` — print a subtree as an indented outline.

use std::io::Write;

use canopy_core::db::query::NodeRow;
use canopy_core::error::EngineError;
use canopy_core::scope::Scope;
use canopy_core::store::Engine;
use clap::Args;
use serde::Serialize;

use crate::output::{OutputMode, engine_failure, render};

#[derive(Args, Debug)]
pub struct TreeArgs {
    /// Scope of the tree, as `tenant/domain`.
    #[arg(long)]
    pub scope: Scope,

    /// Anchor node id. Defaults to the scope root.
    #[arg(long)]
    pub node: Option<String>,

    /// Limit output to this many levels below the anchor.
    #[arg(long)]
    pub depth: Option<i64>,
}

#[derive(Serialize)]
struct TreePayload {
    scope: String,
    node_count: usize,
    nodes: Vec<NodeRow>,
}

pub fn run_tree(args: &TreeArgs, engine: &Engine, output: OutputMode) -> anyhow::Result<()> {
    let anchor = match &args.node {
        Some(id) => engine
            .get_node(&args.scope, id)
            .map_err(|err| engine_failure(output, &err))?,
        None => engine
            .get_root(&args.scope)
            .map_err(|err| engine_failure(output, &err))?
            .ok_or_else(|| {
                let err = EngineError::NodeNotFound {
                    scope: args.scope.clone(),
                    node_id: "<root>".to_string(),
                };
                engine_failure(output, &err)
            })?,
    };
    let descendants = engine
        .get_descendants(&args.scope, &anchor.node_id, args.depth)
        .map_err(|err| engine_failure(output, &err))?;

    let base_depth = anchor.depth;
    let mut nodes = Vec::with_capacity(descendants.len() + 1);
    nodes.push(anchor);
    nodes.extend(descendants);

    let payload = TreePayload {
        scope: args.scope.to_string(),
        node_count: nodes.len(),
        nodes,
    };
    render(output, &payload, |payload, w| {
        for node in &payload.nodes {
            let indent = usize::try_from(node.depth - base_depth).unwrap_or(0);
            let marker = if node.active { "" } else { "  (inactive)" };
            writeln!(
                w,
                "{:indent$}{} [{}] {}/{} {}{marker}",
                "",
                node.code,
                node.unit_type,
                node.active_count,
                node.total_count,
                node.node_id,
                indent = indent * 2,
            )?;
        }
        writeln!(w, "{} node(s)", payload.node_count)
    })
}
