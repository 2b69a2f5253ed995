//! `cnp create` — add a unit under an existing parent.

use std::io::Write;

use canopy_core::model::{NodeSpec, Window};
use canopy_core::scope::Scope;
use canopy_core::store::Engine;
use clap::Args;

use crate::output::{OutputMode, engine_failure, kv, render};

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Scope of the tree, as `tenant/domain`.
    #[arg(long)]
    pub scope: Scope,

    /// Parent node id.
    #[arg(long)]
    pub parent: String,

    /// Unit type, validated against the scope's level rules.
    #[arg(long = "type")]
    pub unit_type: String,

    /// Short code, unique among siblings.
    #[arg(long)]
    pub code: String,

    /// Display name; defaults to the code.
    #[arg(long)]
    pub name: Option<String>,

    /// Validity window start, microseconds since the Unix epoch.
    #[arg(long)]
    pub valid_from_us: Option<i64>,

    /// Validity window end, microseconds since the Unix epoch.
    #[arg(long)]
    pub valid_to_us: Option<i64>,
}

pub fn run_create(args: &CreateArgs, engine: &Engine, output: OutputMode) -> anyhow::Result<()> {
    let spec = NodeSpec {
        parent_id: args.parent.clone(),
        unit_type: args.unit_type.clone(),
        code: args.code.clone(),
        name: args.name.clone().unwrap_or_else(|| args.code.clone()),
        window: Window {
            valid_from_us: args.valid_from_us,
            valid_to_us: args.valid_to_us,
        },
    };

    let node = engine
        .create_node(&args.scope, &spec)
        .map_err(|err| engine_failure(output, &err))?;

    render(output, &node, |node, w| {
        writeln!(w, "✓ Created {} '{}'", node.unit_type, node.code)?;
        kv(w, "node_id", &node.node_id)?;
        kv(w, "level", node.level.to_string())?;
        kv(w, "path", &node.path)
    })
}
