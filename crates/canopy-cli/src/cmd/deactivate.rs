//! `cnp deactivate` — retire a unit without deleting its history.

use std::io::Write;

use canopy_core::scope::Scope;
use canopy_core::store::Engine;
use clap::Args;

use crate::output::{OutputMode, engine_failure, kv, render};

#[derive(Args, Debug)]
pub struct DeactivateArgs {
    /// Scope of the tree, as `tenant/domain`.
    #[arg(long)]
    pub scope: Scope,

    /// Node id to deactivate.
    #[arg(value_name = "NODE")]
    pub node: String,
}

pub fn run_deactivate(
    args: &DeactivateArgs,
    engine: &Engine,
    output: OutputMode,
) -> anyhow::Result<()> {
    let node = engine
        .deactivate_node(&args.scope, &args.node)
        .map_err(|err| engine_failure(output, &err))?;

    render(output, &node, |node, w| {
        writeln!(w, "✓ Deactivated {} '{}'", node.unit_type, node.code)?;
        kv(w, "node_id", &node.node_id)?;
        kv(
            w,
            "valid_to_us",
            node.valid_to_us
                .map_or_else(|| "open".to_string(), |us| us.to_string()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::model::{RootSpec, Window};
    use canopy_core::tree::validate::LevelRule;
    use tempfile::TempDir;

    fn scope() -> Scope {
        Scope::new("acme", "np").expect("valid scope")
    }

    #[test]
    fn deactivate_closes_the_node() {
        let dir = TempDir::new().expect("temp dir");
        let engine = Engine::open(dir.path().join("data")).expect("open engine");
        let rules = vec![LevelRule {
            unit_type: "hq".to_string(),
            level: 0,
            parent_type: None,
            min_children: 0,
            max_children: None,
        }];
        let root = engine
            .create_scope(
                &scope(),
                &rules,
                &RootSpec {
                    code: "HQ".to_string(),
                    name: "HQ".to_string(),
                    window: Window::open(),
                },
            )
            .expect("provision");

        let args = DeactivateArgs {
            scope: scope(),
            node: root.node_id.clone(),
        };
        run_deactivate(&args, &engine, OutputMode::Human).expect("deactivate");

        let reread = engine.get_node(&scope(), &root.node_id).expect("node");
        assert!(!reread.active);
        assert!(reread.valid_to_us.is_some());
    }
}
