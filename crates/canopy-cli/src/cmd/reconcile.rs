//! `cnp reconcile` — settle counters and paths against an authoritative
//! tally feed.

use std::io::Write;
use std::path::PathBuf;

use canopy_core::reconcile::JsonTallySource;
use canopy_core::scope::Scope;
use canopy_core::store::Engine;
use clap::Args;

use crate::output::{OutputMode, engine_failure, kv, render};

#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Scope of the tree, as `tenant/domain`.
    #[arg(long)]
    pub scope: Scope,

    /// JSON tally file: an array of `{node_id, total, active}` objects.
    #[arg(long)]
    pub tallies: PathBuf,
}

pub fn run_reconcile(
    args: &ReconcileArgs,
    engine: &Engine,
    output: OutputMode,
) -> anyhow::Result<()> {
    let source = JsonTallySource::new(&args.tallies);
    let report = engine
        .reconcile(&args.scope, &source)
        .map_err(|err| engine_failure(output, &err))?;

    render(output, &report, |report, w| {
        if report.is_clean() {
            writeln!(
                w,
                "✓ Reconciled {}: {} node(s) scanned, nothing to fix ({:?})",
                report.scope, report.nodes_scanned, report.elapsed
            )
        } else {
            writeln!(
                w,
                "✓ Reconciled {}: {} node(s) scanned ({:?})",
                report.scope, report.nodes_scanned, report.elapsed
            )?;
            kv(w, "corrections", report.corrections.len().to_string())?;
            kv(w, "paths repaired", report.paths_repaired.to_string())?;
            if !report.unknown_nodes.is_empty() {
                kv(w, "unknown nodes", report.unknown_nodes.join(", "))?;
            }
            Ok(())
        }
    })
}
