//! `cnp transfer` — move one membership between units in a single step.

use std::io::Write;

use canopy_core::scope::Scope;
use canopy_core::stats::DeltaOutcome;
use canopy_core::store::Engine;
use clap::Args;

use crate::output::{OutputMode, engine_failure, render};

#[derive(Args, Debug)]
pub struct TransferArgs {
    /// Scope of the tree, as `tenant/domain`.
    #[arg(long)]
    pub scope: Scope,

    /// Node id the membership leaves.
    #[arg(long)]
    pub from: String,

    /// Node id the membership joins.
    #[arg(long)]
    pub to: String,

    /// Transfer an inactive membership (adjusts total tallies only).
    #[arg(long)]
    pub inactive: bool,
}

pub fn run_transfer(args: &TransferArgs, engine: &Engine, output: OutputMode) -> anyhow::Result<()> {
    let outcome = engine
        .transfer_member(&args.scope, &args.from, &args.to, !args.inactive)
        .map_err(|err| engine_failure(output, &err))?;

    render(output, &outcome, |outcome, w| match outcome {
        DeltaOutcome::Applied { rows_touched } => writeln!(
            w,
            "✓ Transferred one membership across {rows_touched} node(s)"
        ),
        DeltaOutcome::Suppressed => writeln!(
            w,
            "– Suppressed: delta propagation is off for {} (reconcile to settle counters)",
            args.scope
        ),
    })
}
