//! `cnp delta` — apply a signed membership counter delta at a node.

use std::io::Write;

use canopy_core::scope::Scope;
use canopy_core::stats::DeltaOutcome;
use canopy_core::store::Engine;
use clap::Args;

use crate::output::{OutputMode, engine_failure, render};

#[derive(Args, Debug)]
pub struct DeltaArgs {
    /// Scope of the tree, as `tenant/domain`.
    #[arg(long)]
    pub scope: Scope,

    /// Node id the delta lands on.
    #[arg(value_name = "NODE")]
    pub node: String,

    /// Change to the total membership tally.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub total: i64,

    /// Change to the active membership tally.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub active: i64,
}

pub fn run_delta(args: &DeltaArgs, engine: &Engine, output: OutputMode) -> anyhow::Result<()> {
    let outcome = engine
        .apply_membership_delta(&args.scope, &args.node, args.total, args.active)
        .map_err(|err| engine_failure(output, &err))?;

    render(output, &outcome, |outcome, w| match outcome {
        DeltaOutcome::Applied { rows_touched } => writeln!(
            w,
            "✓ Applied ({:+}, {:+}) across {rows_touched} node(s)",
            args.total, args.active
        ),
        DeltaOutcome::Suppressed => writeln!(
            w,
            "– Suppressed: delta propagation is off for {} (reconcile to settle counters)",
            args.scope
        ),
    })
}
