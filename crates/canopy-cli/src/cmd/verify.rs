//! `cnp verify` — scan a scope for structural damage, optionally clearing
//! a previously set integrity flag.

use std::io::Write;

use canopy_core::error::ErrorCode;
use canopy_core::scope::Scope;
use canopy_core::store::Engine;
use canopy_core::verify::Finding;
use clap::Args;

use crate::output::{OutputMode, engine_failure, render};

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Scope of the tree, as `tenant/domain`.
    #[arg(long)]
    pub scope: Scope,

    /// Reset the integrity-failed flag after a clean re-scan.
    #[arg(long)]
    pub clear: bool,
}

pub fn run_verify(args: &VerifyArgs, engine: &Engine, output: OutputMode) -> anyhow::Result<()> {
    let report = if args.clear {
        engine
            .clear_integrity_failure(&args.scope)
            .map_err(|err| engine_failure(output, &err))?
    } else {
        engine
            .verify_scope(&args.scope)
            .map_err(|err| engine_failure(output, &err))?
    };

    render(output, &report, |report, w| {
        if report.is_ok() {
            let suffix = if args.clear {
                ", integrity flag reset"
            } else {
                ""
            };
            return writeln!(
                w,
                "✓ Verified {}: {} node(s) scanned, no findings{suffix}",
                report.scope, report.nodes_scanned
            );
        }
        writeln!(
            w,
            "Verified {}: {} node(s) scanned, {} finding(s)",
            report.scope,
            report.nodes_scanned,
            report.findings.len()
        )?;
        for finding in &report.findings {
            match finding {
                Finding::RangeOverlap { node_a, node_b } => {
                    writeln!(w, "  FATAL  interval overlap: {node_a} <> {node_b}")?;
                }
                Finding::DepthMismatch {
                    node_id,
                    stored,
                    expected,
                } => {
                    writeln!(
                        w,
                        "  drift  depth of {node_id}: stored {stored}, expected {expected}"
                    )?;
                }
                Finding::PathMismatch {
                    node_id,
                    stored,
                    derived,
                } => {
                    writeln!(
                        w,
                        "  drift  path of {node_id}: stored '{stored}', derived '{derived}'"
                    )?;
                }
                Finding::ChildShortfall {
                    parent_id,
                    unit_type,
                    have,
                    min,
                } => {
                    writeln!(
                        w,
                        "  note   {parent_id} has {have}/{min} active {unit_type}(s)"
                    )?;
                }
            }
        }
        Ok(())
    })?;

    if report.integrity_failed {
        anyhow::bail!("{}", ErrorCode::IntegrityFailed.code());
    }
    Ok(())
}
