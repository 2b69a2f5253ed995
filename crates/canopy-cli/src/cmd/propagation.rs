//! `cnp propagation` — toggle live delta propagation for a scope.
//!
//! Switched off before a bulk import so per-event updates stop touching
//! ancestor chains; the closing `cnp reconcile` settles every counter in
//! one pass, after which propagation goes back on.

use std::io::Write;

use canopy_core::scope::Scope;
use canopy_core::store::Engine;
use clap::{Args, ValueEnum};
use serde::Serialize;

use crate::output::{OutputMode, engine_failure, render};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    const fn as_bool(self) -> bool {
        matches!(self, Self::On)
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

#[derive(Args, Debug)]
pub struct PropagationArgs {
    /// Scope of the tree, as `tenant/domain`.
    #[arg(long)]
    pub scope: Scope,

    /// Desired state.
    #[arg(value_enum, value_name = "STATE")]
    pub state: Toggle,
}

#[derive(Serialize)]
struct PropagationPayload {
    scope: String,
    delta_propagation: bool,
}

pub fn run_propagation(
    args: &PropagationArgs,
    engine: &Engine,
    output: OutputMode,
) -> anyhow::Result<()> {
    engine
        .set_delta_propagation(&args.scope, args.state.as_bool())
        .map_err(|err| engine_failure(output, &err))?;

    let payload = PropagationPayload {
        scope: args.scope.to_string(),
        delta_propagation: args.state.as_bool(),
    };
    render(output, &payload, |payload, w| {
        writeln!(
            w,
            "✓ Delta propagation {} for {}",
            args.state.as_str(),
            payload.scope
        )
    })
}
