//! `cnp init` — provision a scope from a TOML rules file.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context as _;
use canopy_core::error::ErrorCode;
use canopy_core::model::{RootSpec, Window};
use canopy_core::scope::Scope;
use canopy_core::store::Engine;
use canopy_core::tree::validate::LevelRule;
use clap::Args;
use serde::Deserialize;

use crate::output::{CliError, OutputMode, engine_failure, kv, render, render_error};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Scope to provision, as `tenant/domain`.
    #[arg(long)]
    pub scope: Scope,

    /// Path to the level-rules TOML file (one `[[rule]]` table per unit type).
    #[arg(long)]
    pub rules: PathBuf,

    /// Short code for the root node.
    #[arg(long, default_value = "ROOT")]
    pub root_code: String,

    /// Display name for the root node; defaults to the root code.
    #[arg(long)]
    pub root_name: Option<String>,
}

/// On-disk shape of the rules file:
///
/// ```toml
/// [[rule]]
/// unit_type = "hq"
/// level = 0
///
/// [[rule]]
/// unit_type = "province"
/// level = 1
/// parent_type = "hq"
/// max_children = 7
/// ```
#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rule: Vec<LevelRule>,
}

pub fn run_init(args: &InitArgs, engine: &Engine, output: OutputMode) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(&args.rules)
        .with_context(|| format!("read rules file {}", args.rules.display()))?;

    let rules_file: RulesFile = match toml::from_str(&content) {
        Ok(parsed) => parsed,
        Err(parse_err) => {
            let code = ErrorCode::ConfigParseError;
            render_error(
                output,
                &CliError::with_details(
                    format!("{}: {parse_err}", args.rules.display()),
                    code.hint().unwrap_or_default(),
                    code.code(),
                ),
            )?;
            anyhow::bail!("{}", code.code());
        }
    };

    let root_spec = RootSpec {
        code: args.root_code.clone(),
        name: args
            .root_name
            .clone()
            .unwrap_or_else(|| args.root_code.clone()),
        window: Window::open(),
    };

    let root = engine
        .create_scope(&args.scope, &rules_file.rule, &root_spec)
        .map_err(|err| engine_failure(output, &err))?;

    render(output, &root, |root, w| {
        writeln!(w, "✓ Provisioned scope {}", args.scope)?;
        kv(w, "root", &root.node_id)?;
        kv(w, "unit_type", &root.unit_type)?;
        kv(w, "rules", format!("{} level(s)", rules_file.rule.len()))
    })
}
