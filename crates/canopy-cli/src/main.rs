#![forbid(unsafe_code)]

mod cmd;
mod output;

use canopy_core::store::Engine;
use clap::{CommandFactory, Parser, Subcommand};
use output::OutputMode;
use std::env;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "canopy: nested-interval hierarchy engine",
    long_about = None
)]
struct Cli {
    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Data directory holding the store and lock files.
    /// Defaults to $CANOPY_DATA_DIR, then `.canopy`.
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Derive the output mode from flags.
    fn output_mode(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }

    /// Resolve the data directory from flag, environment, or default.
    fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            env::var_os("CANOPY_DATA_DIR")
                .map_or_else(|| PathBuf::from(".canopy"), PathBuf::from)
        })
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Provisioning",
        about = "Provision a scope with level rules and a root",
        long_about = "Provision a (tenant, domain) scope: store its level rules and create the root node.",
        after_help = "EXAMPLES:\n    # Provision a scope from a rules file\n    cnp init --scope acme/np --rules rules.toml\n\n    # Name the root explicitly\n    cnp init --scope acme/np --rules rules.toml --root-code HQ --root-name \"Head Office\"\n\n    # Emit machine-readable output\n    cnp init --scope acme/np --rules rules.toml --json"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        next_help_heading = "Structure",
        about = "Create a unit under a parent",
        long_about = "Create an organizational unit under an existing parent, subject to the scope's level rules.",
        after_help = "EXAMPLES:\n    # Create a province under the root\n    cnp create --scope acme/np --parent cn-root --type province --code P1\n\n    # Give it a display name and a validity window\n    cnp create --scope acme/np --parent cn-root --type province --code P1 --name \"Province One\" --valid-from-us 1700000000000000"
    )]
    Create(cmd::create::CreateArgs),

    #[command(
        next_help_heading = "Structure",
        about = "Deactivate a unit",
        long_about = "Mark a unit inactive and close its validity window. The subtree stays in place.",
        after_help = "EXAMPLES:\n    # Retire a ward\n    cnp deactivate --scope acme/np cn-w1\n\n    # Emit machine-readable output\n    cnp deactivate --scope acme/np cn-w1 --json"
    )]
    Deactivate(cmd::deactivate::DeactivateArgs),

    #[command(
        next_help_heading = "Structure",
        about = "Move a subtree under a new parent",
        long_about = "Reparent a unit (and its whole subtree) under a new parent, subject to the level rules.",
        after_help = "EXAMPLES:\n    # Rehome a ward\n    cnp move --scope acme/np cn-w1 --to cn-p2\n\n    # Emit machine-readable output\n    cnp move --scope acme/np cn-w1 --to cn-p2 --json"
    )]
    Move(cmd::move_cmd::MoveArgs),

    #[command(
        next_help_heading = "Membership",
        about = "Apply a membership counter delta",
        long_about = "Apply a signed (total, active) membership delta at a unit, propagating up its ancestor chain.",
        after_help = "EXAMPLES:\n    # One new active member\n    cnp delta --scope acme/np cn-w1 --total 1 --active 1\n\n    # A lapse: still a member, no longer active\n    cnp delta --scope acme/np cn-w1 --active -1"
    )]
    Delta(cmd::delta::DeltaArgs),

    #[command(
        next_help_heading = "Membership",
        about = "Transfer a membership between units",
        long_about = "Move one membership between two units: a paired decrement and increment in a single transaction.",
        after_help = "EXAMPLES:\n    # An active member moves wards\n    cnp transfer --scope acme/np --from cn-w1 --to cn-w2\n\n    # An inactive membership moves\n    cnp transfer --scope acme/np --from cn-w1 --to cn-w2 --inactive"
    )]
    Transfer(cmd::transfer::TransferArgs),

    #[command(
        next_help_heading = "Membership",
        about = "Toggle live delta propagation",
        long_about = "Switch per-event counter propagation on or off for a scope. Bulk imports run with it off, then reconcile.",
        after_help = "EXAMPLES:\n    # Quiesce before a bulk import\n    cnp propagation --scope acme/np off\n\n    # Re-enable after reconciling\n    cnp propagation --scope acme/np on"
    )]
    Propagation(cmd::propagation::PropagationArgs),

    #[command(
        next_help_heading = "Read",
        about = "Print a subtree outline",
        long_about = "Print a unit's subtree as an indented outline with cumulative counters.",
        after_help = "EXAMPLES:\n    # The whole scope from the root\n    cnp tree --scope acme/np\n\n    # Two levels under one province\n    cnp tree --scope acme/np --node cn-p1 --depth 2\n\n    # Emit machine-readable output\n    cnp tree --scope acme/np --json"
    )]
    Tree(cmd::tree::TreeArgs),

    #[command(
        next_help_heading = "Read",
        about = "Show a unit's chain of command",
        long_about = "Show a unit's ancestors from the root down to the unit itself.",
        after_help = "EXAMPLES:\n    # Lineage of a ward\n    cnp ancestors --scope acme/np cn-w1\n\n    # Emit machine-readable output\n    cnp ancestors --scope acme/np cn-w1 --json"
    )]
    Ancestors(cmd::ancestors::AncestorsArgs),

    #[command(
        next_help_heading = "Read",
        about = "Rank a level's units by membership",
        long_about = "Rank the active units of one tree level by active membership, then total, then id.",
        after_help = "EXAMPLES:\n    # Top ten districts\n    cnp leaderboard --scope acme/np --level 2\n\n    # Top three provinces\n    cnp leaderboard --scope acme/np --level 1 --limit 3"
    )]
    Leaderboard(cmd::leaderboard::LeaderboardArgs),

    #[command(
        next_help_heading = "Maintenance",
        about = "Settle counters against a tally feed",
        long_about = "Overwrite drifted counters and materialized paths from an authoritative per-node tally feed.",
        after_help = "EXAMPLES:\n    # Settle a scope after a bulk import\n    cnp reconcile --scope acme/np --tallies tallies.json\n\n    # Emit machine-readable output\n    cnp reconcile --scope acme/np --tallies tallies.json --json"
    )]
    Reconcile(cmd::reconcile::ReconcileArgs),

    #[command(
        next_help_heading = "Maintenance",
        about = "Scan a scope for structural damage",
        long_about = "Scan intervals, depths, paths, and staffing floors. Interval overlap marks the scope failed.",
        after_help = "EXAMPLES:\n    # Routine scan\n    cnp verify --scope acme/np\n\n    # Reset the integrity flag after repairs\n    cnp verify --scope acme/np --clear"
    )]
    Verify(cmd::verify::VerifyArgs),

    #[command(
        next_help_heading = "Maintenance",
        about = "Generate shell completion scripts",
        long_about = "Generate shell completion scripts for supported shells.",
        after_help = "EXAMPLES:\n    # Generate bash completions\n    cnp completions bash\n\n    # Generate zsh completions\n    cnp completions zsh"
    )]
    Completions(cmd::completions::CompletionsArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CANOPY_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "canopy=debug,info"
        } else {
            "canopy=info,warn"
        })
    });

    let format = env::var("CANOPY_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry.with(fmt::layer().json().with_ansi(false)).init();
        }
        _ => {
            registry.with(fmt::layer().compact()).init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let output = cli.output_mode();

    if let Commands::Completions(ref args) = cli.command {
        let mut command = Cli::command();
        return cmd::completions::run_completions(args.shell, &mut command);
    }

    let data_dir = cli.data_dir();
    tracing::debug!(data_dir = %data_dir.display(), "opening store");
    let engine = Engine::open(data_dir).map_err(|err| output::engine_failure(output, &err))?;

    match cli.command {
        Commands::Init(ref args) => cmd::init::run_init(args, &engine, output),
        Commands::Create(ref args) => cmd::create::run_create(args, &engine, output),
        Commands::Deactivate(ref args) => cmd::deactivate::run_deactivate(args, &engine, output),
        Commands::Move(ref args) => cmd::move_cmd::run_move(args, &engine, output),
        Commands::Delta(ref args) => cmd::delta::run_delta(args, &engine, output),
        Commands::Transfer(ref args) => cmd::transfer::run_transfer(args, &engine, output),
        Commands::Propagation(ref args) => cmd::propagation::run_propagation(args, &engine, output),
        Commands::Tree(ref args) => cmd::tree::run_tree(args, &engine, output),
        Commands::Ancestors(ref args) => cmd::ancestors::run_ancestors(args, &engine, output),
        Commands::Leaderboard(ref args) => cmd::leaderboard::run_leaderboard(args, &engine, output),
        Commands::Reconcile(ref args) => cmd::reconcile::run_reconcile(args, &engine, output),
        Commands::Verify(ref args) => cmd::verify::run_verify(args, &engine, output),
        Commands::Completions(_) => unreachable!("handled before the engine opens"),
    }
}
