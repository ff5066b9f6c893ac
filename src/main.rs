use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use relay::commands::config::ConfigCommand;
use relay::commands::doctor::DoctorArgs;
use relay::commands::plan::PlanArgs;
use relay::commands::run::RunArgs;
use relay::commands::sweep::SweepArgs;
use relay::{commands, error, telemetry};

#[derive(Debug, Parser)]
#[command(
    name = "relay",
    version,
    about = "Spec-writer, implementer, and reviewer agents coordinating over an issue tracker"
)]
struct Cli {
    /// Config file (default: .relay.toml or .relay.json in the current directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one role's poll loop
    Run(RunArgs),
    /// Force-unlock one role's stale in-progress items and exit
    Sweep(SweepArgs),
    /// Turn a user story into a ticket awaiting spec review
    Plan(PlanArgs),
    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Check the CLIs, tracker authentication, and repository access
    Doctor(DoctorArgs),
    /// Print the JSON Schema for .relay.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Sweep(_) => "sweep",
            Self::Plan(_) => "plan",
            Self::Config { .. } => "config",
            Self::Doctor(_) => "doctor",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    telemetry::init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match &cli.command {
        Commands::Run(args) => args.execute(config),
        Commands::Sweep(args) => args.execute(config),
        Commands::Plan(args) => args.execute(config),
        Commands::Config { command } => command.execute(config),
        Commands::Doctor(args) => args.execute(config),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
