mod commands;

use cellindex_core::domain::IndexError;
use clap::Parser;
use tracing_subscriber::EnvFilter;

pub fn run_from_env() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match run(args) {
        Ok(code) => code,
        Err(error) => {
            let index_error = error.as_index_error();
            eprintln!("{}", index_error.diagnostic_line());
            if let Some(summary_line) = index_error.fatal_exit_line() {
                eprintln!("{}", summary_line);
            }
            index_error.exit_code()
        }
    }
}

pub fn run<I, S>(args: I) -> Result<i32, CliError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let full_args = std::iter::once("cellindex".to_string())
        .chain(args.into_iter().map(Into::into))
        .collect::<Vec<_>>();
    parse_and_dispatch(full_args)
}

fn parse_and_dispatch(args: Vec<String>) -> Result<i32, CliError> {
    match Cli::try_parse_from(&args) {
        Ok(cli) => {
            init_tracing(cli.verbose);
            dispatch_parsed(cli.command)
        }
        Err(err) => match err.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                print!("{}", err);
                Ok(0)
            }
            _ => Err(CliError::Usage(err.to_string())),
        },
    }
}

/// `RUST_LOG` wins over `--verbose` when both are given.
fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[derive(Parser)]
#[command(name = "cellindex", about = "Powder-pattern indexing and unit-cell refinement")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// Search the enabled Bravais lattices for cells that index the peaks
    Index(commands::IndexArgs),
    /// Refine the selected cell against the current peak assignment
    Refine(commands::RefineArgs),
    /// Select a candidate cell and index the peaks with it
    Select(commands::SelectArgs),
    /// Print the reflections generated by the working cell
    Reflections(commands::ReflectionsArgs),
    /// Rewrite a document in the current schema
    Migrate(commands::MigrateArgs),
    /// Re-filter stored subgroups by unique-atom count
    SubgroupsFilter(commands::SubgroupsFilterArgs),
    /// List stored subgroups by conjugacy class or step through the kept ones
    Subgroups(commands::SubgroupsArgs),
}

fn dispatch_parsed(command: CliCommand) -> Result<i32, CliError> {
    match command {
        CliCommand::Index(args) => commands::run_index_command(args),
        CliCommand::Refine(args) => commands::run_refine_command(args),
        CliCommand::Select(args) => commands::run_select_command(args),
        CliCommand::Reflections(args) => commands::run_reflections_command(args),
        CliCommand::Migrate(args) => commands::run_migrate_command(args),
        CliCommand::SubgroupsFilter(args) => commands::run_subgroups_filter_command(args),
        CliCommand::Subgroups(args) => commands::run_subgroups_command(args),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Compute(IndexError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CliError {
    fn as_index_error(&self) -> IndexError {
        match self {
            Self::Usage(message) => IndexError::input("INPUT.CLI_USAGE", message.clone()),
            Self::Compute(error) => error.clone(),
            Self::Internal(error) => IndexError::internal("INTERNAL.CLI", format!("{error:#}")),
        }
    }
}

impl From<IndexError> for CliError {
    fn from(error: IndexError) -> Self {
        Self::Compute(error)
    }
}
