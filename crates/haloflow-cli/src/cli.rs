use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    author = "The haloflow developers",
    version,
    about = "haloflow - domain-decomposed rigid-body molecular dynamics in the NPT and NPH ensembles.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log more detail: -v info, -vv debug, -vvv trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Silence all log output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Also write the log, with thread names and ids, to this file
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Size of the shared worker pool used by the per-rank force and thermo loops
    /// (all logical cores when omitted).
    #[arg(short = 'j', long, global = true, value_name = "NUM")]
    pub threads: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a lattice of rigid bodies and integrate it over a grid of ranks.
    Run(RunArgs),
    /// Print the rank grid, neighbor counts and communication stages of a configuration.
    Decompose(DecomposeArgs),
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the simulation configuration file in TOML format.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub config: PathBuf,

    /// Override the number of integration steps from the config file.
    #[arg(short = 'n', long, value_name = "INT")]
    pub steps: Option<u64>,

    /// Override the maximum number of communication stages (1 to 3).
    #[arg(long, value_name = "INT")]
    pub max_stages: Option<u32>,

    /// Write sampled thermodynamic quantities to this CSV file.
    #[arg(long, value_name = "PATH")]
    pub thermo_log: Option<PathBuf>,

    /// Write the integrator's extended-system variables to this TOML file at the end.
    #[arg(long, value_name = "PATH")]
    pub checkpoint: Option<PathBuf>,

    /// Resume the integrator's extended-system variables from a checkpoint file.
    #[arg(long, value_name = "PATH")]
    pub restart: Option<PathBuf>,

    /// Override one config file entry by its dotted kebab-case key, e.g.
    /// `-S integrator.dt=0.002`. Repeatable.
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

/// Arguments for the `decompose` subcommand.
#[derive(Args, Debug)]
pub struct DecomposeArgs {
    /// Path to the simulation configuration file in TOML format.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub config: PathBuf,

    /// Override the maximum number of communication stages (1 to 3).
    #[arg(long, value_name = "INT")]
    pub max_stages: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_arguments_parse_with_overrides() {
        let cli = Cli::parse_from([
            "haloflow",
            "-vv",
            "run",
            "--config",
            "sim.toml",
            "-n",
            "500",
            "--max-stages",
            "2",
            "-S",
            "integrator.dt=0.002",
            "--thermo-log",
            "thermo.csv",
        ]);
        assert_eq!(cli.verbose, 2);
        let Commands::Run(args) = cli.command else {
            panic!("expected the run subcommand");
        };
        assert_eq!(args.steps, Some(500));
        assert_eq!(args.max_stages, Some(2));
        assert_eq!(args.set_values, vec!["integrator.dt=0.002".to_string()]);
        assert_eq!(args.thermo_log, Some(PathBuf::from("thermo.csv")));
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        let result = Cli::try_parse_from(["haloflow", "-q", "-v", "decompose", "-c", "sim.toml"]);
        assert!(result.is_err());
    }
}
