use std::process::ExitCode;

use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use cli::{
    handlers::{ProblemArgs, handle_plan, handle_policy, handle_run},
    logger,
};
use console::style;

#[derive(Parser)]
#[command(name = "flashplan_cli", version, about = "Inspect and run attention plans")]
struct Cli {
    /// Log plan decisions (-v) or per-launch details (-vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the launch plan chosen for a problem
    Plan {
        #[command(flatten)]
        problem: ProblemArgs,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a problem on the CPU mainloop with random inputs
    Run {
        #[command(flatten)]
        problem: ProblemArgs,
        /// Also run the backward pass
        #[arg(long)]
        backward: bool,
        /// Accumulate backward gradients in a fixed order
        #[arg(long)]
        deterministic: bool,
        /// Seed of the random inputs
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the engine policy, the default one unless a file is given
    Policy {
        /// JSON policy file to validate and print
        path: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logger::install(cli.verbose);

    let result = match cli.command {
        Some(Commands::Plan {
            problem,
            json,
        }) => handle_plan(&problem, json),
        Some(Commands::Run {
            problem,
            backward,
            deterministic,
            seed,
            json,
        }) => handle_run(&problem, backward, deterministic, seed, json),
        Some(Commands::Policy {
            path,
        }) => handle_policy(path),
        None => {
            let mut cmd = Cli::command();
            cmd.print_help().map_err(Into::into)
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{} {error}", style("error:").red().bold());
            ExitCode::FAILURE
        },
    }
}
