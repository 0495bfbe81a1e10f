//! Cadence CLI entry point.
//!
//! Binary name: `cadence`
//!
//! Parses CLI arguments, sets up tracing, opens the file-backed stores under
//! the data directory, then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cadence_observe::tracing_setup::{
    TracingOptions, filter_for_verbosity, init_tracing, shutdown_tracing,
};
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = TracingOptions {
        default_filter: filter_for_verbosity(cli.verbose, cli.quiet).to_string(),
        json: false,
        otel: cli.otel,
    };
    if let Err(e) = init_tracing(&options) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        // Completions and definition-only commands don't need app state
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "cadence", &mut std::io::stdout());
            Ok(())
        }
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, cli.json).await
        }
        Commands::State { action } => {
            let state = AppState::init(cli.data_dir).await?;
            cli::state::handle_state_command(action, &state, cli.json).await
        }
        Commands::Epic { action } => {
            let state = AppState::init(cli.data_dir).await?;
            cli::epic::handle_epic_command(action, &state, cli.json).await
        }
    }
}
