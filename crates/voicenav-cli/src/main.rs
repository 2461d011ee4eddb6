mod bootstrap_helpers;
mod cli_args;
mod console_session;
mod console_transport;

use anyhow::Result;
use clap::Parser;
use voicenav_runtime::{run_dialogue_replay, DialogueReplayConfig};

use crate::bootstrap_helpers::init_tracing;
use crate::cli_args::{Cli, CliCommand};
use crate::console_session::run_console_session;

async fn run_cli(cli: Cli) -> Result<()> {
    let navigator = cli.navigator_config();
    match cli.command {
        CliCommand::Replay(args) => {
            run_dialogue_replay(DialogueReplayConfig {
                command_tree_path: args.command_tree,
                fixture_path: args.fixture,
                state_dir: args.state_dir,
                navigator,
            })
            .await?;
        }
        CliCommand::Console(args) => {
            let summary = run_console_session(&args, navigator).await?;
            println!(
                "console summary: dialogues_started={} results_handled={} dispatched={} repeats={} mismatches={} restarts={} stale_discarded={} watchdog_expiries={} errors={}",
                summary.dialogues_started,
                summary.results_handled,
                summary.dispatched,
                summary.repeats,
                summary.mismatches,
                summary.restarts,
                summary.stale_results_discarded,
                summary.watchdog_expiries,
                summary.errors
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_cli(cli).await
}
