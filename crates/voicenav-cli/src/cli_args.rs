use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use voicenav_runtime::{NavigatorConfig, RuntimeConfig};
use voicenav_tree::DEFAULT_CONFIRMATION_GRAMMAR;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_grammar_name(value: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("grammar name cannot be empty".to_string());
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Parser)]
#[command(
    name = "voicenav",
    about = "Voice command dialogue navigator over an utterance command tree",
    version
)]
/// Public struct `Cli` used across voicenav components.
pub struct Cli {
    #[arg(
        long = "confirmation-grammar",
        env = "VOICENAV_CONFIRMATION_GRAMMAR",
        default_value = DEFAULT_CONFIRMATION_GRAMMAR,
        value_parser = parse_grammar_name,
        global = true,
        help = "Recognition grammar used for yes/no confirmation prompts"
    )]
    pub confirmation_grammar: String,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
/// Enumerates supported `CliCommand` values.
pub enum CliCommand {
    /// Replay a dialogue fixture against a command tree.
    Replay(ReplayArgs),
    /// Run an interactive dialogue over stdin/stdout.
    Console(ConsoleArgs),
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    #[arg(
        long = "command-tree",
        env = "VOICENAV_COMMAND_TREE",
        help = "Path to the utterance command tree JSON file"
    )]
    pub command_tree: PathBuf,

    #[arg(long, help = "Path to the dialogue replay fixture JSON file")]
    pub fixture: PathBuf,

    #[arg(
        long = "state-dir",
        env = "VOICENAV_STATE_DIR",
        default_value = ".voicenav/replay",
        help = "Directory for dispatches.jsonl and replay-events.jsonl"
    )]
    pub state_dir: PathBuf,
}

#[derive(Debug, Args)]
pub struct ConsoleArgs {
    #[arg(
        long = "command-tree",
        env = "VOICENAV_COMMAND_TREE",
        help = "Path to the utterance command tree JSON file"
    )]
    pub command_tree: PathBuf,

    #[arg(
        long = "speech-api-base",
        env = "VOICENAV_SPEECH_API_BASE",
        help = "Base URL of an HTTP speech service; prompts and recognition requests are only printed when unset"
    )]
    pub speech_api_base: Option<String>,

    #[arg(
        long = "speech-api-key",
        env = "VOICENAV_SPEECH_API_KEY",
        hide_env_values = true,
        help = "Bearer token for the HTTP speech service"
    )]
    pub speech_api_key: Option<String>,

    #[arg(
        long = "dispatch-log",
        env = "VOICENAV_DISPATCH_LOG",
        help = "Optional JSONL file receiving every dispatched command"
    )]
    pub dispatch_log: Option<PathBuf>,

    #[arg(
        long = "recognition-timeout-ms",
        env = "VOICENAV_RECOGNITION_TIMEOUT_MS",
        value_parser = parse_positive_u64,
        help = "Repeat the last prompt when no recognition result arrives within this many milliseconds"
    )]
    pub recognition_timeout_ms: Option<u64>,

    #[arg(
        long = "max-consecutive-timeouts",
        env = "VOICENAV_MAX_CONSECUTIVE_TIMEOUTS",
        default_value_t = 3,
        value_parser = parse_positive_usize,
        help = "Abandon the dialogue after this many recognition timeouts in a row"
    )]
    pub max_consecutive_timeouts: usize,
}

impl Cli {
    pub fn navigator_config(&self) -> NavigatorConfig {
        NavigatorConfig {
            confirmation_grammar: self.confirmation_grammar.clone(),
            ..NavigatorConfig::default()
        }
    }
}

impl ConsoleArgs {
    pub fn runtime_config(&self, navigator: NavigatorConfig) -> RuntimeConfig {
        RuntimeConfig {
            navigator,
            recognition_timeout: self.recognition_timeout_ms.map(Duration::from_millis),
            max_consecutive_timeouts: self.max_consecutive_timeouts,
        }
    }
}
