use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use voicenav_runtime::{
    DialogueNavigator, DialogueRuntime, HttpSpeechGateway, HttpSpeechGatewayConfig,
    JsonlDispatchLog, NavigatorConfig, RecognitionResult, RuntimeSummary, SpeakSentence,
};
use voicenav_tree::load_command_tree;

use crate::cli_args::ConsoleArgs;
use crate::console_transport::{ConsoleDispatcher, ConsoleSpeechGateway};

const SPEAK_SENTENCE_PREFIX: &str = "say ";
const CONSOLE_CHANNEL_CAPACITY: usize = 16;
const RUNTIME_RECEIVE_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConsoleInput {
    SpeakSentence(String),
    RecognitionText(String),
    Blank,
}

/// `say <utterance>` starts a dialogue; any other line is heard speech.
pub(crate) fn parse_console_line(line: &str) -> ConsoleInput {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ConsoleInput::Blank;
    }
    match trimmed.strip_prefix(SPEAK_SENTENCE_PREFIX) {
        Some(utterance) if !utterance.trim().is_empty() => {
            ConsoleInput::SpeakSentence(utterance.trim().to_string())
        }
        _ => ConsoleInput::RecognitionText(trimmed.to_string()),
    }
}

/// Feeds console lines to the dialogue runtime and tags typed results with
/// the generation of the dialogue they answer.
///
/// The runtime opens a new generation for every speak-sentence, including
/// unknown utterances, so counting sent sentences tracks it exactly. Each
/// forwarded line is held until the runtime has taken it, which keeps the two
/// channels in typed order.
pub(crate) struct ConsoleFeed {
    speak_tx: mpsc::Sender<SpeakSentence>,
    result_tx: mpsc::Sender<RecognitionResult>,
    generation: u64,
}

impl ConsoleFeed {
    pub(crate) fn new(
        speak_tx: mpsc::Sender<SpeakSentence>,
        result_tx: mpsc::Sender<RecognitionResult>,
    ) -> Self {
        Self {
            speak_tx,
            result_tx,
            generation: 0,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) async fn forward_line(&mut self, line: &str) -> Result<()> {
        match parse_console_line(line) {
            ConsoleInput::Blank => Ok(()),
            ConsoleInput::SpeakSentence(utterance) => {
                self.speak_tx
                    .send(SpeakSentence::new(utterance))
                    .await
                    .context("dialogue runtime stopped")?;
                self.generation = self.generation.saturating_add(1);
                wait_until_taken(&self.speak_tx).await
            }
            ConsoleInput::RecognitionText(text) => {
                self.result_tx
                    .send(RecognitionResult::new(self.generation, text))
                    .await
                    .context("dialogue runtime stopped")?;
                wait_until_taken(&self.result_tx).await
            }
        }
    }
}

async fn wait_until_taken<T>(sender: &mpsc::Sender<T>) -> Result<()> {
    while sender.capacity() < sender.max_capacity() {
        if sender.is_closed() {
            bail!("dialogue runtime stopped");
        }
        tokio::time::sleep(RUNTIME_RECEIVE_POLL).await;
    }
    Ok(())
}

pub(crate) async fn run_console_session(
    args: &ConsoleArgs,
    navigator_config: NavigatorConfig,
) -> Result<RuntimeSummary> {
    let tree = load_command_tree(&args.command_tree, &navigator_config.confirmation_grammar)?;
    tracing::info!(
        utterances = tree.len(),
        path = %args.command_tree.display(),
        "command tree loaded"
    );

    let upstream = match args.speech_api_base.as_ref() {
        Some(api_base) => Some(
            HttpSpeechGateway::new(HttpSpeechGatewayConfig {
                api_base: api_base.clone(),
                api_key: args.speech_api_key.clone(),
                ..HttpSpeechGatewayConfig::default()
            })
            .context("failed to build HTTP speech gateway")?,
        ),
        None => None,
    };
    let gateway = Arc::new(ConsoleSpeechGateway::new(upstream));
    let dispatcher = Arc::new(ConsoleDispatcher::new(
        args.dispatch_log.as_ref().map(JsonlDispatchLog::new),
    ));
    let runtime_config = args.runtime_config(navigator_config.clone());
    let runtime = DialogueRuntime::new(
        DialogueNavigator::new(Arc::new(tree), navigator_config),
        Arc::clone(&gateway),
        gateway,
        dispatcher,
        runtime_config,
    );

    let (speak_tx, speak_rx) = mpsc::channel(CONSOLE_CHANNEL_CAPACITY);
    let (result_tx, result_rx) = mpsc::channel(CONSOLE_CHANNEL_CAPACITY);
    let (_shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let runtime_task = tokio::spawn(runtime.run(speak_rx, result_rx, shutdown_rx));

    let mut feed = ConsoleFeed::new(speak_tx, result_tx);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        feed.forward_line(&line).await?;
    }

    drop(feed);
    runtime_task
        .await
        .context("dialogue runtime task failed")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use tokio::sync::{mpsc, oneshot};
    use voicenav_runtime::{
        CommandDispatch, DialogueNavigator, DialogueRuntime, NavigatorConfig,
        RecordingDispatcher, RecordingSpeechGateway, RuntimeConfig,
    };
    use voicenav_tree::load_command_tree;

    use super::{parse_console_line, ConsoleFeed, ConsoleInput};

    fn home_tree_path() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../voicenav-tree/testdata/command-tree/home.json")
    }

    #[test]
    fn unit_parse_console_line_distinguishes_utterances_and_results() {
        assert_eq!(
            parse_console_line("say lights"),
            ConsoleInput::SpeakSentence("lights".to_string())
        );
        assert_eq!(
            parse_console_line("  turn_on_the_light \n"),
            ConsoleInput::RecognitionText("turn_on_the_light".to_string())
        );
        assert_eq!(parse_console_line("   "), ConsoleInput::Blank);
    }

    #[test]
    fn regression_bare_say_is_treated_as_recognition_text() {
        assert_eq!(
            parse_console_line("say"),
            ConsoleInput::RecognitionText("say".to_string())
        );
        assert_eq!(
            parse_console_line("say   "),
            ConsoleInput::RecognitionText("say".to_string())
        );
    }

    #[tokio::test]
    async fn regression_piped_lines_are_tagged_with_the_dialogue_they_answer() {
        let config = NavigatorConfig::default();
        let tree = load_command_tree(&home_tree_path(), &config.confirmation_grammar)
            .expect("load tree");
        let gateway = Arc::new(RecordingSpeechGateway::new());
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let runtime = DialogueRuntime::new(
            DialogueNavigator::new(Arc::new(tree), config),
            Arc::clone(&gateway),
            Arc::clone(&gateway),
            Arc::clone(&dispatcher),
            RuntimeConfig::default(),
        );
        let (speak_tx, speak_rx) = mpsc::channel(4);
        let (result_tx, result_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(runtime.run(speak_rx, result_rx, shutdown_rx));

        let mut feed = ConsoleFeed::new(speak_tx, result_tx);
        let script = [
            "say lights",
            "turn_on_the_light",
            "yes",
            "",
            "say music",
            "play_jazz",
            "yes",
            "say garage",
        ];
        for line in script {
            feed.forward_line(line).await.expect("forward line");
        }
        assert_eq!(feed.generation(), 3);
        drop(feed);
        let summary = handle.await.expect("runtime task");

        assert_eq!(
            dispatcher.dispatched().await,
            vec![
                CommandDispatch::new("turn_on", "the light"),
                CommandDispatch::new("play_music", "jazz"),
            ]
        );
        assert_eq!(summary.stale_results_discarded, 0);
        assert_eq!(summary.dispatched, 2);
        assert_eq!(summary.results_handled, 4);
    }
}
