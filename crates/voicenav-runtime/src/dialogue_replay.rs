use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use voicenav_tree::load_command_tree;

use crate::command_dispatcher::{
    append_line, CommandDispatch, CommandSink, JsonlDispatchLog, RecordingDispatcher,
};
use crate::dialogue_navigator::{DialogueNavigator, NavigatorConfig, StepOutcome};
use crate::dialogue_runtime::{DialogueRuntime, RuntimeConfig, RuntimeSummary, SpeakSentence};
use crate::speech_gateway::{RecognitionResult, RecordingSpeechGateway};

pub const DIALOGUE_REPLAY_SCHEMA_VERSION: u32 = 1;
const DIALOGUE_REPLAY_EVENTS_LOG_FILE: &str = "replay-events.jsonl";
const DIALOGUE_REPLAY_DISPATCH_LOG_FILE: &str = "dispatches.jsonl";

pub(crate) fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One speak-sentence event followed by the recognition results heard for it.
pub struct DialogueReplayTurn {
    pub utterance: String,
    #[serde(default)]
    pub results: Vec<String>,
    #[serde(default)]
    pub expected_dispatches: Option<Vec<CommandDispatch>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DialogueReplayFixture {
    pub schema_version: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub turns: Vec<DialogueReplayTurn>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Public struct `DialogueReplayConfig` used across voicenav components.
pub struct DialogueReplayConfig {
    pub command_tree_path: PathBuf,
    pub fixture_path: PathBuf,
    pub state_dir: PathBuf,
    pub navigator: NavigatorConfig,
}

impl DialogueReplayConfig {
    pub fn events_log_path(&self) -> PathBuf {
        self.state_dir.join(DIALOGUE_REPLAY_EVENTS_LOG_FILE)
    }

    pub fn dispatch_log_path(&self) -> PathBuf {
        self.state_dir.join(DIALOGUE_REPLAY_DISPATCH_LOG_FILE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DialogueReplayTurnReport {
    pub utterance: String,
    pub generation: u64,
    pub outcomes: Vec<StepOutcome>,
    pub dispatches: Vec<CommandDispatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expectation_met: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DialogueReplaySummary {
    pub fixture: String,
    pub turns: usize,
    pub results_sent: usize,
    pub prompts_spoken: usize,
    pub recognition_requests: usize,
    pub expectation_failures: usize,
    pub dispatches: Vec<CommandDispatch>,
    pub runtime: RuntimeSummary,
    pub turn_reports: Vec<DialogueReplayTurnReport>,
}

#[derive(Debug, Serialize)]
struct DialogueReplayCycleReport<'a> {
    timestamp_unix_ms: u64,
    fixture: &'a str,
    turns: usize,
    results_sent: usize,
    dispatched: usize,
    expectation_failures: usize,
    runtime: &'a RuntimeSummary,
    turn_reports: &'a [DialogueReplayTurnReport],
}

pub fn parse_dialogue_replay_fixture(raw: &str) -> Result<DialogueReplayFixture> {
    let fixture = serde_json::from_str::<DialogueReplayFixture>(raw)
        .context("failed to parse dialogue replay fixture")?;
    validate_dialogue_replay_fixture(&fixture)?;
    Ok(fixture)
}

pub fn load_dialogue_replay_fixture(path: &Path) -> Result<DialogueReplayFixture> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    parse_dialogue_replay_fixture(&raw)
        .with_context(|| format!("invalid fixture {}", path.display()))
}

pub fn validate_dialogue_replay_fixture(fixture: &DialogueReplayFixture) -> Result<()> {
    if fixture.schema_version != DIALOGUE_REPLAY_SCHEMA_VERSION {
        bail!(
            "unsupported dialogue replay schema version {} (expected {})",
            fixture.schema_version,
            DIALOGUE_REPLAY_SCHEMA_VERSION
        );
    }
    if fixture.name.trim().is_empty() {
        bail!("fixture name cannot be empty");
    }
    if fixture.turns.is_empty() {
        bail!("fixture must include at least one turn");
    }
    for (index, turn) in fixture.turns.iter().enumerate() {
        if turn.utterance.trim().is_empty() {
            bail!("fixture turn {} has an empty utterance", index);
        }
    }
    Ok(())
}

/// Drives one fixture through a `DialogueRuntime` backed by recording
/// gateways. Each confirmed command is also forwarded to `sink`.
pub async fn replay_dialogue_fixture<D>(
    navigator: DialogueNavigator,
    fixture: &DialogueReplayFixture,
    sink: Arc<D>,
) -> Result<DialogueReplaySummary>
where
    D: CommandSink + ?Sized,
{
    let gateway = Arc::new(RecordingSpeechGateway::new());
    let recorder = Arc::new(RecordingDispatcher::new());
    let config = RuntimeConfig {
        navigator: navigator.config().clone(),
        ..RuntimeConfig::default()
    };
    let mut runtime = DialogueRuntime::new(
        navigator,
        Arc::clone(&gateway),
        Arc::clone(&gateway),
        Arc::clone(&recorder),
        config,
    );

    let mut summary = DialogueReplaySummary {
        fixture: fixture.name.clone(),
        ..DialogueReplaySummary::default()
    };

    for turn in &fixture.turns {
        let dispatched_before = recorder.dispatched().await.len();
        let mut report = DialogueReplayTurnReport {
            utterance: turn.utterance.clone(),
            generation: 0,
            outcomes: Vec::new(),
            dispatches: Vec::new(),
            error: None,
            expectation_met: None,
        };

        match runtime
            .handle_speak_sentence(SpeakSentence::new(turn.utterance.as_str()))
            .await
        {
            Ok(outcome) => report.outcomes.push(outcome),
            Err(error) => report.error = Some(error.to_string()),
        }
        report.generation = runtime.current_generation();

        for text in &turn.results {
            summary.results_sent = summary.results_sent.saturating_add(1);
            let result = RecognitionResult::new(report.generation, text.as_str());
            match runtime.handle_recognition_result(result).await {
                Ok(Some(outcome)) => report.outcomes.push(outcome),
                Ok(None) => {}
                Err(error) => report.error = Some(error.to_string()),
            }
        }

        report.dispatches = recorder
            .dispatched()
            .await
            .into_iter()
            .skip(dispatched_before)
            .collect();
        for dispatch in &report.dispatches {
            sink.dispatch(dispatch)
                .await
                .with_context(|| format!("failed to record dispatch '{}'", dispatch.command_id))?;
        }

        if let Some(expected) = turn.expected_dispatches.as_ref() {
            let met = expected == &report.dispatches;
            if !met {
                summary.expectation_failures = summary.expectation_failures.saturating_add(1);
                tracing::warn!(
                    fixture = fixture.name.as_str(),
                    utterance = turn.utterance.as_str(),
                    expected = ?expected,
                    actual = ?report.dispatches,
                    "replay turn dispatch expectation not met"
                );
            }
            report.expectation_met = Some(met);
        }

        summary.turns = summary.turns.saturating_add(1);
        summary.dispatches.extend(report.dispatches.iter().cloned());
        summary.turn_reports.push(report);
    }

    summary.prompts_spoken = gateway.spoken().await.len();
    summary.recognition_requests = gateway.recognition_requests().await.len();
    summary.runtime = runtime.summary().clone();
    Ok(summary)
}

pub async fn run_dialogue_replay(config: DialogueReplayConfig) -> Result<DialogueReplaySummary> {
    let tree = load_command_tree(
        &config.command_tree_path,
        &config.navigator.confirmation_grammar,
    )?;
    let fixture = load_dialogue_replay_fixture(&config.fixture_path)?;
    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("failed to create {}", config.state_dir.display()))?;

    let navigator = DialogueNavigator::new(Arc::new(tree), config.navigator.clone());
    let dispatch_log = Arc::new(JsonlDispatchLog::new(config.dispatch_log_path()));
    let summary = replay_dialogue_fixture(navigator, &fixture, dispatch_log).await?;
    append_dialogue_replay_cycle_report(&config.events_log_path(), &summary)?;

    println!(
        "dialogue replay summary: fixture={} turns={} results={} dispatched={} repeats={} mismatches={} restarts={} stale_discarded={} errors={} expectation_failures={}",
        summary.fixture,
        summary.turns,
        summary.results_sent,
        summary.dispatches.len(),
        summary.runtime.repeats,
        summary.runtime.mismatches,
        summary.runtime.restarts,
        summary.runtime.stale_results_discarded,
        summary.runtime.errors,
        summary.expectation_failures
    );

    if summary.expectation_failures > 0 {
        bail!(
            "dialogue replay '{}' failed {} dispatch expectation(s)",
            summary.fixture,
            summary.expectation_failures
        );
    }
    Ok(summary)
}

fn append_dialogue_replay_cycle_report(path: &Path, summary: &DialogueReplaySummary) -> Result<()> {
    let payload = DialogueReplayCycleReport {
        timestamp_unix_ms: current_unix_timestamp_ms(),
        fixture: &summary.fixture,
        turns: summary.turns,
        results_sent: summary.results_sent,
        dispatched: summary.dispatches.len(),
        expectation_failures: summary.expectation_failures,
        runtime: &summary.runtime,
        turn_reports: &summary.turn_reports,
    };
    let line = serde_json::to_string(&payload).context("serialize dialogue replay report")?;
    append_line(path, &line)
}
