use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use voicenav_runtime::{
    CommandDispatch, DialogueNavigator, DialogueRuntime, JsonlDispatchLog, NavigatorConfig,
    RecognitionRequest, RecognitionResult, RecordingDispatcher, RecordingSpeechGateway,
    RuntimeConfig, RuntimeSummary, SpeakRequest, SpeakSentence, SpeechGatewayError,
    SpeechGatewayResult, SpeechRecognizer, SpeechSynthesizer, StepOutcome,
};
use voicenav_tree::load_command_tree;

static WORKSPACE_COUNTER: AtomicU64 = AtomicU64::new(1);

const HOME_TREE: &str = r#"{
  "lights": ["lights_sphinx", {
    "turn on ": {"yes": "turn_on", "no": ""},
    "turn off ": {"yes": "turn_off", "no": ""},
    "dim ": ["dimmer_sphinx", {
      "a little": {"yes": "dim_low", "no": ""},
      "all the way": {"yes": "dim_off", "no": ""}
    }]
  }],
  "music": ["music_sphinx", {
    "play ": {"yes": "play_music", "no": ""},
    "stop": "stop_music"
  }]
}"#;

/// Answers every recognition request with the next scripted transcription,
/// tagged with the generation of the request.
struct ScriptedSpeechService {
    answers: AsyncMutex<VecDeque<String>>,
    requests: AsyncMutex<Vec<RecognitionRequest>>,
    spoken: AsyncMutex<Vec<String>>,
    results: mpsc::Sender<RecognitionResult>,
}

impl ScriptedSpeechService {
    fn new(answers: &[&str], results: mpsc::Sender<RecognitionResult>) -> Self {
        Self {
            answers: AsyncMutex::new(answers.iter().map(|answer| answer.to_string()).collect()),
            requests: AsyncMutex::new(Vec::new()),
            spoken: AsyncMutex::new(Vec::new()),
            results,
        }
    }

    async fn grammars(&self) -> Vec<String> {
        self.requests
            .lock()
            .await
            .iter()
            .map(|request| request.grammar.clone())
            .collect()
    }

    async fn spoken(&self) -> Vec<String> {
        self.spoken.lock().await.clone()
    }
}

#[async_trait]
impl SpeechRecognizer for ScriptedSpeechService {
    async fn request_recognition(&self, request: RecognitionRequest) -> SpeechGatewayResult<()> {
        self.requests.lock().await.push(request.clone());
        let Some(answer) = self.answers.lock().await.pop_front() else {
            return Ok(());
        };
        self.results
            .try_send(RecognitionResult::new(request.generation, answer))
            .map_err(|error| SpeechGatewayError::backend_unavailable("scripted", error.to_string()))
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSpeechService {
    async fn speak(&self, request: SpeakRequest) -> SpeechGatewayResult<()> {
        self.spoken.lock().await.push(request.text);
        Ok(())
    }
}

struct IsolatedWorkspace {
    root: PathBuf,
}

impl IsolatedWorkspace {
    fn new(label: &str) -> Self {
        let tick = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let count = WORKSPACE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "voicenav-{label}-{}-{tick}-{count}",
            std::process::id()
        ));
        fs::create_dir_all(&root).expect("must create isolated workspace root");
        Self { root }
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn write_tree(&self) -> PathBuf {
        let path = self.root.join("command-tree.json");
        fs::write(&path, HOME_TREE).expect("write command tree");
        path
    }
}

impl Drop for IsolatedWorkspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn home_navigator(workspace: &IsolatedWorkspace) -> DialogueNavigator {
    let tree = load_command_tree(&workspace.write_tree(), "yes_no_sphinx").expect("load tree");
    DialogueNavigator::new(Arc::new(tree), NavigatorConfig::default())
}

fn read_dispatch_log(path: &Path) -> Vec<CommandDispatch> {
    let Ok(raw) = fs::read_to_string(path) else {
        return Vec::new();
    };
    raw.lines()
        .map(|line| {
            let value: Value = serde_json::from_str(line).expect("dispatch line json");
            CommandDispatch::new(
                value["command_id"].as_str().expect("command_id"),
                value["argument"].as_str().expect("argument"),
            )
        })
        .collect()
}

struct ScriptedRun {
    dispatches: Vec<CommandDispatch>,
    grammars: Vec<String>,
    spoken: Vec<String>,
    summary: RuntimeSummary,
}

async fn run_scripted_dialogue(label: &str, utterance: &str, answers: &[&str]) -> ScriptedRun {
    let workspace = IsolatedWorkspace::new(label);
    let log_path = workspace.root().join("dispatches.jsonl");
    let (result_tx, result_rx) = mpsc::channel(64);
    let (speak_tx, speak_rx) = mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = Arc::new(ScriptedSpeechService::new(answers, result_tx));
    let runtime = DialogueRuntime::new(
        home_navigator(&workspace),
        Arc::clone(&service),
        Arc::clone(&service),
        Arc::new(JsonlDispatchLog::new(&log_path)),
        RuntimeConfig::default(),
    );
    let handle = tokio::spawn(runtime.run(speak_rx, result_rx, shutdown_rx));

    speak_tx
        .send(SpeakSentence::new(utterance))
        .await
        .expect("send utterance");
    tokio::time::timeout(Duration::from_secs(5), async {
        while read_dispatch_log(&log_path).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("dialogue should dispatch a command");

    shutdown_tx.send(()).expect("shutdown");
    let summary = handle.await.expect("runtime task");
    ScriptedRun {
        dispatches: read_dispatch_log(&log_path),
        grammars: service.grammars().await,
        spoken: service.spoken().await,
        summary,
    }
}

#[tokio::test]
async fn integration_confirmed_command_reaches_dispatch_log() {
    let run = run_scripted_dialogue("confirmed", "lights", &["turn_on_the_light", "yes"]).await;

    assert_eq!(run.dispatches, vec![CommandDispatch::new("turn_on", "the light")]);
    assert_eq!(run.grammars, vec!["lights_sphinx", "yes_no_sphinx"]);
    assert_eq!(
        run.spoken,
        vec!["You said turn on the light. Am I correct? Please answer yes or no."]
    );
    assert_eq!(run.summary.dispatched, 1);
    assert_eq!(run.summary.results_handled, 2);
}

#[tokio::test]
async fn integration_mismatch_retries_nested_grammar_before_dispatch() {
    let run = run_scripted_dialogue(
        "nested-mismatch",
        "lights",
        &["dim_the_hall", "yes", "unrelated_gibberish", "all_the_way", "yes"],
    )
    .await;

    assert_eq!(run.dispatches, vec![CommandDispatch::new("dim_off", "")]);
    assert_eq!(
        run.grammars,
        vec![
            "lights_sphinx",
            "yes_no_sphinx",
            "dimmer_sphinx",
            "dimmer_sphinx",
            "yes_no_sphinx",
        ]
    );
    assert_eq!(run.summary.mismatches, 1);
}

#[tokio::test]
async fn integration_please_say_again_repeats_confirmation_prompt() {
    let run = run_scripted_dialogue(
        "say-again",
        "music",
        &["stop", "please_say_again", "yes"],
    )
    .await;

    assert_eq!(run.dispatches, vec![CommandDispatch::new("stop_music", "")]);
    assert_eq!(
        run.grammars,
        vec!["music_sphinx", "yes_no_sphinx", "yes_no_sphinx"]
    );
    let prompt = "You said stop. Am I correct? Please answer yes or no.".to_string();
    assert_eq!(run.spoken, vec![prompt.clone(), prompt]);
    assert_eq!(run.summary.repeats, 1);
}

#[tokio::test]
async fn integration_declined_confirmation_restarts_from_root() {
    let run = run_scripted_dialogue(
        "declined",
        "music",
        &["play_jazz", "no", "play_blues", "yes"],
    )
    .await;

    assert_eq!(run.dispatches, vec![CommandDispatch::new("play_music", "blues")]);
    assert_eq!(
        run.grammars,
        vec!["music_sphinx", "yes_no_sphinx", "music_sphinx", "yes_no_sphinx"]
    );
    assert_eq!(run.spoken[1], "OK. Please say command again.");
    assert_eq!(run.summary.restarts, 1);
}

#[tokio::test]
async fn regression_results_from_superseded_dialogue_are_ignored() {
    let workspace = IsolatedWorkspace::new("stale");
    let gateway = Arc::new(RecordingSpeechGateway::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let mut runtime = DialogueRuntime::new(
        home_navigator(&workspace),
        Arc::clone(&gateway),
        Arc::clone(&gateway),
        Arc::clone(&dispatcher),
        RuntimeConfig::default(),
    );

    runtime
        .handle_speak_sentence(SpeakSentence::new("lights"))
        .await
        .expect("lights");
    let lights_generation = runtime.current_generation();
    runtime
        .handle_recognition_result(RecognitionResult::new(lights_generation, "turn_off_the_fan"))
        .await
        .expect("confirming");
    runtime
        .handle_speak_sentence(SpeakSentence::new("music"))
        .await
        .expect("music");

    let stale = runtime
        .handle_recognition_result(RecognitionResult::new(lights_generation, "yes"))
        .await
        .expect("stale result");
    assert_eq!(stale, None);
    assert!(dispatcher.dispatched().await.is_empty());

    let music_generation = runtime.current_generation();
    assert_ne!(music_generation, lights_generation);
    let outcome = runtime
        .handle_recognition_result(RecognitionResult::new(music_generation, "stop"))
        .await
        .expect("music match");
    assert_eq!(outcome, Some(StepOutcome::Confirming));
    runtime
        .handle_recognition_result(RecognitionResult::new(music_generation, "yes"))
        .await
        .expect("music confirm");

    assert_eq!(
        dispatcher.dispatched().await,
        vec![CommandDispatch::new("stop_music", "")]
    );
    assert_eq!(runtime.summary().stale_results_discarded, 1);
}
