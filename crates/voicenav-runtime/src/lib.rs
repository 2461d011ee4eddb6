//! Dialogue runtime for the voice navigator.
//!
//! Drives the recognition/confirmation state machine over an utterance
//! command tree, talks to speech services through gateway traits, and hands
//! confirmed commands to downstream executors.

pub mod command_dispatcher;
pub mod dialogue_navigator;
pub mod dialogue_replay;
pub mod dialogue_runtime;
pub mod speech_gateway;

pub use command_dispatcher::{
    CommandDispatch, CommandSink, JsonlDispatchLog, RecordingDispatcher, TopicDispatcher,
};
pub use dialogue_navigator::{
    normalize_recognition_text, ConfirmationOutcome, DialogueNavigator, NavigationCursor,
    NavigationState, NavigatorConfig, NavigatorEffect, NavigatorError, PendingConfirmation,
    StepOutcome, Transition,
};
pub use dialogue_replay::{
    load_dialogue_replay_fixture, parse_dialogue_replay_fixture, replay_dialogue_fixture,
    run_dialogue_replay, validate_dialogue_replay_fixture, DialogueReplayConfig,
    DialogueReplayFixture, DialogueReplaySummary, DialogueReplayTurn, DialogueReplayTurnReport,
    DIALOGUE_REPLAY_SCHEMA_VERSION,
};
pub use dialogue_runtime::{DialogueRuntime, RuntimeConfig, RuntimeSummary, SpeakSentence};
pub use speech_gateway::{
    HttpSpeechGateway, HttpSpeechGatewayConfig, RecognitionRequest, RecognitionResult,
    RecordingSpeechGateway, SpeakRequest, SpeechGatewayError, SpeechGatewayErrorCode,
    SpeechGatewayResult, SpeechRecognizer, SpeechSynthesizer,
};
