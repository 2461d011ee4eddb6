use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::command_dispatcher::CommandSink;
use crate::dialogue_navigator::{
    DialogueNavigator, NavigationState, NavigatorConfig, NavigatorEffect, NavigatorError,
    StepOutcome, Transition,
};
use crate::speech_gateway::{
    RecognitionResult, SpeakRequest, SpeechGatewayError, SpeechRecognizer, SpeechSynthesizer,
};

const DEFAULT_MAX_CONSECUTIVE_TIMEOUTS: usize = 3;
const WATCHDOG_GATEWAY_NAME: &str = "watchdog";

/// Request to start a new dialogue for a spoken utterance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpeakSentence {
    pub text: String,
}

impl SpeakSentence {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Public struct `RuntimeConfig` used across voicenav components.
pub struct RuntimeConfig {
    pub navigator: NavigatorConfig,
    /// How long an outstanding recognition request may stay unanswered.
    /// `None` disables the watchdog.
    pub recognition_timeout: Option<Duration>,
    pub max_consecutive_timeouts: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            navigator: NavigatorConfig::default(),
            recognition_timeout: None,
            max_consecutive_timeouts: DEFAULT_MAX_CONSECUTIVE_TIMEOUTS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeSummary {
    pub dialogues_started: usize,
    pub results_handled: usize,
    pub stale_results_discarded: usize,
    pub repeats: usize,
    pub mismatches: usize,
    pub restarts: usize,
    pub dispatched: usize,
    pub watchdog_expiries: usize,
    pub errors: usize,
}

impl RuntimeSummary {
    fn record(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Started => self.dialogues_started = self.dialogues_started.saturating_add(1),
            StepOutcome::Repeated => self.repeats = self.repeats.saturating_add(1),
            StepOutcome::Mismatched => self.mismatches = self.mismatches.saturating_add(1),
            StepOutcome::Restarted => self.restarts = self.restarts.saturating_add(1),
            StepOutcome::Dispatched => self.dispatched = self.dispatched.saturating_add(1),
            StepOutcome::Confirming | StepOutcome::Descended => {}
        }
    }
}

/// Owns the single active dialogue and executes navigator effects against the
/// speech gateways and the command sink.
///
/// Every recognition request carries the current generation. Results tagged
/// with any other generation belong to an abandoned dialogue and are dropped.
pub struct DialogueRuntime<R: ?Sized, S: ?Sized, D: ?Sized> {
    navigator: DialogueNavigator,
    recognizer: Arc<R>,
    synthesizer: Arc<S>,
    sink: Arc<D>,
    config: RuntimeConfig,
    generation: u64,
    state: Option<NavigationState>,
    consecutive_timeouts: usize,
    watchdog_deadline: Option<Instant>,
    summary: RuntimeSummary,
}

impl<R, S, D> DialogueRuntime<R, S, D>
where
    R: SpeechRecognizer + ?Sized,
    S: SpeechSynthesizer + ?Sized,
    D: CommandSink + ?Sized,
{
    pub fn new(
        navigator: DialogueNavigator,
        recognizer: Arc<R>,
        synthesizer: Arc<S>,
        sink: Arc<D>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            navigator,
            recognizer,
            synthesizer,
            sink,
            config,
            generation: 0,
            state: None,
            consecutive_timeouts: 0,
            watchdog_deadline: None,
            summary: RuntimeSummary::default(),
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.generation
    }

    pub fn navigation_state(&self) -> Option<&NavigationState> {
        self.state.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_some()
    }

    pub fn summary(&self) -> &RuntimeSummary {
        &self.summary
    }

    /// Abandons any active dialogue and starts a new one for `event.text`.
    #[tracing::instrument(skip(self), fields(generation = self.generation + 1))]
    pub async fn handle_speak_sentence(
        &mut self,
        event: SpeakSentence,
    ) -> Result<StepOutcome, NavigatorError> {
        self.generation = self.generation.saturating_add(1);
        if self.state.take().is_some() {
            tracing::debug!("previous dialogue abandoned by new utterance");
        }
        self.consecutive_timeouts = 0;
        self.watchdog_deadline = None;

        let transition = match self.navigator.start(&event.text, self.generation) {
            Ok(transition) => transition,
            Err(error) => {
                self.summary.errors = self.summary.errors.saturating_add(1);
                tracing::warn!(utterance = event.text.as_str(), %error, "dialogue not started");
                return Err(error);
            }
        };
        let outcome = self.apply(transition).await?;
        tracing::info!(
            utterance = event.text.as_str(),
            generation = self.generation,
            "dialogue started"
        );
        Ok(outcome)
    }

    /// Advances the active dialogue. Returns `Ok(None)` when the result was
    /// discarded as stale.
    #[tracing::instrument(skip(self), fields(active_generation = self.generation))]
    pub async fn handle_recognition_result(
        &mut self,
        result: RecognitionResult,
    ) -> Result<Option<StepOutcome>, NavigatorError> {
        if self.state.is_none() {
            self.discard(&result, "no active dialogue");
            return Ok(None);
        }
        if result.generation != self.generation {
            self.discard(&result, "generation mismatch");
            return Ok(None);
        }
        let Some(state) = self.state.as_ref() else {
            return Ok(None);
        };

        self.summary.results_handled = self.summary.results_handled.saturating_add(1);
        self.consecutive_timeouts = 0;
        let transition = self.navigator.advance(state, &result.text);
        let outcome = self.apply(transition).await?;
        if outcome == StepOutcome::Mismatched {
            tracing::warn!(
                generation = self.generation,
                text = result.text.as_str(),
                "recognition result matched no pattern"
            );
        }
        Ok(Some(outcome))
    }

    /// Re-prompts the outstanding recognition request, or abandons the
    /// dialogue once too many expiries happened in a row.
    #[tracing::instrument(skip(self), fields(generation = self.generation))]
    pub async fn handle_watchdog_expiry(&mut self) -> Result<Option<StepOutcome>, NavigatorError> {
        self.watchdog_deadline = None;
        let Some(state) = self.state.as_ref() else {
            return Ok(None);
        };
        self.summary.watchdog_expiries = self.summary.watchdog_expiries.saturating_add(1);
        self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);

        if self.consecutive_timeouts >= self.config.max_consecutive_timeouts {
            let utterance = state.utterance.clone();
            self.state = None;
            self.summary.errors = self.summary.errors.saturating_add(1);
            let error = SpeechGatewayError::timeout(
                WATCHDOG_GATEWAY_NAME,
                format!(
                    "no recognition result after {} consecutive timeouts",
                    self.consecutive_timeouts
                ),
            );
            tracing::error!(utterance = utterance.as_str(), %error, "dialogue abandoned");
            return Err(NavigatorError::ServiceUnavailable(error));
        }

        tracing::warn!(
            consecutive_timeouts = self.consecutive_timeouts,
            grammar = state.previous_grammar.as_str(),
            "recognition timed out, repeating prompt"
        );
        let transition = self.navigator.repeat(state);
        self.apply(transition).await.map(Some)
    }

    /// Serves speak-sentence and recognition-result events one at a time until
    /// shutdown or until both channels close.
    pub async fn run(
        mut self,
        mut speak_rx: mpsc::Receiver<SpeakSentence>,
        mut result_rx: mpsc::Receiver<RecognitionResult>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> RuntimeSummary {
        let mut speak_open = true;
        let mut results_open = true;

        while speak_open || results_open {
            let deadline = self.watchdog_deadline;
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::debug!("dialogue runtime shutdown requested");
                    break;
                }
                event = speak_rx.recv(), if speak_open => match event {
                    Some(event) => {
                        if let Err(error) = self.handle_speak_sentence(event).await {
                            tracing::warn!(%error, "speak-sentence event failed");
                        }
                    }
                    None => speak_open = false,
                },
                result = result_rx.recv(), if results_open => match result {
                    Some(result) => {
                        if let Err(error) = self.handle_recognition_result(result).await {
                            tracing::warn!(%error, "recognition result failed");
                        }
                    }
                    None => results_open = false,
                },
                _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                    if let Err(error) = self.handle_watchdog_expiry().await {
                        tracing::warn!(%error, "watchdog expiry failed");
                    }
                }
            }
        }

        tracing::debug!(summary = ?self.summary, "dialogue runtime stopped");
        self.summary
    }

    async fn apply(&mut self, transition: Transition) -> Result<StepOutcome, NavigatorError> {
        let Transition {
            next,
            effects,
            outcome,
        } = transition;
        let mut requested_recognition = false;

        for effect in effects {
            let applied = match effect {
                NavigatorEffect::Speak(text) => self
                    .synthesizer
                    .speak(SpeakRequest::new(text))
                    .await
                    .map_err(NavigatorError::from),
                NavigatorEffect::RequestRecognition(request) => {
                    requested_recognition = true;
                    self.recognizer
                        .request_recognition(request)
                        .await
                        .map_err(NavigatorError::from)
                }
                NavigatorEffect::Dispatch(dispatch) => {
                    let result = self.sink.dispatch(&dispatch).await.map_err(|error| {
                        NavigatorError::Dispatch {
                            command_id: dispatch.command_id.clone(),
                            message: format!("{error:#}"),
                        }
                    });
                    if result.is_ok() {
                        tracing::info!(
                            command_id = dispatch.command_id.as_str(),
                            argument = dispatch.argument.as_str(),
                            generation = self.generation,
                            "command dispatched"
                        );
                    }
                    result
                }
            };
            if let Err(error) = applied {
                self.summary.errors = self.summary.errors.saturating_add(1);
                tracing::warn!(outcome = outcome.as_str(), %error, "transition effects failed");
                return Err(error);
            }
        }

        self.state = next;
        let awaiting_result = self.state.is_some() && requested_recognition;
        self.watchdog_deadline = match (awaiting_result, self.config.recognition_timeout) {
            (true, Some(timeout)) => Some(Instant::now() + timeout),
            _ => None,
        };
        self.summary.record(outcome);
        tracing::debug!(
            outcome = outcome.as_str(),
            active = self.state.is_some(),
            grammar = self
                .state
                .as_ref()
                .map(|state| state.current_grammar.as_str())
                .unwrap_or(""),
            "transition committed"
        );
        Ok(outcome)
    }

    fn discard(&mut self, result: &RecognitionResult, reason: &str) {
        self.summary.stale_results_discarded = self.summary.stale_results_discarded.saturating_add(1);
        tracing::warn!(
            result_generation = result.generation,
            active_generation = self.generation,
            reason = reason,
            "discarding stale recognition result"
        );
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
