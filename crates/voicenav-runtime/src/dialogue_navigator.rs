//! Recognition/confirmation state machine.
//!
//! The navigator never performs I/O. Every step takes the current
//! [`NavigationState`] by reference and returns a [`Transition`]: the state to
//! commit plus the ordered effects (prompts, recognition requests, dispatches)
//! the runtime must carry out first.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use voicenav_tree::{
    parse_command_tree, CommandId, CommandTree, CommandTreeError, ConfirmationAnswer, Node,
    PatternMap, PatternMatch, UtteranceRoot, DEFAULT_CONFIRMATION_GRAMMAR,
};

use crate::command_dispatcher::CommandDispatch;
use crate::speech_gateway::{RecognitionRequest, SpeechGatewayError};

pub const DEFAULT_SAY_AGAIN_SENTINEL: &str = "please say again";
pub const DEFAULT_CONFIRMATION_PROMPT_TEMPLATE: &str =
    "You said {text}. Am I correct? Please answer yes or no.";
pub const DEFAULT_RESTART_PROMPT: &str = "OK. Please say command again.";

/// Enumerates supported `NavigatorError` values.
#[derive(Debug, Error)]
pub enum NavigatorError {
    #[error("utterance '{0}' is not declared in the command tree")]
    UnknownUtterance(String),
    #[error(transparent)]
    Configuration(#[from] CommandTreeError),
    #[error("speech service unavailable: {0}")]
    ServiceUnavailable(SpeechGatewayError),
    #[error("speech service rejected the request: {0}")]
    SpeechRequestRejected(SpeechGatewayError),
    #[error("command dispatch failed for '{command_id}': {message}")]
    Dispatch { command_id: String, message: String },
}

impl From<SpeechGatewayError> for NavigatorError {
    /// Timeouts and unreachable backends are availability failures; anything
    /// else the gateway refused is a rejected request.
    fn from(error: SpeechGatewayError) -> Self {
        if error.is_service_unavailable() {
            Self::ServiceUnavailable(error)
        } else {
            Self::SpeechRequestRejected(error)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NavigatorConfig {
    pub confirmation_grammar: String,
    pub say_again_sentinel: String,
    pub confirmation_prompt_template: String,
    pub restart_prompt: String,
}

impl Default for NavigatorConfig {
    fn default() -> Self {
        Self {
            confirmation_grammar: DEFAULT_CONFIRMATION_GRAMMAR.to_string(),
            say_again_sentinel: DEFAULT_SAY_AGAIN_SENTINEL.to_string(),
            confirmation_prompt_template: DEFAULT_CONFIRMATION_PROMPT_TEMPLATE.to_string(),
            restart_prompt: DEFAULT_RESTART_PROMPT.to_string(),
        }
    }
}

impl NavigatorConfig {
    pub fn render_confirmation_prompt(&self, text: &str) -> String {
        self.confirmation_prompt_template.replace("{text}", text)
    }
}

/// Underscores become spaces and ASCII letters are lowercased.
pub fn normalize_recognition_text(raw: &str) -> String {
    raw.replace('_', " ").to_ascii_lowercase()
}

/// What answering the confirmation prompt leads to.
#[derive(Debug, Clone)]
pub enum ConfirmationOutcome {
    /// Dispatch the command; an empty id restarts from the utterance root.
    Command(CommandId),
    /// Keep navigating into a nested pattern map.
    Descend(Arc<PatternMap>),
}

#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub matched_text: String,
    pub pattern: String,
    /// Grammar of the pattern level the match happened at.
    pub pattern_grammar: String,
    pub yes: ConfirmationOutcome,
    pub no: ConfirmationOutcome,
}

impl PendingConfirmation {
    fn from_match(found: &PatternMatch<'_>, text: &str, pattern_grammar: &str) -> Self {
        let restart = ConfirmationOutcome::Command(CommandId::default());
        let (yes, no) = match found.node {
            Node::Confirmation(map) => (
                ConfirmationOutcome::Command(map.yes.clone()),
                ConfirmationOutcome::Command(map.no.clone()),
            ),
            Node::Leaf(command) => (ConfirmationOutcome::Command(command.clone()), restart),
            Node::Branch(patterns) => (ConfirmationOutcome::Descend(Arc::clone(patterns)), restart),
        };
        Self {
            matched_text: text.to_string(),
            pattern: found.pattern.to_string(),
            pattern_grammar: pattern_grammar.to_string(),
            yes,
            no,
        }
    }

    pub fn outcome(&self, answer: ConfirmationAnswer) -> &ConfirmationOutcome {
        match answer {
            ConfirmationAnswer::Yes => &self.yes,
            ConfirmationAnswer::No => &self.no,
        }
    }
}

#[derive(Debug, Clone)]
pub enum NavigationCursor {
    Patterns(Arc<PatternMap>),
    Confirming(PendingConfirmation),
}

impl NavigationCursor {
    pub fn is_confirming(&self) -> bool {
        matches!(self, Self::Confirming(_))
    }

    pub fn patterns(&self) -> Option<&Arc<PatternMap>> {
        match self {
            Self::Patterns(patterns) => Some(patterns),
            Self::Confirming(_) => None,
        }
    }
}

/// Everything one active dialogue knows. Created on a speak-sentence event,
/// discarded on dispatch.
#[derive(Debug, Clone)]
pub struct NavigationState {
    pub utterance: String,
    pub generation: u64,
    pub root_grammar: String,
    pub root_patterns: Arc<PatternMap>,
    pub current_grammar: String,
    pub cursor: NavigationCursor,
    pub previous_spoken_text: String,
    pub previous_grammar: String,
    pub pending_argument: String,
}

impl NavigationState {
    fn at_root(root: &UtteranceRoot, generation: u64) -> Self {
        Self {
            utterance: root.utterance.clone(),
            generation,
            root_grammar: root.grammar.clone(),
            root_patterns: Arc::clone(&root.patterns),
            current_grammar: root.grammar.clone(),
            cursor: NavigationCursor::Patterns(Arc::clone(&root.patterns)),
            previous_spoken_text: root.utterance.clone(),
            previous_grammar: root.grammar.clone(),
            pending_argument: String::new(),
        }
    }

    fn reset_to_root(&self, spoken: String) -> Self {
        Self {
            utterance: self.utterance.clone(),
            generation: self.generation,
            root_grammar: self.root_grammar.clone(),
            root_patterns: Arc::clone(&self.root_patterns),
            current_grammar: self.root_grammar.clone(),
            cursor: NavigationCursor::Patterns(Arc::clone(&self.root_patterns)),
            previous_spoken_text: spoken,
            previous_grammar: self.root_grammar.clone(),
            pending_argument: String::new(),
        }
    }

    pub fn is_confirming(&self) -> bool {
        self.cursor.is_confirming()
    }

    fn request(&self, grammar: &str) -> RecognitionRequest {
        RecognitionRequest::new(grammar, self.generation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigatorEffect {
    Speak(String),
    RequestRecognition(RecognitionRequest),
    Dispatch(CommandDispatch),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Started,
    Repeated,
    Confirming,
    Dispatched,
    Restarted,
    Descended,
    Mismatched,
}

impl StepOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Repeated => "repeated",
            Self::Confirming => "confirming",
            Self::Dispatched => "dispatched",
            Self::Restarted => "restarted",
            Self::Descended => "descended",
            Self::Mismatched => "mismatched",
        }
    }
}

/// One navigator step. `next == None` ends the dialogue.
#[derive(Debug, Clone)]
pub struct Transition {
    pub next: Option<NavigationState>,
    pub effects: Vec<NavigatorEffect>,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone)]
pub struct DialogueNavigator {
    tree: Arc<CommandTree>,
    config: NavigatorConfig,
}

impl DialogueNavigator {
    pub fn new(tree: Arc<CommandTree>, config: NavigatorConfig) -> Self {
        Self { tree, config }
    }

    pub fn from_json(raw: &str, config: NavigatorConfig) -> Result<Self, NavigatorError> {
        let tree = parse_command_tree(raw, &config.confirmation_grammar)?;
        Ok(Self::new(Arc::new(tree), config))
    }

    pub fn tree(&self) -> &CommandTree {
        &self.tree
    }

    pub fn config(&self) -> &NavigatorConfig {
        &self.config
    }

    /// Fresh dialogue for an utterance: one recognition request on the root grammar.
    pub fn start(&self, utterance: &str, generation: u64) -> Result<Transition, NavigatorError> {
        let root = self
            .tree
            .root(utterance)
            .ok_or_else(|| NavigatorError::UnknownUtterance(utterance.to_string()))?;
        let state = NavigationState::at_root(root, generation);
        tracing::debug!(
            utterance = utterance,
            generation = generation,
            grammar = state.root_grammar.as_str(),
            "dialogue started"
        );
        Ok(Transition {
            effects: vec![NavigatorEffect::RequestRecognition(
                state.request(&state.root_grammar),
            )],
            next: Some(state),
            outcome: StepOutcome::Started,
        })
    }

    pub fn advance(&self, state: &NavigationState, raw_text: &str) -> Transition {
        let text = normalize_recognition_text(raw_text);
        if text == self.config.say_again_sentinel {
            return self.repeat(state);
        }

        match &state.cursor {
            NavigationCursor::Confirming(pending) => match ConfirmationAnswer::parse(&text) {
                Some(answer) => self.resolve_confirmation(state, pending, answer),
                None => self.mismatch(state, &text),
            },
            NavigationCursor::Patterns(patterns) => {
                if text.trim().is_empty() {
                    return self.mismatch(state, &text);
                }
                match patterns.first_match(&text) {
                    Some(found) => self.confirm_match(state, &text, &found),
                    None => self.mismatch(state, &text),
                }
            }
        }
    }

    /// Re-speaks the last prompt and re-issues the last recognition request.
    pub fn repeat(&self, state: &NavigationState) -> Transition {
        let mut effects = Vec::with_capacity(2);
        if !state.previous_spoken_text.trim().is_empty() {
            effects.push(NavigatorEffect::Speak(state.previous_spoken_text.clone()));
        }
        effects.push(NavigatorEffect::RequestRecognition(
            state.request(&state.previous_grammar),
        ));
        tracing::debug!(
            generation = state.generation,
            grammar = state.previous_grammar.as_str(),
            "repeating last prompt"
        );
        Transition {
            next: Some(state.clone()),
            effects,
            outcome: StepOutcome::Repeated,
        }
    }

    fn confirm_match(
        &self,
        state: &NavigationState,
        text: &str,
        found: &PatternMatch<'_>,
    ) -> Transition {
        let confirmation_grammar = self.config.confirmation_grammar.as_str();
        let prompt = self.config.render_confirmation_prompt(text);
        let pending = PendingConfirmation::from_match(found, text, &state.current_grammar);

        let mut next = state.clone();
        next.pending_argument = found.remainder.clone();
        next.cursor = NavigationCursor::Confirming(pending);
        next.current_grammar = confirmation_grammar.to_string();
        next.previous_spoken_text = prompt.clone();
        next.previous_grammar = confirmation_grammar.to_string();

        tracing::debug!(
            generation = state.generation,
            pattern = found.pattern,
            node = found.node.kind(),
            argument = next.pending_argument.as_str(),
            "pattern matched, awaiting confirmation"
        );
        Transition {
            effects: vec![
                NavigatorEffect::Speak(prompt),
                NavigatorEffect::RequestRecognition(next.request(confirmation_grammar)),
            ],
            next: Some(next),
            outcome: StepOutcome::Confirming,
        }
    }

    fn resolve_confirmation(
        &self,
        state: &NavigationState,
        pending: &PendingConfirmation,
        answer: ConfirmationAnswer,
    ) -> Transition {
        match pending.outcome(answer) {
            ConfirmationOutcome::Command(command) if !command.is_empty() => {
                let dispatch =
                    CommandDispatch::new(command.as_str(), state.pending_argument.as_str());
                tracing::debug!(
                    generation = state.generation,
                    answer = answer.as_str(),
                    command_id = command.as_str(),
                    "confirmation resolved to command"
                );
                Transition {
                    next: None,
                    effects: vec![NavigatorEffect::Dispatch(dispatch)],
                    outcome: StepOutcome::Dispatched,
                }
            }
            ConfirmationOutcome::Command(_) => {
                let prompt = self.config.restart_prompt.clone();
                let next = state.reset_to_root(prompt.clone());
                tracing::debug!(
                    generation = state.generation,
                    answer = answer.as_str(),
                    grammar = next.root_grammar.as_str(),
                    "confirmation declined, restarting from root"
                );
                Transition {
                    effects: vec![
                        NavigatorEffect::Speak(prompt),
                        NavigatorEffect::RequestRecognition(next.request(&next.root_grammar)),
                    ],
                    next: Some(next),
                    outcome: StepOutcome::Restarted,
                }
            }
            ConfirmationOutcome::Descend(patterns) => {
                let grammar = patterns
                    .grammar
                    .clone()
                    .unwrap_or_else(|| pending.pattern_grammar.clone());
                let mut next = state.clone();
                next.cursor = NavigationCursor::Patterns(Arc::clone(patterns));
                next.current_grammar = grammar.clone();
                next.previous_grammar = grammar.clone();
                // Say-again at the new level repeats the words that led here.
                next.previous_spoken_text = pending.matched_text.clone();
                tracing::debug!(
                    generation = state.generation,
                    grammar = grammar.as_str(),
                    patterns = patterns.len(),
                    "confirmation accepted, descending"
                );
                Transition {
                    effects: vec![NavigatorEffect::RequestRecognition(next.request(&grammar))],
                    next: Some(next),
                    outcome: StepOutcome::Descended,
                }
            }
        }
    }

    fn mismatch(&self, state: &NavigationState, text: &str) -> Transition {
        let mut next = state.clone();
        next.previous_grammar = state.current_grammar.clone();
        tracing::debug!(
            generation = state.generation,
            grammar = state.current_grammar.as_str(),
            text = text,
            "no pattern matched, retrying at current depth"
        );
        Transition {
            effects: vec![NavigatorEffect::RequestRecognition(
                next.request(&state.current_grammar),
            )],
            next: Some(next),
            outcome: StepOutcome::Mismatched,
        }
    }
}
