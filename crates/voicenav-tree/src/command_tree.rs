use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_CONFIRMATION_GRAMMAR: &str = "yes_no_sphinx";

const CONFIRMATION_YES_KEY: &str = "yes";
const CONFIRMATION_NO_KEY: &str = "no";

/// Identifier of the downstream action a confirmed command resolves to.
///
/// An empty identifier is a valid leaf meaning "no action": reaching it
/// restarts the dialogue from the utterance root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Enumerates supported `CommandTreeError` values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandTreeError {
    #[error("failed to parse command tree json: {0}")]
    InvalidJson(String),
    #[error("command tree must be a json object keyed by utterance")]
    NotAnObject,
    #[error("command tree must declare at least one utterance")]
    Empty,
    #[error("malformed command tree node at '{path}': {reason}")]
    MalformedNode { path: String, reason: String },
    #[error("invalid pattern '{pattern}' at '{path}': {reason}")]
    InvalidPattern {
        path: String,
        pattern: String,
        reason: String,
    },
}

impl CommandTreeError {
    fn malformed(path: &str, reason: impl Into<String>) -> Self {
        Self::MalformedNode {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationAnswer {
    Yes,
    No,
}

impl ConfirmationAnswer {
    /// Accepts only the exact normalized answers `yes` and `no`.
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            CONFIRMATION_YES_KEY => Some(Self::Yes),
            CONFIRMATION_NO_KEY => Some(Self::No),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => CONFIRMATION_YES_KEY,
            Self::No => CONFIRMATION_NO_KEY,
        }
    }
}

/// Two-entry `{yes, no}` map reachable only through the confirmation grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationMap {
    pub yes: CommandId,
    pub no: CommandId,
}

impl ConfirmationMap {
    pub fn command_for(&self, answer: ConfirmationAnswer) -> &CommandId {
        match answer {
            ConfirmationAnswer::Yes => &self.yes,
            ConfirmationAnswer::No => &self.no,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Branch(Arc<PatternMap>),
    Leaf(CommandId),
    Confirmation(Arc<ConfirmationMap>),
}

impl Node {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Branch(_) => "branch",
            Self::Leaf(_) => "leaf",
            Self::Confirmation(_) => "confirmation",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatternEntry {
    pub source: String,
    pub regex: Regex,
    pub node: Node,
}

/// Ordered pattern set; entries keep their declaration order from the source
/// document and are scanned first-match-wins.
#[derive(Debug, Clone)]
pub struct PatternMap {
    pub grammar: Option<String>,
    pub entries: Vec<PatternEntry>,
}

/// Result of the first pattern that matched a normalized recognition text.
#[derive(Debug, Clone)]
pub struct PatternMatch<'a> {
    pub pattern: &'a str,
    pub matched: String,
    pub remainder: String,
    pub node: &'a Node,
}

impl PatternMap {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.source.as_str())
    }

    pub fn first_match(&self, text: &str) -> Option<PatternMatch<'_>> {
        self.entries.iter().find_map(|entry| {
            let found = entry.regex.find(text)?;
            Some(PatternMatch {
                pattern: entry.source.as_str(),
                matched: found.as_str().to_string(),
                remainder: remove_match(text, found.start(), found.end()),
                node: &entry.node,
            })
        })
    }
}

#[derive(Debug, Clone)]
pub struct UtteranceRoot {
    pub utterance: String,
    pub grammar: String,
    pub patterns: Arc<PatternMap>,
}

/// Immutable utterance-keyed command tree, built once at startup.
#[derive(Debug, Clone)]
pub struct CommandTree {
    confirmation_grammar: String,
    roots: IndexMap<String, UtteranceRoot>,
}

impl CommandTree {
    pub fn root(&self, utterance: &str) -> Option<&UtteranceRoot> {
        self.roots.get(utterance)
    }

    pub fn utterances(&self) -> impl Iterator<Item = &str> {
        self.roots.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn confirmation_grammar(&self) -> &str {
        self.confirmation_grammar.as_str()
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawNode {
    Command(String),
    Map(IndexMap<String, RawNode>),
    List(Vec<RawNode>),
    Unsupported(Value),
}

pub fn parse_command_tree(
    raw: &str,
    confirmation_grammar: &str,
) -> std::result::Result<CommandTree, CommandTreeError> {
    let document = serde_json::from_str::<RawNode>(raw)
        .map_err(|error| CommandTreeError::InvalidJson(error.to_string()))?;
    let RawNode::Map(entries) = document else {
        return Err(CommandTreeError::NotAnObject);
    };
    if entries.is_empty() {
        return Err(CommandTreeError::Empty);
    }

    let builder = TreeBuilder {
        confirmation_grammar,
    };
    let mut roots = IndexMap::with_capacity(entries.len());
    for (utterance, value) in &entries {
        let root = builder.build_root(utterance, value)?;
        roots.insert(utterance.clone(), root);
    }

    tracing::debug!(
        utterances = roots.len(),
        confirmation_grammar = confirmation_grammar,
        "command tree parsed"
    );
    Ok(CommandTree {
        confirmation_grammar: confirmation_grammar.to_string(),
        roots,
    })
}

pub fn load_command_tree(path: &Path, confirmation_grammar: &str) -> Result<CommandTree> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read command tree {}", path.display()))?;
    parse_command_tree(&raw, confirmation_grammar)
        .with_context(|| format!("invalid command tree {}", path.display()))
}

struct TreeBuilder<'a> {
    confirmation_grammar: &'a str,
}

impl TreeBuilder<'_> {
    fn build_root(
        &self,
        utterance: &str,
        value: &RawNode,
    ) -> std::result::Result<UtteranceRoot, CommandTreeError> {
        if utterance.trim().is_empty() {
            return Err(CommandTreeError::malformed(
                "<root>",
                "utterance keys cannot be blank",
            ));
        }
        let Some((grammar, patterns)) = grammar_pair(value) else {
            return Err(CommandTreeError::malformed(
                utterance,
                "utterance entries must be a [grammar, patterns] pair",
            ));
        };
        let grammar = self.validate_grammar(utterance, grammar)?;
        let patterns = self.build_pattern_map(utterance, patterns, None)?;
        Ok(UtteranceRoot {
            utterance: utterance.to_string(),
            grammar,
            patterns: Arc::new(patterns),
        })
    }

    fn validate_grammar(
        &self,
        path: &str,
        grammar: &str,
    ) -> std::result::Result<String, CommandTreeError> {
        let grammar = grammar.trim();
        if grammar.is_empty() {
            return Err(CommandTreeError::malformed(path, "grammar name cannot be blank"));
        }
        if grammar == self.confirmation_grammar {
            return Err(CommandTreeError::malformed(
                path,
                format!(
                    "grammar '{grammar}' is reserved for the confirmation sub-dialogue"
                ),
            ));
        }
        Ok(grammar.to_string())
    }

    fn build_pattern_map(
        &self,
        path: &str,
        entries: &IndexMap<String, RawNode>,
        grammar: Option<String>,
    ) -> std::result::Result<PatternMap, CommandTreeError> {
        if entries.is_empty() {
            return Err(CommandTreeError::malformed(path, "pattern map cannot be empty"));
        }

        let mut built = Vec::with_capacity(entries.len());
        for (pattern, value) in entries {
            let entry_path = format!("{path}/{pattern}");
            if pattern.trim().is_empty() {
                return Err(CommandTreeError::InvalidPattern {
                    path: entry_path,
                    pattern: pattern.clone(),
                    reason: "pattern cannot be blank".to_string(),
                });
            }
            if is_confirmation_key(pattern) {
                return Err(CommandTreeError::malformed(
                    &entry_path,
                    "yes/no keys must appear together and alone in a confirmation map",
                ));
            }
            let regex = Regex::new(pattern).map_err(|error| CommandTreeError::InvalidPattern {
                path: entry_path.clone(),
                pattern: pattern.clone(),
                reason: error.to_string(),
            })?;
            let node = self.build_node(&entry_path, value)?;
            built.push(PatternEntry {
                source: pattern.clone(),
                regex,
                node,
            });
        }

        Ok(PatternMap {
            grammar,
            entries: built,
        })
    }

    fn build_node(&self, path: &str, value: &RawNode) -> std::result::Result<Node, CommandTreeError> {
        match value {
            RawNode::Command(command) => Ok(Node::Leaf(CommandId::new(command.trim()))),
            RawNode::Map(entries) if entries.keys().any(|key| is_confirmation_key(key)) => {
                build_confirmation(path, entries).map(|map| Node::Confirmation(Arc::new(map)))
            }
            RawNode::Map(entries) => self
                .build_pattern_map(path, entries, None)
                .map(|map| Node::Branch(Arc::new(map))),
            RawNode::List(_) => {
                if let Some((grammar, patterns)) = grammar_pair(value) {
                    let grammar = self.validate_grammar(path, grammar)?;
                    return self
                        .build_pattern_map(path, patterns, Some(grammar))
                        .map(|map| Node::Branch(Arc::new(map)));
                }
                legacy_command(path, value).map(Node::Leaf)
            }
            RawNode::Unsupported(other) => Err(CommandTreeError::malformed(
                path,
                format!("unsupported node value {other}"),
            )),
        }
    }
}

fn build_confirmation(
    path: &str,
    entries: &IndexMap<String, RawNode>,
) -> std::result::Result<ConfirmationMap, CommandTreeError> {
    let (Some(yes), Some(no)) = (
        entries.get(CONFIRMATION_YES_KEY),
        entries.get(CONFIRMATION_NO_KEY),
    ) else {
        return Err(CommandTreeError::malformed(
            path,
            "confirmation map must declare both 'yes' and 'no'",
        ));
    };
    if entries.len() != 2 {
        return Err(CommandTreeError::malformed(
            path,
            "confirmation map cannot mix yes/no with other patterns",
        ));
    }
    Ok(ConfirmationMap {
        yes: confirmation_leaf(&format!("{path}/{CONFIRMATION_YES_KEY}"), yes)?,
        no: confirmation_leaf(&format!("{path}/{CONFIRMATION_NO_KEY}"), no)?,
    })
}

fn confirmation_leaf(path: &str, value: &RawNode) -> std::result::Result<CommandId, CommandTreeError> {
    match value {
        RawNode::Command(command) => Ok(CommandId::new(command.trim())),
        RawNode::List(_) => legacy_command(path, value),
        _ => Err(CommandTreeError::malformed(
            path,
            "confirmation answers must bind to a command identifier",
        )),
    }
}

// `["turn_on", "arg", ...]`: only the first element names the command.
fn legacy_command(path: &str, value: &RawNode) -> std::result::Result<CommandId, CommandTreeError> {
    let RawNode::List(items) = value else {
        return Err(CommandTreeError::malformed(path, "expected a command list"));
    };
    let mut commands = Vec::with_capacity(items.len());
    for item in items {
        match item {
            RawNode::Command(command) => commands.push(command.trim()),
            _ => {
                return Err(CommandTreeError::malformed(
                    path,
                    "lists must be a [grammar, patterns] pair or a list of strings",
                ))
            }
        }
    }
    commands
        .first()
        .map(|command| CommandId::new(*command))
        .ok_or_else(|| CommandTreeError::malformed(path, "command list cannot be empty"))
}

fn grammar_pair(value: &RawNode) -> Option<(&str, &IndexMap<String, RawNode>)> {
    let RawNode::List(items) = value else {
        return None;
    };
    match items.as_slice() {
        [RawNode::Command(grammar), RawNode::Map(patterns)] => Some((grammar.as_str(), patterns)),
        _ => None,
    }
}

fn is_confirmation_key(key: &str) -> bool {
    key == CONFIRMATION_YES_KEY || key == CONFIRMATION_NO_KEY
}

fn remove_match(text: &str, start: usize, end: usize) -> String {
    let before = text.get(..start).unwrap_or_default();
    let after = text.get(end..).unwrap_or_default();
    format!("{before} {after}")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
