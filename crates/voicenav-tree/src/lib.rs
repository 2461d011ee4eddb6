//! Command tree model for the voice navigator.
//!
//! Loads the utterance-keyed command tree once at startup, validates every
//! node eagerly, and exposes the ordered pattern maps the dialogue navigator
//! scans against recognition results.

pub mod command_tree;

pub use command_tree::{
    load_command_tree, parse_command_tree, CommandId, CommandTree, CommandTreeError,
    ConfirmationAnswer, ConfirmationMap, Node, PatternEntry, PatternMap, PatternMatch,
    UtteranceRoot, DEFAULT_CONFIRMATION_GRAMMAR,
};
