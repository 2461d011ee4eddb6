use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::dialogue_replay::current_unix_timestamp_ms;

/// A fully resolved, confirmed command handed to the action executors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandDispatch {
    pub command_id: String,
    #[serde(default)]
    pub argument: String,
}

impl CommandDispatch {
    pub fn new(command_id: impl Into<String>, argument: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            argument: argument.into(),
        }
    }
}

#[async_trait]
/// Trait contract for downstream command executors.
pub trait CommandSink: Send + Sync {
    async fn dispatch(&self, dispatch: &CommandDispatch) -> Result<()>;
}

/// Routes each command to the topic registered under its identifier.
///
/// Topics receive only the argument string. Commands without a topic go to
/// the fallback sender when one is configured and fail otherwise.
#[derive(Debug, Clone, Default)]
pub struct TopicDispatcher {
    topics: HashMap<String, mpsc::Sender<String>>,
    fallback: Option<mpsc::Sender<CommandDispatch>>,
}

impl TopicDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topic(mut self, command_id: impl Into<String>, sender: mpsc::Sender<String>) -> Self {
        self.topics.insert(command_id.into(), sender);
        self
    }

    pub fn with_fallback(mut self, sender: mpsc::Sender<CommandDispatch>) -> Self {
        self.fallback = Some(sender);
        self
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

#[async_trait]
impl CommandSink for TopicDispatcher {
    async fn dispatch(&self, dispatch: &CommandDispatch) -> Result<()> {
        if let Some(topic) = self.topics.get(dispatch.command_id.as_str()) {
            return topic
                .send(dispatch.argument.clone())
                .await
                .map_err(|_| anyhow!("executor for '{}' is no longer listening", dispatch.command_id));
        }
        let Some(fallback) = self.fallback.as_ref() else {
            bail!("no executor registered for command '{}'", dispatch.command_id);
        };
        fallback
            .send(dispatch.clone())
            .await
            .map_err(|_| anyhow!("fallback executor is no longer listening"))
    }
}

/// Appends one JSON line per dispatched command.
#[derive(Debug)]
pub struct JsonlDispatchLog {
    path: PathBuf,
    write_lock: AsyncMutex<()>,
}

impl JsonlDispatchLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: AsyncMutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CommandSink for JsonlDispatchLog {
    async fn dispatch(&self, dispatch: &CommandDispatch) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let line = serde_json::to_string(&json!({
            "timestamp_unix_ms": current_unix_timestamp_ms(),
            "command_id": dispatch.command_id,
            "argument": dispatch.argument,
        }))
        .context("failed to encode command dispatch")?;
        append_line(&self.path, &line)
    }
}

/// Keeps dispatched commands in memory.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    dispatched: AsyncMutex<Vec<CommandDispatch>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn dispatched(&self) -> Vec<CommandDispatch> {
        self.dispatched.lock().await.clone()
    }
}

#[async_trait]
impl CommandSink for RecordingDispatcher {
    async fn dispatch(&self, dispatch: &CommandDispatch) -> Result<()> {
        self.dispatched.lock().await.push(dispatch.clone());
        Ok(())
    }
}

pub(crate) fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append to {}", path.display()))
}
