use anyhow::Result;
use async_trait::async_trait;
use voicenav_runtime::{
    CommandDispatch, CommandSink, HttpSpeechGateway, JsonlDispatchLog, RecognitionRequest,
    SpeakRequest, SpeechGatewayResult, SpeechRecognizer, SpeechSynthesizer,
};

/// Prints prompts and recognition requests, optionally forwarding them to an
/// HTTP speech service.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConsoleSpeechGateway {
    upstream: Option<HttpSpeechGateway>,
}

impl ConsoleSpeechGateway {
    pub(crate) fn new(upstream: Option<HttpSpeechGateway>) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl SpeechRecognizer for ConsoleSpeechGateway {
    async fn request_recognition(&self, request: RecognitionRequest) -> SpeechGatewayResult<()> {
        if let Some(upstream) = self.upstream.as_ref() {
            upstream.request_recognition(request.clone()).await?;
        }
        println!(
            "listen: grammar={} generation={}",
            request.grammar, request.generation
        );
        Ok(())
    }
}

#[async_trait]
impl SpeechSynthesizer for ConsoleSpeechGateway {
    async fn speak(&self, request: SpeakRequest) -> SpeechGatewayResult<()> {
        if let Some(upstream) = self.upstream.as_ref() {
            upstream.speak(request.clone()).await?;
        }
        println!("speak: {}", request.text);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct ConsoleDispatcher {
    log: Option<JsonlDispatchLog>,
}

impl ConsoleDispatcher {
    pub(crate) fn new(log: Option<JsonlDispatchLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl CommandSink for ConsoleDispatcher {
    async fn dispatch(&self, dispatch: &CommandDispatch) -> Result<()> {
        if let Some(log) = self.log.as_ref() {
            log.dispatch(dispatch).await?;
        }
        println!(
            "dispatch: command_id={} argument={}",
            dispatch.command_id, dispatch.argument
        );
        Ok(())
    }
}
