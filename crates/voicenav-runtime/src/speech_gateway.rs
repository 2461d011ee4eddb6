use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;

const DEFAULT_GATEWAY_TIMEOUT_MS: u64 = 15_000;
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `SpeechGatewayErrorCode` values.
pub enum SpeechGatewayErrorCode {
    InvalidInput,
    InvalidResponse,
    Timeout,
    BackendUnavailable,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Failure reported by a recognition or synthesis gateway.
pub struct SpeechGatewayError {
    pub code: SpeechGatewayErrorCode,
    pub gateway: String,
    pub retryable: bool,
    pub message: String,
}

impl SpeechGatewayError {
    pub fn invalid_input(gateway: &str, message: impl Into<String>) -> Self {
        Self {
            code: SpeechGatewayErrorCode::InvalidInput,
            gateway: gateway.to_string(),
            retryable: false,
            message: message.into(),
        }
    }

    pub fn backend_unavailable(gateway: &str, message: impl Into<String>) -> Self {
        Self {
            code: SpeechGatewayErrorCode::BackendUnavailable,
            gateway: gateway.to_string(),
            retryable: true,
            message: message.into(),
        }
    }

    pub fn timeout(gateway: &str, message: impl Into<String>) -> Self {
        Self {
            code: SpeechGatewayErrorCode::Timeout,
            gateway: gateway.to_string(),
            retryable: true,
            message: message.into(),
        }
    }

    pub fn is_service_unavailable(&self) -> bool {
        matches!(
            self.code,
            SpeechGatewayErrorCode::Timeout | SpeechGatewayErrorCode::BackendUnavailable
        )
    }
}

impl std::fmt::Display for SpeechGatewayError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "speech gateway error: gateway={} code={:?} retryable={} message={}",
            self.gateway, self.code, self.retryable, self.message
        )
    }
}

impl std::error::Error for SpeechGatewayError {}

pub type SpeechGatewayResult<T> = Result<T, SpeechGatewayError>;

/// Request to start recognizing with one grammar. The generation tags the
/// dialogue that issued it and must be echoed back on the result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecognitionRequest {
    pub grammar: String,
    pub generation: u64,
}

impl RecognitionRequest {
    pub fn new(grammar: impl Into<String>, generation: u64) -> Self {
        Self {
            grammar: grammar.into(),
            generation,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecognitionResult {
    pub generation: u64,
    pub text: String,
}

impl RecognitionResult {
    pub fn new(generation: u64, text: impl Into<String>) -> Self {
        Self {
            generation,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpeakRequest {
    pub text: String,
    pub timeout_ms: u64,
}

impl SpeakRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timeout_ms: DEFAULT_GATEWAY_TIMEOUT_MS,
        }
    }
}

#[async_trait]
/// Fire-and-forget recognition requests; transcriptions arrive later as
/// `RecognitionResult` events.
pub trait SpeechRecognizer: Send + Sync {
    async fn request_recognition(&self, request: RecognitionRequest) -> SpeechGatewayResult<()>;
}

#[async_trait]
/// Speech synthesis; resolves only after the service acknowledged playback.
pub trait SpeechSynthesizer: Send + Sync {
    async fn speak(&self, request: SpeakRequest) -> SpeechGatewayResult<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpSpeechGatewayConfig {
    pub gateway_name: String,
    pub api_base: String,
    pub api_key: Option<String>,
    pub recognition_path: String,
    pub speak_path: String,
    pub timeout_ms: u64,
}

impl Default for HttpSpeechGatewayConfig {
    fn default() -> Self {
        Self {
            gateway_name: "http-speech".to_string(),
            api_base: String::new(),
            api_key: None,
            recognition_path: "/recognition".to_string(),
            speak_path: "/speak".to_string(),
            timeout_ms: DEFAULT_GATEWAY_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone)]
/// Recognition and synthesis over a plain HTTP speech service.
pub struct HttpSpeechGateway {
    config: HttpSpeechGatewayConfig,
    client: Client,
}

impl HttpSpeechGateway {
    pub fn new(config: HttpSpeechGatewayConfig) -> SpeechGatewayResult<Self> {
        if config.gateway_name.trim().is_empty() {
            return Err(SpeechGatewayError::invalid_input(
                "http-speech",
                "gateway_name must not be empty",
            ));
        }
        if config.api_base.trim().is_empty() {
            return Err(SpeechGatewayError::invalid_input(
                config.gateway_name.trim(),
                "api_base must not be empty",
            ));
        }
        if config.recognition_path.trim().is_empty() || config.speak_path.trim().is_empty() {
            return Err(SpeechGatewayError::invalid_input(
                config.gateway_name.trim(),
                "recognition_path and speak_path must not be empty",
            ));
        }

        let client = Client::builder().build().map_err(|error| {
            SpeechGatewayError::backend_unavailable(
                config.gateway_name.trim(),
                format!("failed to initialize http client: {error}"),
            )
        })?;

        let mut normalized = config;
        normalized.api_base = normalized.api_base.trim().trim_end_matches('/').to_string();
        normalized.timeout_ms = normalized.timeout_ms.max(1);

        Ok(Self {
            config: normalized,
            client,
        })
    }

    fn gateway_name_internal(&self) -> &str {
        self.config.gateway_name.trim()
    }

    fn endpoint_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.config.api_base, path)
        } else {
            format!("{}/{}", self.config.api_base, path)
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let Some(api_key) = self.config.api_key.as_deref() else {
            return builder;
        };
        if api_key.trim().is_empty() {
            builder
        } else {
            builder.bearer_auth(api_key.trim())
        }
    }

    async fn post_json(
        &self,
        operation: &str,
        path: &str,
        timeout_ms: u64,
        payload: serde_json::Value,
    ) -> SpeechGatewayResult<()> {
        let response = self
            .authorize(
                self.client
                    .post(self.endpoint_url(path))
                    .timeout(Duration::from_millis(timeout_ms.max(1)))
                    .json(&payload),
            )
            .send()
            .await
            .map_err(|error| self.map_request_error(operation, error))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(map_http_status_error(
            self.gateway_name_internal(),
            operation,
            status,
            &body,
        ))
    }

    fn map_request_error(&self, operation: &str, error: reqwest::Error) -> SpeechGatewayError {
        if error.is_timeout() {
            return SpeechGatewayError::timeout(
                self.gateway_name_internal(),
                format!("operation={operation} request timed out"),
            );
        }
        SpeechGatewayError::backend_unavailable(
            self.gateway_name_internal(),
            format!("operation={operation} request failed: {error}"),
        )
    }
}

#[async_trait]
impl SpeechRecognizer for HttpSpeechGateway {
    async fn request_recognition(&self, request: RecognitionRequest) -> SpeechGatewayResult<()> {
        let grammar = request.grammar.trim();
        if grammar.is_empty() {
            return Err(SpeechGatewayError::invalid_input(
                self.gateway_name_internal(),
                "grammar must not be empty",
            ));
        }
        self.post_json(
            "recognition",
            self.config.recognition_path.as_str(),
            self.config.timeout_ms,
            json!({
                "grammar": grammar,
                "generation": request.generation,
            }),
        )
        .await
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechGateway {
    async fn speak(&self, request: SpeakRequest) -> SpeechGatewayResult<()> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(SpeechGatewayError::invalid_input(
                self.gateway_name_internal(),
                "text must not be empty",
            ));
        }
        // The HTTP response is the playback acknowledgement.
        self.post_json(
            "speak",
            self.config.speak_path.as_str(),
            request.timeout_ms.max(self.config.timeout_ms),
            json!({ "text": text }),
        )
        .await
    }
}

#[derive(Debug, Default)]
/// In-memory gateway that records every recognition request and prompt.
pub struct RecordingSpeechGateway {
    recognition_requests: AsyncMutex<Vec<RecognitionRequest>>,
    spoken: AsyncMutex<Vec<String>>,
    fail_recognition: AtomicBool,
    fail_speech: AtomicBool,
}

impl RecordingSpeechGateway {
    const GATEWAY_NAME: &'static str = "recording";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_recognition_available(&self, available: bool) {
        self.fail_recognition.store(!available, Ordering::SeqCst);
    }

    pub fn set_speech_available(&self, available: bool) {
        self.fail_speech.store(!available, Ordering::SeqCst);
    }

    pub async fn recognition_requests(&self) -> Vec<RecognitionRequest> {
        self.recognition_requests.lock().await.clone()
    }

    pub async fn last_recognition_request(&self) -> Option<RecognitionRequest> {
        self.recognition_requests.lock().await.last().cloned()
    }

    pub async fn spoken(&self) -> Vec<String> {
        self.spoken.lock().await.clone()
    }
}

#[async_trait]
impl SpeechRecognizer for RecordingSpeechGateway {
    async fn request_recognition(&self, request: RecognitionRequest) -> SpeechGatewayResult<()> {
        if self.fail_recognition.load(Ordering::SeqCst) {
            return Err(SpeechGatewayError::backend_unavailable(
                Self::GATEWAY_NAME,
                "recognition service unreachable",
            ));
        }
        self.recognition_requests.lock().await.push(request);
        Ok(())
    }
}

#[async_trait]
impl SpeechSynthesizer for RecordingSpeechGateway {
    async fn speak(&self, request: SpeakRequest) -> SpeechGatewayResult<()> {
        if self.fail_speech.load(Ordering::SeqCst) {
            return Err(SpeechGatewayError::backend_unavailable(
                Self::GATEWAY_NAME,
                "synthesis service unreachable",
            ));
        }
        self.spoken.lock().await.push(request.text);
        Ok(())
    }
}

fn map_http_status_error(
    gateway: &str,
    operation: &str,
    status: StatusCode,
    body: &str,
) -> SpeechGatewayError {
    let message = format!(
        "operation={operation} status={} body={}",
        status.as_u16(),
        truncate_error_body(body)
    );

    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        return SpeechGatewayError::timeout(gateway, message);
    }
    if status.is_server_error() {
        return SpeechGatewayError::backend_unavailable(gateway, message);
    }
    if status.is_client_error() {
        return SpeechGatewayError::invalid_input(gateway, message);
    }
    SpeechGatewayError {
        code: SpeechGatewayErrorCode::Unknown,
        gateway: gateway.to_string(),
        retryable: false,
        message,
    }
}

fn truncate_error_body(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    if trimmed.chars().count() <= MAX_ERROR_BODY_CHARS {
        return trimmed.to_string();
    }
    let truncated = trimmed
        .chars()
        .take(MAX_ERROR_BODY_CHARS)
        .collect::<String>();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use reqwest::StatusCode;

    use super::{
        map_http_status_error, truncate_error_body, HttpSpeechGateway, HttpSpeechGatewayConfig,
        RecognitionRequest, RecordingSpeechGateway, SpeakRequest, SpeechGatewayErrorCode,
        SpeechRecognizer, SpeechSynthesizer,
    };

    fn http_config(api_base: String) -> HttpSpeechGatewayConfig {
        HttpSpeechGatewayConfig {
            api_base,
            timeout_ms: 2_000,
            ..HttpSpeechGatewayConfig::default()
        }
    }

    #[test]
    fn unit_http_gateway_rejects_empty_api_base() {
        let error = HttpSpeechGateway::new(HttpSpeechGatewayConfig::default())
            .expect_err("expected config error");
        assert_eq!(error.code, SpeechGatewayErrorCode::InvalidInput);
        assert!(!error.is_service_unavailable());
    }

    #[test]
    fn unit_http_error_mapping_marks_service_unavailable_statuses() {
        let timeout = map_http_status_error("http", "speak", StatusCode::GATEWAY_TIMEOUT, "");
        assert_eq!(timeout.code, SpeechGatewayErrorCode::Timeout);
        assert!(timeout.is_service_unavailable());

        let outage = map_http_status_error("http", "recognition", StatusCode::BAD_GATEWAY, "");
        assert_eq!(outage.code, SpeechGatewayErrorCode::BackendUnavailable);
        assert!(outage.retryable);

        let rejected = map_http_status_error("http", "recognition", StatusCode::NOT_FOUND, "");
        assert_eq!(rejected.code, SpeechGatewayErrorCode::InvalidInput);
        assert!(!rejected.is_service_unavailable());
    }

    #[test]
    fn unit_truncate_error_body_caps_long_payloads() {
        assert_eq!(truncate_error_body("  "), "<empty>");
        let long = "x".repeat(600);
        let truncated = truncate_error_body(&long);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncated.chars().count(), 515);
    }

    #[tokio::test]
    async fn integration_http_gateway_posts_grammar_and_generation() {
        let server = MockServer::start();
        let recognition = server.mock(|when, then| {
            when.method(POST)
                .path("/recognition")
                .body_includes("\"grammar\":\"lights_sphinx\"")
                .body_includes("\"generation\":7");
            then.status(202);
        });

        let gateway = HttpSpeechGateway::new(http_config(server.base_url())).expect("gateway");
        gateway
            .request_recognition(RecognitionRequest::new("lights_sphinx", 7))
            .await
            .expect("recognition accepted");
        assert_eq!(recognition.calls(), 1);
    }

    #[tokio::test]
    async fn integration_http_gateway_speak_waits_for_acknowledgement() {
        let server = MockServer::start();
        let speak = server.mock(|when, then| {
            when.method(POST)
                .path("/speak")
                .body_includes("Please answer yes or no.");
            then.status(200);
        });

        let gateway = HttpSpeechGateway::new(http_config(server.base_url())).expect("gateway");
        gateway
            .speak(SpeakRequest::new(
                "You said turn on the light. Am I correct? Please answer yes or no.",
            ))
            .await
            .expect("speak acknowledged");
        assert_eq!(speak.calls(), 1);
    }

    #[tokio::test]
    async fn regression_http_gateway_reports_backend_outage_as_service_unavailable() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/recognition");
            then.status(503).body("recognizer offline");
        });

        let gateway = HttpSpeechGateway::new(http_config(server.base_url())).expect("gateway");
        let error = gateway
            .request_recognition(RecognitionRequest::new("lights_sphinx", 1))
            .await
            .expect_err("outage");
        assert!(error.is_service_unavailable());
        assert!(error.message.contains("recognizer offline"));
    }

    #[tokio::test]
    async fn functional_recording_gateway_records_and_injects_failures() {
        let gateway = RecordingSpeechGateway::new();
        gateway
            .request_recognition(RecognitionRequest::new("lights_sphinx", 1))
            .await
            .expect("recorded");
        gateway
            .speak(SpeakRequest::new("hello"))
            .await
            .expect("spoken");

        gateway.set_recognition_available(false);
        let error = gateway
            .request_recognition(RecognitionRequest::new("lights_sphinx", 2))
            .await
            .expect_err("injected failure");
        assert!(error.is_service_unavailable());

        assert_eq!(
            gateway.recognition_requests().await,
            vec![RecognitionRequest::new("lights_sphinx", 1)]
        );
        assert_eq!(gateway.spoken().await, vec!["hello".to_string()]);
    }
}
