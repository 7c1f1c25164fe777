//! Perplexity chat-completions client
//!
//! One [`PerplexityClient`] is built at setup and shared by every agent of
//! the config entry. The credential and user agent are baked into the
//! client's default headers once, so individual requests only carry their
//! body.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::chat_log::ToolCall;
use crate::error::BackendError;

pub const DEFAULT_BASE_URL: &str = "https://api.perplexity.ai";
pub const RECOMMENDED_CHAT_MODEL: &str = "sonar";

/// Model id and display name
pub const MODELS: &[(&str, &str)] = &[
    ("sonar", "Sonar"),
    ("sonar-pro", "Sonar Pro"),
    ("sonar-reasoning", "Sonar Reasoning"),
    ("sonar-reasoning-pro", "Sonar Reasoning Pro"),
];

pub const REASONING_MODELS: &[&str] = &["sonar-reasoning", "sonar-reasoning-pro"];
pub const REASONING_EFFORT_OPTIONS: &[&str] = &["low", "medium", "high"];
pub const DEFAULT_REASONING_EFFORT: &str = "medium";

pub fn is_reasoning_model(model: &str) -> bool {
    REASONING_MODELS.contains(&model)
}

pub fn model_display_name(model: &str) -> &str {
    MODELS
        .iter()
        .find(|(id, _)| *id == model)
        .map(|(_, name)| *name)
        .unwrap_or(model)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Option<MessageContent>,
}

impl ChatMessage {
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(MessageContent::Text(content.into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Request body, minus the `stream` flag which the call style decides
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_search: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct RequestBody<'a> {
    #[serde(flatten)]
    request: &'a ChatRequest,
    stream: bool,
}

/// A unary completion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

/// Incremental text chunks of a streamed completion
pub type ChunkStream = BoxStream<'static, Result<String, BackendError>>;

/// The remote chat-completion service
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<Completion, BackendError>;

    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream, BackendError>;
}

// --- Wire types ---

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

impl From<WireToolCall> for ToolCall {
    fn from(call: WireToolCall) -> Self {
        let arguments = serde_json::from_str(&call.function.arguments)
            .unwrap_or(Value::String(call.function.arguments));
        ToolCall {
            id: call.id,
            name: call.function.name,
            arguments,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunkResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// HTTP client for the Perplexity API
pub struct PerplexityClient {
    client: Client,
    base_url: String,
}

impl PerplexityClient {
    pub fn new(api_key: &str, base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| anyhow::anyhow!("API key is not a valid header value"))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("pplx-assist/{}", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .map_err(|err| anyhow::anyhow!("building HTTP client: {err}"))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn send(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);
        log::debug!(
            "POST {} model={} messages={} stream={}",
            url,
            request.model,
            request.messages.len(),
            stream
        );

        let response = self
            .client
            .post(&url)
            .json(&RequestBody { request, stream })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_to_error(status, &body))
    }
}

fn status_to_error(status: StatusCode, body: &str) -> BackendError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.trim().to_string());

    if status == StatusCode::UNAUTHORIZED {
        BackendError::Authentication(message)
    } else {
        BackendError::Api {
            status: Some(status.as_u16()),
            message,
        }
    }
}

#[async_trait]
impl ChatBackend for PerplexityClient {
    async fn complete(&self, request: &ChatRequest) -> Result<Completion, BackendError> {
        let response = self.send(request, false).await?;
        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|err| BackendError::api(format!("parsing reply: {err}")))?;

        let message = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::api("completion contained no choices"))?
            .message;

        Ok(Completion {
            content: message.content,
            tool_calls: message.tool_calls.into_iter().map(ToolCall::from).collect(),
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream, BackendError> {
        let response = self.send(request, true).await?;
        Ok(sse_chunks(response))
    }
}

/// Parse one server-sent-events line into a text delta
fn parse_sse_line(line: &str) -> Result<Option<String>, BackendError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }

    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(None);
    }

    let chunk: StreamChunkResponse =
        serde_json::from_str(data).map_err(|err| BackendError::Stream(err.to_string()))?;

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .filter(|content| !content.is_empty()))
}

fn sse_chunks(response: reqwest::Response) -> ChunkStream {
    let (tx, rx) = mpsc::channel::<Result<String, BackendError>>(32);

    tokio::spawn(async move {
        let mut bytes = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(item) = bytes.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = tx.send(Err(BackendError::from(err))).await;
                    return;
                }
            };
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                match parse_sse_line(&line) {
                    Ok(Some(text)) => {
                        if tx.send(Ok(text)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                }
            }
        }

        // Trailing line without a newline
        if !buffer.is_empty() {
            let line = String::from_utf8_lossy(&buffer);
            match parse_sse_line(&line) {
                Ok(Some(text)) => {
                    let _ = tx.send(Ok(text)).await;
                }
                Ok(None) => {}
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                }
            }
        }
    });

    stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> PerplexityClient {
        PerplexityClient::new("pplx-test", &server.uri(), Duration::from_secs(5)).unwrap()
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "sonar".to_string(),
            messages: vec![ChatMessage::text("user", "hi")],
            disable_search: Some(true),
            ..Default::default()
        }
    }

    #[test]
    fn test_request_serialization() {
        let mut req = request();
        req.messages.push(ChatMessage {
            role: "user".to_string(),
            content: Some(MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "what is this".to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: "data:image/png;base64,AAAA".to_string(),
                    },
                },
            ])),
        });
        req.messages.push(ChatMessage {
            role: "assistant".to_string(),
            content: None,
        });

        let body = serde_json::to_value(RequestBody {
            request: &req,
            stream: true,
        })
        .unwrap();

        assert_eq!(body["stream"], true);
        assert_eq!(body["disable_search"], true);
        assert!(body.get("reasoning_effort").is_none());
        assert!(body.get("response_format").is_none());
        assert_eq!(
            body["messages"][0],
            json!({"role": "user", "content": "hi"})
        );
        assert_eq!(
            body["messages"][1]["content"][0],
            json!({"type": "text", "text": "what is this"})
        );
        assert_eq!(
            body["messages"][1]["content"][1],
            json!({"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}})
        );
        assert_eq!(body["messages"][2]["content"], Value::Null);
    }

    #[test]
    fn test_parse_sse_line() {
        let line = r#"data: {"choices":[{"delta":{"content":"hello"}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap(), Some("hello".to_string()));
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), None);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), None);
        assert_eq!(parse_sse_line("").unwrap(), None);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            None
        );
        assert!(parse_sse_line("data: {not json").is_err());
    }

    #[test]
    fn test_model_helpers() {
        assert!(is_reasoning_model("sonar-reasoning-pro"));
        assert!(!is_reasoning_model("sonar"));
        assert_eq!(model_display_name("sonar-pro"), "Sonar Pro");
        assert_eq!(model_display_name("custom"), "custom");
    }

    #[tokio::test]
    async fn test_complete() {
        let server = MockServer::start().await;
        let expected = json!({"model": "sonar", "stream": false, "disable_search": true});
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer pplx-test"))
            .and(body_partial_json(expected))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "1",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello!"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let completion = client(&server).complete(&request()).await.unwrap();
        assert_eq!(completion.content.as_deref(), Some("Hello!"));
        assert!(completion.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn test_complete_with_tool_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "get_time", "arguments": "{\"tz\":\"UTC\"}"}
                    }]
                }}]
            })))
            .mount(&server)
            .await;

        let completion = client(&server).complete(&request()).await.unwrap();
        assert_eq!(completion.content, None);
        assert_eq!(completion.tool_calls[0].name, "get_time");
        assert_eq!(completion.tool_calls[0].arguments, json!({"tz": "UTC"}));
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Invalid API key", "type": "invalid_request_error"}
            })))
            .mount(&server)
            .await;

        let err = client(&server).complete(&request()).await.unwrap_err();
        match err {
            BackendError::Authentication(message) => assert_eq!(message, "Invalid API key"),
            other => panic!("expected authentication error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_error_maps_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = client(&server).stream(&request()).await.err().unwrap();
        match err {
            BackendError::Api { status, message } => {
                assert_eq!(status, Some(429));
                assert_eq!(message, "slow down");
            }
            other => panic!("expected API error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"{\\\"resp\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"onse\\\": \\\"Hi\\\"}\"}}]}\n\n",
            "data: [DONE]\n\n"
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let chunks: Vec<String> = client(&server)
            .stream(&request())
            .await
            .unwrap()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;

        assert_eq!(chunks.concat(), r#"{"response": "Hi"}"#);
    }
}
