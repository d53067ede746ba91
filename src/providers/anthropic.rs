//! Anthropic Messages API provider.

use super::{
    sanitize_api_error, sse_chunk_stream, ChatRequest, ChunkStream, Provider, ProviderError,
    SseLineBuffer, StreamChunk,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    default_model: String,
}

impl AnthropicProvider {
    pub fn new(name: String, base_url: String, api_key: String, default_model: String) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            name,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model,
        }
    }

    fn request_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let model = if request.model.is_empty() {
            &self.default_model
        } else {
            &request.model
        };
        json!({
            "model": model,
            "system": request.system,
            "messages": [{"role": "user", "content": request.user}],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": stream,
        })
    }

    async fn post(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&self.request_body(request, stream))
            .send()
            .await
            .map_err(|e| ProviderError::Network(sanitize_api_error(&e.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                message: sanitize_api_error(&message),
            });
        }
        Ok(response)
    }
}

fn parse_stream_line(line: &str) -> Option<StreamChunk> {
    let payload = SseLineBuffer::data_payload(line)?;
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    match value["type"].as_str()? {
        "content_block_delta" => {
            let text = value["delta"]["text"].as_str()?;
            if text.is_empty() {
                return None;
            }
            Some(StreamChunk::Content {
                content: text.to_string(),
            })
        }
        "message_stop" => Some(StreamChunk::Done),
        "error" => Some(StreamChunk::Error {
            error: value["error"]["message"]
                .as_str()
                .unwrap_or("provider error")
                .to_string(),
        }),
        _ => None,
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        let response = self.post(request, false).await?;
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(sanitize_api_error(&e.to_string())))?;

        value["content"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::InvalidResponse("missing content[0].text".into()))
    }

    async fn invoke_stream(&self, request: &ChatRequest) -> Result<ChunkStream, ProviderError> {
        let response = self.post(request, true).await?;
        let metadata = StreamChunk::Metadata {
            metadata: json!({"provider": self.name, "model": self.default_model}),
        };
        let body = sse_chunk_stream(response, parse_stream_line);
        Ok(Box::pin(futures_util::stream::iter([metadata]).chain(body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_line_parses() {
        let line = r#"data: {"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}"#;
        assert_eq!(
            parse_stream_line(line),
            Some(StreamChunk::Content {
                content: "Hi".into()
            })
        );
    }

    #[test]
    fn message_stop_is_done() {
        let line = r#"data: {"type":"message_stop"}"#;
        assert_eq!(parse_stream_line(line), Some(StreamChunk::Done));
    }

    #[test]
    fn error_event_surfaces_message() {
        let line = r#"data: {"type":"error","error":{"message":"overloaded"}}"#;
        assert_eq!(
            parse_stream_line(line),
            Some(StreamChunk::Error {
                error: "overloaded".into()
            })
        );
    }

    #[test]
    fn ping_events_ignored() {
        assert_eq!(parse_stream_line(r#"data: {"type":"ping"}"#), None);
        assert_eq!(parse_stream_line("event: ping"), None);
    }

    #[test]
    fn request_body_uses_system_top_level() {
        let p = AnthropicProvider::new(
            "anthropic".into(),
            "https://api.anthropic.com".into(),
            "k".into(),
            "claude-sonnet-4-5".into(),
        );
        let req = ChatRequest {
            system: "mentor rules".into(),
            user: "help".into(),
            model: String::new(),
            temperature: 0.3,
            max_tokens: 1024,
        };
        let body = p.request_body(&req, false);
        assert_eq!(body["system"], "mentor rules");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["model"], "claude-sonnet-4-5");
    }
}
