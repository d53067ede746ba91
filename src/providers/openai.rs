//! OpenAI-compatible chat provider.
//!
//! Covers the OpenAI API and every endpoint that speaks its dialect
//! (OpenRouter, vLLM, llama.cpp server). Streaming uses the standard
//! `data:` SSE frames terminated by `data: [DONE]`.

use super::{
    sanitize_api_error, sse_chunk_stream, ChatRequest, ChunkStream, Provider, ProviderError,
    SseLineBuffer, StreamChunk,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use std::time::Duration;

/// TCP/TLS connect timeout; the overall call deadline lives in the
/// resilience layer.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OpenAiProvider {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    default_model: String,
}

impl OpenAiProvider {
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
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
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
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
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
    if payload == "[DONE]" {
        return Some(StreamChunk::Done);
    }
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let delta = value["choices"][0]["delta"]["content"].as_str()?;
    if delta.is_empty() {
        return None;
    }
    Some(StreamChunk::Content {
        content: delta.to_string(),
    })
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        let response = self.post(request, false).await?;
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(sanitize_api_error(&e.to_string())))?;

        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                ProviderError::InvalidResponse("missing choices[0].message.content".into())
            })
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
    fn stream_line_parses_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(
            parse_stream_line(line),
            Some(StreamChunk::Content {
                content: "Hel".into()
            })
        );
    }

    #[test]
    fn stream_line_done_marker() {
        assert_eq!(parse_stream_line("data: [DONE]"), Some(StreamChunk::Done));
    }

    #[test]
    fn stream_line_skips_non_data_and_empty_delta() {
        assert_eq!(parse_stream_line(": keep-alive"), None);
        assert_eq!(parse_stream_line(""), None);
        let empty = r#"data: {"choices":[{"delta":{}}]}"#;
        assert_eq!(parse_stream_line(empty), None);
    }

    #[test]
    fn request_body_shape() {
        let p = OpenAiProvider::new(
            "openrouter".into(),
            "https://openrouter.ai/api/v1/".into(),
            "k".into(),
            "meta-llama/llama-4".into(),
        );
        let req = ChatRequest {
            system: "sys".into(),
            user: "usr".into(),
            model: String::new(),
            temperature: 0.2,
            max_tokens: 512,
        };
        let body = p.request_body(&req, true);
        assert_eq!(body["model"], "meta-llama/llama-4");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "usr");
        // Trailing slash on the base URL is normalized away.
        assert_eq!(p.base_url, "https://openrouter.ai/api/v1");
    }
}
