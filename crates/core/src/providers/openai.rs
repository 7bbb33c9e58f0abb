use crate::error::QueryError;
use crate::traits::{
    EmbeddingBatch, EmbeddingProvider, LanguageModel, LlmUsage, StructuredRequest,
    StructuredResponse, TextRequest,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

// Works against the OpenAI API or any compatible endpoint.
pub struct OpenAiClient {
    endpoint: String,
    api_key: String,
    embedding_model: String,
    chat_model: String,
    embedding_dimensions: usize,
    client: Client,
}

impl OpenAiClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        embedding_model: impl Into<String>,
        chat_model: impl Into<String>,
        embedding_dimensions: usize,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            embedding_model: embedding_model.into(),
            chat_model: chat_model.into(),
            embedding_dimensions,
            client: Client::new(),
        }
    }

    fn bearer(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.header("Authorization", format!("Bearer {}", self.api_key))
    }

    fn chat_body(&self, system: &str, prompt: &str, max_tokens: u32, temperature: f32) -> Value {
        json!({
            "model": self.chat_model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
            "max_tokens": max_tokens,
            "temperature": temperature,
        })
    }
}

fn usage_from(value: &Value) -> LlmUsage {
    LlmUsage {
        prompt_tokens: value
            .pointer("/usage/prompt_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize,
        completion_tokens: value
            .pointer("/usage/completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize,
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiClient {
    fn dimensions(&self) -> usize {
        self.embedding_dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<EmbeddingBatch, QueryError> {
        let response = self
            .bearer(self.client.post(format!("{}/embeddings", self.endpoint)))
            .json(&json!({
                "model": self.embedding_model,
                "input": texts,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::BackendResponse {
                backend: "openai embeddings".to_string(),
                details: response.status().to_string(),
            });
        }

        let parsed: Value = response.json().await?;
        let vectors: Vec<Vec<f32>> = parsed
            .pointer("/data")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry.pointer("/embedding"))
                    .filter_map(Value::as_array)
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(Value::as_f64)
                            .map(|value| value as f32)
                            .collect()
                    })
                    .collect()
            })
            .unwrap_or_default();

        if vectors.len() != texts.len() {
            return Err(QueryError::BackendResponse {
                backend: "openai embeddings".to_string(),
                details: format!("expected {} embeddings, got {}", texts.len(), vectors.len()),
            });
        }

        Ok(EmbeddingBatch {
            vectors,
            total_tokens: parsed
                .pointer("/usage/total_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn generate_structured(
        &self,
        request: StructuredRequest,
    ) -> Result<StructuredResponse, QueryError> {
        let mut body = self.chat_body(
            &request.system,
            &request.prompt,
            request.max_tokens,
            request.temperature,
        );
        body["response_format"] = json!({"type": "json_object"});

        let response = self
            .bearer(self.client.post(format!("{}/chat/completions", self.endpoint)))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::Provider {
                stage: request.stage,
                details: format!("status {}", response.status()),
            });
        }

        let parsed: Value = response.json().await?;
        let content = parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| QueryError::Provider {
                stage: request.stage,
                details: "response had no message content".to_string(),
            })?;

        let value: Value =
            serde_json::from_str(content).map_err(|error| QueryError::Provider {
                stage: request.stage,
                details: format!("content was not valid JSON: {error}"),
            })?;

        Ok(StructuredResponse {
            value,
            usage: usage_from(&parsed),
        })
    }

    async fn stream_text(
        &self,
        request: TextRequest,
    ) -> Result<BoxStream<'static, Result<String, QueryError>>, QueryError> {
        let mut body = self.chat_body(
            &request.system,
            &request.prompt,
            request.max_tokens,
            request.temperature,
        );
        body["stream"] = json!(true);

        let response = self
            .bearer(self.client.post(format!("{}/chat/completions", self.endpoint)))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QueryError::BackendResponse {
                backend: "openai chat".to_string(),
                details: response.status().to_string(),
            });
        }

        let bytes = response.bytes_stream();
        let tokens = futures::stream::unfold(
            (bytes, String::new()),
            |(mut bytes, mut buffer)| async move {
                loop {
                    if let Some(position) = buffer.find('\n') {
                        let line = buffer[..position].trim().to_string();
                        buffer.drain(..=position);

                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if data == "[DONE]" {
                            return None;
                        }
                        let Ok(event) = serde_json::from_str::<Value>(data) else {
                            continue;
                        };
                        if let Some(token) = event
                            .pointer("/choices/0/delta/content")
                            .and_then(Value::as_str)
                        {
                            if !token.is_empty() {
                                return Some((Ok(token.to_string()), (bytes, buffer)));
                            }
                        }
                        continue;
                    }

                    match bytes.next().await {
                        Some(Ok(chunk)) => buffer.push_str(&String::from_utf8_lossy(&chunk)),
                        Some(Err(error)) => {
                            return Some((Err(QueryError::Http(error)), (bytes, buffer)))
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(tokens.boxed())
    }
}
