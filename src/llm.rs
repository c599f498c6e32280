use crate::models::Model;
use crate::prelude::*;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::{Map, Value};
use std::time::Duration;

/// A generated completion plus the per-row metadata bag persisted with the
/// answer (token counts, tool-call count; the worker adds generation_time).
pub struct CompletionOutput {
    pub content: String,
    pub metadata: Map<String, Value>,
}

/// Seam between the worker pool and the outbound LLM call, so tests can run
/// the whole engine against a stub instead of a live endpoint.
pub trait Completion: Send + Sync {
    fn complete(&self, model: &Model, query: &str) -> Fallible<CompletionOutput>;
}

/// One-shot chat-completions client over the model's base_url.
pub struct HttpCompletion {
    client: Client,
}

impl HttpCompletion {
    pub fn new(timeout: Duration) -> Fallible<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(HttpCompletion { client })
    }

    fn request_body(model: &Model, query: &str) -> Map<String, Value> {
        let mut messages = Vec::new();
        if let Some(prompt_system) = &model.prompt_system {
            messages.push(serde_json::json!({
                "role": "system",
                "content": prompt_system,
            }));
        }
        messages.push(serde_json::json!({
            "role": "user",
            "content": query,
        }));

        let mut body = Map::new();
        body.insert("model".into(), Value::String(model.name.clone()));
        body.insert("messages".into(), Value::Array(messages));

        // The engine never introspects the parameter bags; they are spliced
        // into the request as-is.
        for params in [&model.sampling_params, &model.extra_params] {
            if let Some(Value::Object(params)) = params {
                for (key, value) in params {
                    body.insert(key.clone(), value.clone());
                }
            }
        }

        body
    }
}

impl Completion for HttpCompletion {
    fn complete(&self, model: &Model, query: &str) -> Fallible<CompletionOutput> {
        let url = format!(
            "{}/chat/completions",
            model.base_url.trim_end_matches('/')
        );
        let body = Self::request_body(model, query);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&model.api_key)
            .json(&body)
            .send()
            .with_context(|| format!("request to {url} failed"))?;

        let status = resp.status();
        if status != StatusCode::OK {
            let detail = resp.text().unwrap_or_default();
            bail!("request to {} returned status code {}: {}", url, status, detail);
        }

        let resp: ChatResponse = resp
            .json()
            .with_context(|| format!("invalid completion payload from {url}"))?;
        parse_response(resp)
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<Value>>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
}

fn parse_response(resp: ChatResponse) -> Fallible<CompletionOutput> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("completion returned no choices"))?;

    let mut metadata = Map::new();
    if let Some(usage) = &resp.usage {
        if let Some(tokens) = usage.prompt_tokens {
            metadata.insert("nb_tokens_prompt".into(), tokens.into());
        }
        if let Some(tokens) = usage.completion_tokens {
            metadata.insert("nb_tokens_completion".into(), tokens.into());
        }
    }
    let nb_tool_calls = choice.message.tool_calls.map(|c| c.len()).unwrap_or(0);
    metadata.insert("nb_tool_calls".into(), (nb_tool_calls as i64).into());

    Ok(CompletionOutput {
        content: choice
            .message
            .content
            .ok_or_else(|| anyhow!("completion returned no content"))?,
        metadata,
    })
}
