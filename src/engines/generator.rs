//! Reply generator backends.

use super::{Exchange, Generator};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

// ── Rule-based backend ────────────────────────────────────────────

/// Offline deterministic responder. Keeps the conversation loop usable
/// with no model behind it: greetings, a couple of canned topics, and a
/// gentle nudge for everything else.
pub struct RulesGenerator;

impl RulesGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RulesGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Generator for RulesGenerator {
    async fn reply(&self, _history: &[Exchange], user_text: &str) -> anyhow::Result<String> {
        let text = user_text.trim();
        if text.is_empty() {
            return Ok("I'm still listening. Could you repeat that?".into());
        }
        let lower = text.to_lowercase();

        if ["hello", "hi", "hey"].iter().any(|g| lower.contains(g)) {
            return Ok("Hello! How can I help you today?".into());
        }
        if lower.contains("time") {
            let now = chrono::Local::now().format("%H:%M");
            return Ok(format!(
                "It's currently {now}. What else would you like to talk about?"
            ));
        }
        if lower.contains("your name") {
            return Ok("I'm an offline demo assistant built for streaming conversations.".into());
        }
        if text.ends_with('?') {
            return Ok(
                "That's an interesting question. I'm not connected to a language model right now, \
                 but tell me more and we can reason about it together."
                    .into(),
            );
        }
        if text.split_whitespace().count() < 4 {
            return Ok("Tell me more so I can respond with something helpful.".into());
        }
        Ok(
            "I hear you. This assistant focuses on the real-time audio pipeline, so my replies \
             are intentionally simple. Feel free to ask how the system works."
                .into(),
        )
    }
}

// ── OpenAI-compatible HTTP backend ────────────────────────────────

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

const SYSTEM_PROMPT: &str = "You are an upbeat assistant having a spoken conversation. \
                             Keep answers concise (max 2 sentences).";

/// Chat-completions backend for any OpenAI-style endpoint.
pub struct HttpGenerator {
    url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpGenerator {
    pub fn new(url: &str, model: Option<&str>, api_key: Option<&str>) -> Self {
        Self {
            url: url.to_string(),
            model: model.unwrap_or("gpt-4o-mini").to_string(),
            api_key: api_key.map(str::to_string),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn reply(&self, history: &[Exchange], user_text: &str) -> anyhow::Result<String> {
        let mut messages = vec![ChatMessage {
            role: "system",
            content: SYSTEM_PROMPT,
        }];
        for exchange in history {
            messages.push(ChatMessage {
                role: "user",
                content: &exchange.user,
            });
            messages.push(ChatMessage {
                role: "assistant",
                content: &exchange.assistant,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: user_text,
        });

        let body = ChatRequest {
            model: &self.model,
            messages,
        };

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("generator returned HTTP {status}");
        }

        let value: serde_json::Value = response.json().await?;
        let reply = value
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("generator response had no message content"))?;
        Ok(reply.to_string())
    }
}

// ── Scripted backend ──────────────────────────────────────────────

/// Test/development backend: pops scripted replies in order, or echoes
/// the user once the script runs dry. Can be told to fail instead.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<String>>,
    failure: Mutex<Option<String>>,
}

impl ScriptedGenerator {
    pub fn new(script: Vec<String>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            failure: Mutex::new(None),
        }
    }

    /// A generator with no script: always echoes.
    pub fn echo() -> Self {
        Self::new(Vec::new())
    }

    /// A generator that fails every call with `message`.
    pub fn failing(message: &str) -> Self {
        let out = Self::new(Vec::new());
        *out.failure.lock() = Some(message.to_string());
        out
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn reply(&self, _history: &[Exchange], user_text: &str) -> anyhow::Result<String> {
        if let Some(message) = self.failure.lock().as_ref() {
            anyhow::bail!("{message}");
        }
        Ok(self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| format!("You said: {user_text}")))
    }
}
