//! Conversational assistant grounded on the data digest.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_TEMPERATURE: f32 = 0.3;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;
pub const DEFAULT_LLM_BASE_URL: &str = "http://localhost:1234/v1";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_LLM_TIMEOUT_MS: u64 = 60_000;

pub const ASSISTANT_RUBRIC: &str = "\
Role:
You are the City Operations Monitor, the analyst watching the health of \
store supply across the city. Your job is to make sure enough stores are \
online to meet demand.

Data:
A time series of `available_stores` (total connected stores), sampled about \
every 10 seconds. A statistical summary follows these instructions.

Mission:
Find supply patterns (when stores come online) and spot anomalies (sudden \
drops that point to platform-wide technical problems).

Instructions:
1. Peaks: always name the golden hour, the moment of highest availability of \
the day.
2. Drops: when asked about problems, look for moments where \
`available_stores` falls more than 10% in under 10 minutes.
3. Comparisons: aggregate by hour. Compare hourly averages, not single \
points.
4. Answer format: concrete numbers (counts, hours, percentages), the \
operational meaning for the platform, and recommendations where they apply.
5. Language: reply in the language the user writes in.

IMPORTANT: base EVERY answer on the data summary below. Never invent data.";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssistantError {
    #[error("completion service failed: {0}")]
    ExternalService(String),
    #[error("failed to build HTTP client: {0}")]
    HttpClientBuild(String),
    #[error("a question is already pending for this conversation")]
    Pending,
    #[error("the conversation changed while the question was pending")]
    Stale,
    #[error("the request was cancelled before the assistant replied")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Model,
}

/// One turn of model context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    User,
    Assistant,
    Error,
}

/// One line of the visible transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub kind: EntryKind,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub system_instruction: String,
    pub turns: Vec<Turn>,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl CompletionRequest {
    pub fn new(digest: &str, prior: &[Turn], message: &str) -> Self {
        let mut turns = prior.to_vec();
        turns.push(Turn {
            role: TurnRole::User,
            content: message.to_string(),
        });
        Self {
            system_instruction: format!("{ASSISTANT_RUBRIC}\n\n{digest}"),
            turns,
            temperature: DEFAULT_TEMPERATURE,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }
}

pub trait CompletionService: Send + Sync {
    fn complete(&self, request: &CompletionRequest) -> Result<String, AssistantError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_LLM_BASE_URL.to_string(),
            model: DEFAULT_LLM_MODEL.to_string(),
            api_key: None,
            timeout_ms: DEFAULT_LLM_TIMEOUT_MS,
        }
    }
}

/// OpenAI-compatible `chat/completions` client over blocking reqwest.
pub struct HttpCompletionService {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpCompletionService {
    pub fn new(cfg: &LlmConfig) -> Result<Self, AssistantError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|err| AssistantError::HttpClientBuild(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", cfg.base_url.trim_end_matches('/')),
            model: cfg.model.clone(),
            api_key: cfg.api_key.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut messages = Vec::with_capacity(request.turns.len() + 1);
        messages.push(json!({ "role": "system", "content": request.system_instruction }));
        for turn in &request.turns {
            let role = match turn.role {
                TurnRole::User => "user",
                TurnRole::Model => "assistant",
            };
            messages.push(json!({ "role": role, "content": turn.content }));
        }
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_output_tokens,
        })
    }
}

impl CompletionService for HttpCompletionService {
    fn complete(&self, request: &CompletionRequest) -> Result<String, AssistantError> {
        let body = serde_json::to_vec(&self.request_body(request))
            .map_err(|err| AssistantError::ExternalService(err.to_string()))?;

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .map_err(|err| AssistantError::ExternalService(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AssistantError::ExternalService(format!(
                "unexpected HTTP status {status}"
            )));
        }

        let bytes = response
            .bytes()
            .map_err(|err| AssistantError::ExternalService(err.to_string()))?;
        parse_completion_body(&bytes)
    }
}

pub fn parse_completion_body(bytes: &[u8]) -> Result<String, AssistantError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|err| AssistantError::ExternalService(format!("invalid response body: {err}")))?;
    value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            AssistantError::ExternalService("response has no message content".to_string())
        })
}

/// Ticket for one in-flight question. Its outcome only lands in the
/// conversation version it was asked in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingQuestion {
    version: u64,
    message: String,
}

impl PendingQuestion {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Visible transcript and model context of one chat session. The context
/// only ever holds completed user/model exchanges.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Conversation {
    version: u64,
    transcript: Vec<TranscriptEntry>,
    context: Vec<Turn>,
    pending: Option<String>,
}

impl Conversation {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn context(&self) -> &[Turn] {
        &self.context
    }

    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    /// Marks `message` pending and builds the request for it.
    pub fn begin(
        &mut self,
        digest: &str,
        message: &str,
    ) -> Result<(PendingQuestion, CompletionRequest), AssistantError> {
        if self.pending.is_some() {
            return Err(AssistantError::Pending);
        }
        self.pending = Some(message.to_string());
        let question = PendingQuestion {
            version: self.version,
            message: message.to_string(),
        };
        Ok((question, CompletionRequest::new(digest, &self.context, message)))
    }

    /// Applies the outcome of `question`. An outcome for a question that is
    /// no longer pending, because the conversation was cleared or moved on,
    /// is dropped with `Stale` and changes nothing.
    pub fn finish(
        &mut self,
        question: PendingQuestion,
        outcome: Result<String, AssistantError>,
    ) -> Result<String, AssistantError> {
        if question.version != self.version
            || self.pending.as_deref() != Some(question.message.as_str())
        {
            return Err(AssistantError::Stale);
        }
        self.pending = None;
        let message = question.message;

        self.transcript.push(TranscriptEntry {
            kind: EntryKind::User,
            content: message.clone(),
        });
        self.version += 1;

        match outcome {
            Ok(answer) => {
                self.transcript.push(TranscriptEntry {
                    kind: EntryKind::Assistant,
                    content: answer.clone(),
                });
                self.context.push(Turn {
                    role: TurnRole::User,
                    content: message,
                });
                self.context.push(Turn {
                    role: TurnRole::Model,
                    content: answer.clone(),
                });
                Ok(answer)
            }
            Err(err) => {
                self.transcript.push(TranscriptEntry {
                    kind: EntryKind::Error,
                    content: format!("Could not reach the assistant: {err}"),
                });
                Err(err)
            }
        }
    }

    pub fn ask(
        &mut self,
        service: &dyn CompletionService,
        digest: &str,
        message: &str,
    ) -> Result<String, AssistantError> {
        let (question, request) = self.begin(digest, message)?;
        let outcome = complete_logged(service, &request);
        self.finish(question, outcome)
    }

    /// Resolves `question` as cancelled. Returns false when it was already
    /// stale.
    pub fn abandon(&mut self, question: PendingQuestion) -> bool {
        !matches!(
            self.finish(question, Err(AssistantError::Cancelled)),
            Err(AssistantError::Stale)
        )
    }

    pub fn clear(&mut self) {
        self.transcript.clear();
        self.context.clear();
        self.pending = None;
        self.version += 1;
    }
}

/// Calls the service with start/finish/error events around it.
pub fn complete_logged(
    service: &dyn CompletionService,
    request: &CompletionRequest,
) -> Result<String, AssistantError> {
    let started = Instant::now();
    info!(
        component = "assistant",
        event = "assistant.request.start",
        turns = request.turns.len(),
        system_chars = request.system_instruction.len()
    );

    let outcome = service.complete(request);
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &outcome {
        Ok(answer) => info!(
            component = "assistant",
            event = "assistant.request.finish",
            elapsed_ms,
            answer_chars = answer.len()
        ),
        Err(err) => warn!(
            component = "assistant",
            event = "assistant.request.error",
            elapsed_ms,
            error = %err
        ),
    }
    outcome
}

/// Conversations keyed by session id.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Conversation>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conversation<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Conversation) -> R,
    ) -> R {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(sessions.entry(session_id.to_string()).or_default())
    }

    pub fn snapshot(&self, session_id: &str) -> Conversation {
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.get(session_id).cloned().unwrap_or_default()
    }

    pub fn clear(&self, session_id: &str) -> Conversation {
        self.with_conversation(session_id, |conversation| {
            conversation.clear();
            conversation.clone()
        })
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
