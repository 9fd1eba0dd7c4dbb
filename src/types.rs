use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

/// LLM provider family. Drives reasoning-block normalization and the
/// thinking-preservation rules — nothing else in the pipeline is
/// provider-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    Bedrock,
    OpenAi,
    Google,
}

impl Provider {
    /// Which reasoning payload this family carries on AI messages, if any.
    pub fn reasoning_type(&self) -> Option<ReasoningType> {
        match self {
            Provider::Anthropic | Provider::Bedrock => Some(ReasoningType::Thinking),
            Provider::OpenAi => Some(ReasoningType::ReasoningContent),
            Provider::Google => None,
        }
    }

    /// OpenAI-family providers ship reasoning as `additional_kwargs`
    /// side-channels that must be hoisted into content blocks before pruning.
    pub fn hoists_reasoning_kwargs(&self) -> bool {
        matches!(self, Provider::OpenAi)
    }
}

/// The two reasoning payload shapes that must survive pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningType {
    Thinking,
    ReasoningContent,
}

/// Message role, used for start-type constraints and protected zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    Human,
    Ai,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::Human => "human",
            Role::Ai => "ai",
            Role::Tool => "tool",
        };
        f.write_str(s)
    }
}

/// A tool invocation named by an AI message. `args` is the provider-opaque
/// argument payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Wire spelling of a tool-use content block. Both spellings appear in the
/// wild; round-trips must not normalize one into the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolUseKind {
    ToolUse,
    ToolCall,
}

impl ToolUseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolUseKind::ToolUse => "tool_use",
            ToolUseKind::ToolCall => "tool_call",
        }
    }
}

/// A completed summary produced by the external summarization node.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SummaryBlock {
    pub text: String,
    pub token_count: u32,
    pub provider: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// A content block inside a message. Closed set of known shapes plus an
/// `Opaque` residual so unknown provider blocks round-trip untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
        kind: ToolUseKind,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
    },
    /// Raw image block, kept whole. Presence alone matters to the pipeline.
    Image(Value),
    Thinking {
        thinking: String,
        signature: Option<String>,
    },
    ReasoningContent {
        text: String,
    },
    Summary(SummaryBlock),
    CachePoint,
    /// Anything we do not model. Carried through verbatim.
    Opaque(Value),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
            kind: ToolUseKind::ToolUse,
        }
    }

    pub fn thinking(thinking: impl Into<String>, signature: Option<String>) -> Self {
        ContentBlock::Thinking {
            thinking: thinking.into(),
            signature,
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, ContentBlock::ToolUse { .. })
    }

    pub fn is_reasoning(&self) -> bool {
        matches!(
            self,
            ContentBlock::Thinking { .. } | ContentBlock::ReasoningContent { .. }
        )
    }

    /// Whether this block carries the given reasoning payload shape.
    pub fn matches_reasoning(&self, reasoning: Option<ReasoningType>) -> bool {
        match (self, reasoning) {
            (ContentBlock::Thinking { .. }, Some(ReasoningType::Thinking)) => true,
            (ContentBlock::ReasoningContent { .. }, Some(ReasoningType::ReasoningContent)) => true,
            (_, None) => self.is_reasoning(),
            _ => false,
        }
    }

    pub fn from_value(value: &Value) -> Self {
        let block_type = value.get("type").and_then(Value::as_str).unwrap_or("");
        match block_type {
            "text" => ContentBlock::Text {
                text: value
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            },
            "tool_use" | "tool_call" => {
                let kind = if block_type == "tool_call" {
                    ToolUseKind::ToolCall
                } else {
                    ToolUseKind::ToolUse
                };
                ContentBlock::ToolUse {
                    id: value
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    name: value
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    input: value.get("input").cloned().unwrap_or(Value::Null),
                    kind,
                }
            }
            "tool_result" => ContentBlock::ToolResult {
                tool_use_id: value
                    .get("tool_use_id")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                content: value.get("content").cloned().unwrap_or(Value::Null),
            },
            "image" | "image_url" => ContentBlock::Image(value.clone()),
            "thinking" => ContentBlock::Thinking {
                thinking: value
                    .get("thinking")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                signature: value
                    .get("signature")
                    .and_then(Value::as_str)
                    .map(String::from),
            },
            "reasoning_content" => ContentBlock::ReasoningContent {
                text: value
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            },
            "summary" => ContentBlock::Summary(SummaryBlock {
                text: value
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                token_count: value
                    .get("token_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32,
                provider: value
                    .get("provider")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                model: value
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                created_at: value
                    .get("created_at")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(Utc::now),
            }),
            "cachePoint" => ContentBlock::CachePoint,
            _ => ContentBlock::Opaque(value.clone()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
            ContentBlock::ToolUse {
                id,
                name,
                input,
                kind,
            } => json!({
                "type": kind.as_str(),
                "id": id,
                "name": name,
                "input": input,
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
            } => json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
            }),
            ContentBlock::Image(raw) => raw.clone(),
            ContentBlock::Thinking {
                thinking,
                signature,
            } => {
                let mut v = json!({ "type": "thinking", "thinking": thinking });
                if let Some(sig) = signature {
                    v["signature"] = Value::String(sig.clone());
                }
                v
            }
            ContentBlock::ReasoningContent { text } => {
                json!({ "type": "reasoning_content", "text": text })
            }
            ContentBlock::Summary(summary) => json!({
                "type": "summary",
                "text": summary.text,
                "token_count": summary.token_count,
                "provider": summary.provider,
                "model": summary.model,
                "created_at": summary.created_at.to_rfc3339(),
            }),
            ContentBlock::CachePoint => json!({ "type": "cachePoint" }),
            ContentBlock::Opaque(raw) => raw.clone(),
        }
    }
}

/// Message content: either a plain string or an ordered block sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(s) => Some(s),
            MessageContent::Blocks(_) => None,
        }
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        match self {
            MessageContent::Text(_) => &[],
            MessageContent::Blocks(blocks) => blocks,
        }
    }

    pub fn blocks_mut(&mut self) -> Option<&mut Vec<ContentBlock>> {
        match self {
            MessageContent::Text(_) => None,
            MessageContent::Blocks(blocks) => Some(blocks),
        }
    }

    /// Character length of the string form, 0 for block sequences.
    pub fn text_len(&self) -> usize {
        match self {
            MessageContent::Text(s) => s.chars().count(),
            MessageContent::Blocks(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.is_empty(),
            MessageContent::Blocks(blocks) => blocks.is_empty(),
        }
    }

    pub fn has_image(&self) -> bool {
        self.blocks()
            .iter()
            .any(|b| matches!(b, ContentBlock::Image(_)))
    }

    pub fn to_value(&self) -> Value {
        match self {
            MessageContent::Text(s) => Value::String(s.clone()),
            MessageContent::Blocks(blocks) => {
                Value::Array(blocks.iter().map(ContentBlock::to_value).collect())
            }
        }
    }

    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Array(blocks) => {
                MessageContent::Blocks(blocks.iter().map(ContentBlock::from_value).collect())
            }
            Value::String(s) => MessageContent::Text(s.clone()),
            other => MessageContent::Text(other.to_string()),
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<Vec<ContentBlock>> for MessageContent {
    fn from(blocks: Vec<ContentBlock>) -> Self {
        MessageContent::Blocks(blocks)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SystemMessage {
    pub id: Option<String>,
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HumanMessage {
    pub id: Option<String>,
    pub content: MessageContent,
}

/// AI message. `tool_calls` mirrors the tool-use content blocks for
/// OpenAI-family providers; `additional_kwargs` and `response_metadata` are
/// provider-opaque and must survive reconstruction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AiMessage {
    pub id: Option<String>,
    pub content: MessageContent,
    pub tool_calls: Vec<ToolCall>,
    pub additional_kwargs: Map<String, Value>,
    pub response_metadata: Map<String, Value>,
}

/// Tool result message. `tool_call_id` pairs it with a tool-use block on a
/// preceding AI message.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolMessage {
    pub id: Option<String>,
    pub content: MessageContent,
    pub tool_call_id: String,
    pub name: Option<String>,
    pub status: Option<String>,
}

/// A transcript message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    System(SystemMessage),
    Human(HumanMessage),
    Ai(AiMessage),
    Tool(ToolMessage),
}

impl Message {
    pub fn system(content: impl Into<MessageContent>) -> Self {
        Message::System(SystemMessage {
            id: None,
            content: content.into(),
        })
    }

    pub fn human(content: impl Into<MessageContent>) -> Self {
        Message::Human(HumanMessage {
            id: None,
            content: content.into(),
        })
    }

    pub fn ai(content: impl Into<MessageContent>) -> Self {
        Message::Ai(AiMessage {
            content: content.into(),
            ..AiMessage::default()
        })
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<MessageContent>) -> Self {
        Message::Tool(ToolMessage {
            id: None,
            content: content.into(),
            tool_call_id: tool_call_id.into(),
            name: None,
            status: None,
        })
    }

    pub fn role(&self) -> Role {
        match self {
            Message::System(_) => Role::System,
            Message::Human(_) => Role::Human,
            Message::Ai(_) => Role::Ai,
            Message::Tool(_) => Role::Tool,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Message::System(_))
    }

    pub fn is_human(&self) -> bool {
        matches!(self, Message::Human(_))
    }

    pub fn is_ai(&self) -> bool {
        matches!(self, Message::Ai(_))
    }

    pub fn is_tool(&self) -> bool {
        matches!(self, Message::Tool(_))
    }

    /// AI or Tool — a member of an assistant turn.
    pub fn is_assistant_turn(&self) -> bool {
        matches!(self, Message::Ai(_) | Message::Tool(_))
    }

    pub fn content(&self) -> &MessageContent {
        match self {
            Message::System(m) => &m.content,
            Message::Human(m) => &m.content,
            Message::Ai(m) => &m.content,
            Message::Tool(m) => &m.content,
        }
    }

    pub fn content_mut(&mut self) -> &mut MessageContent {
        match self {
            Message::System(m) => &mut m.content,
            Message::Human(m) => &mut m.content,
            Message::Ai(m) => &mut m.content,
            Message::Tool(m) => &mut m.content,
        }
    }

    pub fn as_ai(&self) -> Option<&AiMessage> {
        match self {
            Message::Ai(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_ai_mut(&mut self) -> Option<&mut AiMessage> {
        match self {
            Message::Ai(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_tool(&self) -> Option<&ToolMessage> {
        match self {
            Message::Tool(m) => Some(m),
            _ => None,
        }
    }

    /// Serialize for persistence and for the heuristic token counter.
    pub fn to_value(&self) -> Value {
        match self {
            Message::System(m) => {
                let mut v = json!({ "role": "system", "content": m.content.to_value() });
                if let Some(id) = &m.id {
                    v["id"] = Value::String(id.clone());
                }
                v
            }
            Message::Human(m) => {
                let mut v = json!({ "role": "human", "content": m.content.to_value() });
                if let Some(id) = &m.id {
                    v["id"] = Value::String(id.clone());
                }
                v
            }
            Message::Ai(m) => {
                let mut v = json!({ "role": "ai", "content": m.content.to_value() });
                if let Some(id) = &m.id {
                    v["id"] = Value::String(id.clone());
                }
                if !m.tool_calls.is_empty() {
                    v["tool_calls"] = Value::Array(
                        m.tool_calls
                            .iter()
                            .map(|tc| json!({ "id": tc.id, "name": tc.name, "args": tc.args }))
                            .collect(),
                    );
                }
                if !m.additional_kwargs.is_empty() {
                    v["additional_kwargs"] = Value::Object(m.additional_kwargs.clone());
                }
                if !m.response_metadata.is_empty() {
                    v["response_metadata"] = Value::Object(m.response_metadata.clone());
                }
                v
            }
            Message::Tool(m) => {
                let mut v = json!({
                    "role": "tool",
                    "content": m.content.to_value(),
                    "tool_call_id": m.tool_call_id,
                });
                if let Some(id) = &m.id {
                    v["id"] = Value::String(id.clone());
                }
                if let Some(name) = &m.name {
                    v["name"] = Value::String(name.clone());
                }
                if let Some(status) = &m.status {
                    v["status"] = Value::String(status.clone());
                }
                v
            }
        }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let content = value
            .get("content")
            .map(MessageContent::from_value)
            .unwrap_or_default();
        let id = value.get("id").and_then(Value::as_str).map(String::from);
        match value.get("role").and_then(Value::as_str)? {
            "system" => Some(Message::System(SystemMessage { id, content })),
            "human" | "user" => Some(Message::Human(HumanMessage { id, content })),
            "ai" | "assistant" => {
                let tool_calls = value
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .map(|calls| {
                        calls
                            .iter()
                            .filter_map(|tc| {
                                Some(ToolCall {
                                    id: tc.get("id")?.as_str()?.to_string(),
                                    name: tc
                                        .get("name")
                                        .and_then(Value::as_str)
                                        .unwrap_or("")
                                        .to_string(),
                                    args: tc.get("args").cloned().unwrap_or(Value::Null),
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let additional_kwargs = value
                    .get("additional_kwargs")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let response_metadata = value
                    .get("response_metadata")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                Some(Message::Ai(AiMessage {
                    id,
                    content,
                    tool_calls,
                    additional_kwargs,
                    response_metadata,
                }))
            }
            "tool" => Some(Message::Tool(ToolMessage {
                id,
                content,
                tool_call_id: value
                    .get("tool_call_id")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                name: value.get("name").and_then(Value::as_str).map(String::from),
                status: value
                    .get("status")
                    .and_then(Value::as_str)
                    .map(String::from),
            })),
            _ => None,
        }
    }
}

/// Provider-reported token usage for a single completed call. Every field is
/// optional — providers differ in what they report.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UsageMetadata {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub cache_creation: Option<u64>,
    pub cache_read: Option<u64>,
}

impl UsageMetadata {
    /// True when the metadata can ground calibration: at least one
    /// input-side figure is present.
    pub fn has_input_side(&self) -> bool {
        self.input_tokens.is_some() || self.cache_creation.is_some() || self.cache_read.is_some()
    }

    /// Provider-grounded total: the reported total when present, otherwise
    /// the sum of the parts.
    pub fn grounded_total(&self) -> u64 {
        self.total_tokens.unwrap_or_else(|| {
            self.input_tokens.unwrap_or(0)
                + self.cache_creation.unwrap_or(0)
                + self.cache_read.unwrap_or(0)
                + self.output_tokens.unwrap_or(0)
        })
    }
}
