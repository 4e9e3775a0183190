use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where an inbound event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatScope {
    /// One-on-one chat with the bot.
    Direct,
    /// Group chat (a tenant).
    Group,
}

/// A text message delivered by the messaging platform.
///
/// Webhook parsing happens upstream; by the time an event reaches this
/// crate the platform adapter has resolved the sender display name and
/// extracted any bot-mention command text.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub scope: ChatScope,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub sender_name: Option<String>,
    pub text: String,
    /// Platform timestamp in milliseconds since the epoch.
    pub timestamp_ms: i64,
    /// Command text following a bot mention, if the bot was mentioned.
    pub command: Option<String>,
}

impl MessageEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.timestamp_ms).unwrap_or_else(Utc::now)
    }
}

/// A button action carrying opaque callback data (e.g. a confirm tap).
#[derive(Debug, Clone)]
pub struct ActionEvent {
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub data: String,
    pub timestamp_ms: i64,
}

/// The bot was invited into a group chat.
#[derive(Debug, Clone)]
pub struct JoinEvent {
    pub tenant_id: String,
    pub timestamp_ms: i64,
}

impl JoinEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.timestamp_ms).unwrap_or_else(Utc::now)
    }
}

/// A language offered or requested during enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageChoice {
    pub code: String,
    pub name: String,
}

impl LanguageChoice {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
        }
    }
}

/// Result of the external language-preference analyzer.
#[derive(Debug, Clone, Default)]
pub struct LanguagePreference {
    pub primary_language: String,
    pub supported: Vec<LanguageChoice>,
    pub unsupported: Vec<LanguageChoice>,
    pub confirm_label: String,
    pub cancel_label: String,
}

/// Mutation requested by a language-settings command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LanguageOperation {
    ResetAll,
    Add(Vec<LanguageChoice>),
    Remove(Vec<String>),
    AddAndRemove {
        add: Vec<LanguageChoice>,
        remove: Vec<String>,
    },
}

/// Classified intent of a mention command, produced by the external
/// command router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandDecision {
    LanguageSettings {
        operation: LanguageOperation,
        instruction_language: String,
        ack_text: String,
    },
    HowTo {
        instruction_language: String,
    },
    Pause {
        ack_text: String,
    },
    Resume {
        ack_text: String,
    },
    Unknown {
        instruction_language: String,
    },
}

/// A prior group message supplied to the translator as context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextMessage {
    pub sender_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Request handed to the translation port.
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub sender_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub candidate_languages: Vec<String>,
    pub context_messages: Vec<ContextMessage>,
}

/// One translated rendition of a message. Ephemeral: lives only until the
/// reply is composed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationResult {
    pub lang: String,
    pub text: String,
}

/// A message persisted into the bounded history window.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub tenant_id: String,
    pub user_id: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Paid state of a tenant as reported by the billing provider.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionStatus {
    pub active: bool,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
}

/// One renderable block of a reply. The embedding service maps these onto
/// the platform's message types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    /// Confirmation template with two postback buttons carrying opaque data.
    Confirm {
        text: String,
        confirm_label: String,
        cancel_label: String,
        confirm_data: String,
        cancel_data: String,
    },
}

/// Ordered list of reply blocks returned to the caller, which owns
/// delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyBundle {
    pub replies: Vec<Reply>,
}

impl ReplyBundle {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            replies: vec![Reply::Text(message.into())],
        }
    }

    pub fn push(&mut self, reply: Reply) {
        self.replies.push(reply);
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }

    /// First text block, if any. Convenience for callers and tests.
    pub fn first_text(&self) -> Option<&str> {
        self.replies.iter().find_map(|r| match r {
            Reply::Text(text) => Some(text.as_str()),
            _ => None,
        })
    }
}
