//! Per-user conversation state
//!
//! Keyed in-memory store with atomic read-modify-write per user. All
//! mutations happen under the map's shard lock with no awaits inside, so
//! two concurrent webhook deliveries for the same user can never lose a
//! turn or half-apply one.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, WhatsAppError};

/// Retained message bound per conversation
pub const MAX_MESSAGES: usize = 50;

/// Default window for `history`
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Keywords that move a conversation to `Stage::ServiceInquiry`
pub(crate) const SERVICE_KEYWORDS: &[&str] = &[
    "servicio",
    "automatización",
    "automatizacion",
    "chatbot",
    "marketing",
    "desarrollo web",
    "service",
];

/// Keywords that move a conversation to `Stage::Support`
pub(crate) const SUPPORT_KEYWORDS: &[&str] = &[
    "ayuda",
    "problema",
    "soporte",
    "no funciona",
    "falla",
    "help",
    "support",
];

/// Keywords that move a conversation to `Stage::Information`
pub(crate) const INFO_KEYWORDS: &[&str] = &[
    "información",
    "informacion",
    "info",
    "saber más",
    "saber mas",
    "conocer",
    "detalles",
];

/// Coarse intent classification for a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Greeting,
    Information,
    ServiceInquiry,
    Support,
}

/// Message author within a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Conversation state for a single user
#[derive(Debug, Clone)]
pub struct Conversation {
    pub user_id: String,
    pub messages: VecDeque<ChatMessage>,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    pub last_interaction: DateTime<Utc>,
    /// Total messages ever recorded, both roles, eviction ignored
    pub total_messages: u64,
}

impl Conversation {
    pub(crate) fn new(user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            messages: VecDeque::new(),
            stage: Stage::Greeting,
            created_at: now,
            last_interaction: now,
            total_messages: 0,
        }
    }
}

/// Classify the latest user message against the keyword sets.
///
/// Contract: exact substring containment on the lower-cased text, checked
/// in fixed priority order (service, support, information). `None` means
/// no evidence, keep the current stage.
pub fn classify_stage(text: &str) -> Option<Stage> {
    let lower = text.to_lowercase();

    if SERVICE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Some(Stage::ServiceInquiry);
    }
    if SUPPORT_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Some(Stage::Support);
    }
    if INFO_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Some(Stage::Information);
    }
    None
}

/// In-memory conversation store keyed by wa_id
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: DashMap<String, Conversation>,
}

impl ConversationStore {
    /// Create a new conversation store
    pub fn new() -> Self {
        Self {
            conversations: DashMap::new(),
        }
    }

    /// Get a snapshot of the user's conversation, creating it on first
    /// contact. Concurrent calls for the same user resolve to one entry.
    pub fn get_or_create(&self, user_id: &str) -> Conversation {
        self.conversations
            .entry(user_id.to_string())
            .or_insert_with(|| Conversation::new(user_id))
            .clone()
    }

    /// Atomically record one full turn: the inbound user message and the
    /// delivered reply. Updates metadata, re-evaluates the stage from the
    /// user text, and evicts the oldest entries beyond [`MAX_MESSAGES`].
    pub fn append_turn(&self, user_id: &str, user_text: &str, assistant_text: &str) -> Result<()> {
        let mut entry = self
            .conversations
            .get_mut(user_id)
            .ok_or_else(|| WhatsAppError::NotFound(user_id.to_string()))?;

        let now = Utc::now();
        entry.last_interaction = now;
        entry.messages.push_back(ChatMessage {
            role: Role::User,
            content: user_text.to_string(),
            timestamp: now,
        });
        entry.messages.push_back(ChatMessage {
            role: Role::Assistant,
            content: assistant_text.to_string(),
            timestamp: now,
        });
        entry.total_messages += 2;

        while entry.messages.len() > MAX_MESSAGES {
            entry.messages.pop_front();
        }

        if let Some(stage) = classify_stage(user_text) {
            entry.stage = stage;
        }

        Ok(())
    }

    /// The most recent `limit` messages, chronological, newest last
    pub fn history(&self, user_id: &str, limit: usize) -> Vec<ChatMessage> {
        match self.conversations.get(user_id) {
            Some(entry) => {
                let skip = entry.messages.len().saturating_sub(limit);
                entry.messages.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Number of tracked conversations
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Delete conversations idle for longer than `older_than`.
    ///
    /// Stale keys are identified first, then removed one by one with a
    /// re-check under the shard lock, so a conversation touched after the
    /// scan survives and live traffic is never starved by one long
    /// critical section.
    pub fn sweep(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now() - older_than;

        let stale: Vec<String> = self
            .conversations
            .iter()
            .filter(|entry| entry.value().last_interaction < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in stale {
            if self
                .conversations
                .remove_if(&key, |_, conv| conv.last_interaction < cutoff)
                .is_some()
            {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "swept stale conversations");
        }
        removed
    }

    #[cfg(test)]
    fn backdate(&self, user_id: &str, by: Duration) {
        if let Some(mut entry) = self.conversations.get_mut(user_id) {
            entry.last_interaction -= by;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_get_or_create_starts_at_greeting() {
        let store = ConversationStore::new();
        let conv = store.get_or_create("5215550001111");
        assert_eq!(conv.stage, Stage::Greeting);
        assert!(conv.messages.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let store = ConversationStore::new();
        store.get_or_create("u1");
        store.append_turn("u1", "hola", "¡Hola!").unwrap();
        let again = store.get_or_create("u1");
        assert_eq!(again.messages.len(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_single_entry() {
        let store = Arc::new(ConversationStore::new());

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.get_or_create("5215550001111");
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_append_turn_requires_existing_conversation() {
        let store = ConversationStore::new();
        let err = store.append_turn("ghost", "hola", "reply").unwrap_err();
        assert!(matches!(err, WhatsAppError::NotFound(_)));
    }

    #[test]
    fn test_append_turn_records_pair_and_metadata() {
        let store = ConversationStore::new();
        store.get_or_create("u1");
        store.append_turn("u1", "hola", "¡Hola!").unwrap();

        let conv = store.get_or_create("u1");
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.messages[0].role, Role::User);
        assert_eq!(conv.messages[1].role, Role::Assistant);
        assert_eq!(conv.total_messages, 2);
    }

    #[test]
    fn test_eviction_keeps_most_recent_fifty() {
        let store = ConversationStore::new();
        store.get_or_create("u1");

        for i in 0..26 {
            store
                .append_turn("u1", &format!("pregunta {i}"), &format!("respuesta {i}"))
                .unwrap();
        }

        let conv = store.get_or_create("u1");
        assert_eq!(conv.messages.len(), MAX_MESSAGES);
        // 26 turns = 52 messages; the first turn was evicted
        assert_eq!(conv.messages[0].content, "pregunta 1");
        assert_eq!(conv.total_messages, 52);
    }

    #[test]
    fn test_history_window_ordering() {
        let store = ConversationStore::new();
        store.get_or_create("u1");
        for i in 0..7 {
            store
                .append_turn("u1", &format!("q{i}"), &format!("a{i}"))
                .unwrap();
        }

        let history = store.history("u1", DEFAULT_HISTORY_LIMIT);
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].content, "q2");
        assert_eq!(history[9].content, "a6");

        assert!(store.history("unknown", 10).is_empty());
    }

    #[test]
    fn test_stage_advances_on_service_keyword() {
        let store = ConversationStore::new();
        store.get_or_create("u1");
        store
            .append_turn("u1", "Hola, quiero saber de automatización", "claro")
            .unwrap();
        assert_eq!(store.get_or_create("u1").stage, Stage::ServiceInquiry);
    }

    #[test]
    fn test_stage_sticky_without_new_evidence() {
        let store = ConversationStore::new();
        store.get_or_create("u1");
        store.append_turn("u1", "necesito un chatbot", "claro").unwrap();
        assert_eq!(store.get_or_create("u1").stage, Stage::ServiceInquiry);

        // No keyword at all: stage must not regress to greeting
        store.append_turn("u1", "cuánto cuesta", "precios...").unwrap();
        assert_eq!(store.get_or_create("u1").stage, Stage::ServiceInquiry);
    }

    #[test]
    fn test_classifier_priority_order() {
        // Service wins over support and information when several match
        assert_eq!(
            classify_stage("necesito AYUDA con un servicio"),
            Some(Stage::ServiceInquiry)
        );
        assert_eq!(classify_stage("tengo un problema"), Some(Stage::Support));
        assert_eq!(
            classify_stage("quiero más información"),
            Some(Stage::Information)
        );
        assert_eq!(classify_stage("cuánto cuesta"), None);
    }

    #[test]
    fn test_sweep_retention_boundary() {
        let store = ConversationStore::new();
        store.get_or_create("old");
        store.get_or_create("fresh");
        store.backdate("old", Duration::days(8));
        store.backdate("fresh", Duration::days(7) - Duration::seconds(1));

        let removed = store.sweep(Duration::days(7));
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        assert!(store.history("fresh", 10).is_empty());
        // The swept user starts over on next contact
        assert_eq!(store.get_or_create("old").total_messages, 0);
    }
}
