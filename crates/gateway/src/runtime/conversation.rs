//! The Conversation Manager (§3.4): per-execution, in-memory, and
//! losslessly serializable so a Task's `execution_context.conversation_state`
//! can rehydrate it after a restart.
//!
//! Grounded on the original `PlaybookConversationManager`
//! (`build_system_prompt`/`add_user_message`/`add_assistant_message`/
//! `get_messages_for_llm`), carried over field-for-field and reworked
//! into a plain serializable struct instead of a stateful Python object
//! closed over store singletons.

use std::collections::HashMap;

use sa_domain::message::{Message, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

/// Everything needed to resume a playbook execution mid-conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationManager {
    pub playbook_code: String,
    pub sop_content: String,
    pub workspace_id: Uuid,
    pub locale: String,
    pub history: Vec<ChatTurn>,
    /// 0-based; represents the *next* step to emit.
    pub current_step: i64,
    pub extracted_outputs: HashMap<String, Value>,
    pub skip_steps: Vec<i64>,
    pub custom_checklist: Vec<String>,
    /// A frozen view of the workspace's enabled tools, taken at start
    /// time, rather than re-queried on every turn.
    pub cached_tools_str: Option<String>,
}

impl ConversationManager {
    pub fn new(
        playbook_code: impl Into<String>,
        sop_content: impl Into<String>,
        workspace_id: Uuid,
        locale: impl Into<String>,
    ) -> Self {
        Self {
            playbook_code: playbook_code.into(),
            sop_content: sop_content.into(),
            workspace_id,
            locale: locale.into(),
            history: Vec::new(),
            current_step: 0,
            extracted_outputs: HashMap::new(),
            skip_steps: Vec::new(),
            custom_checklist: Vec::new(),
            cached_tools_str: None,
        }
    }

    pub fn with_variant(mut self, skip_steps: Vec<i64>, custom_checklist: Vec<String>) -> Self {
        self.skip_steps = skip_steps;
        self.custom_checklist = custom_checklist;
        self
    }

    pub fn with_tool_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.cached_tools_str = Some(catalog.into());
        self
    }

    pub fn build_system_prompt(&self) -> String {
        let mut parts = Vec::new();
        parts.push(format!("[PLAYBOOK: {}]", self.playbook_code));
        parts.push(self.sop_content.clone());
        parts.push("[/PLAYBOOK]".to_string());

        if !self.skip_steps.is_empty() {
            parts.push("\n[SKIP_STEPS]".to_string());
            let joined = self
                .skip_steps
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("Skip the following steps: {joined}"));
            parts.push("[/SKIP_STEPS]".to_string());
        }

        if !self.custom_checklist.is_empty() {
            parts.push("\n[CUSTOM_CHECKLIST]".to_string());
            parts.push("Additional checklist items:".to_string());
            for item in &self.custom_checklist {
                parts.push(format!("- {item}"));
            }
            parts.push("[/CUSTOM_CHECKLIST]".to_string());
        }

        parts.push("\n[LANGUAGE_INSTRUCTION]".to_string());
        parts.push(format!("Always respond in {}.", self.locale));
        parts.push(format!(
            "Use terminology appropriate for {} locale.",
            self.locale
        ));
        parts.push("[/LANGUAGE_INSTRUCTION]".to_string());

        parts.push("\n[EXECUTION_INSTRUCTIONS]".to_string());
        parts.push("Follow the SOP steps exactly as described.".to_string());
        parts.push(
            "At the end, output structured JSON with the key 'STRUCTURED_OUTPUT'.".to_string(),
        );
        parts.push("[/EXECUTION_INSTRUCTIONS]".to_string());

        if let Some(tools) = &self.cached_tools_str {
            parts.push("\n[AVAILABLE_TOOLS]".to_string());
            parts.push(tools.clone());
            parts.push(
                "\nWhen you need a tool, emit JSON: {\"tool_call\": {\"tool_name\": \"...\", \"parameters\": {...}}}".to_string(),
            );
            parts.push("[/AVAILABLE_TOOLS]".to_string());
        }

        parts.join("\n")
    }

    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.history.push(ChatTurn {
            role: TurnRole::User,
            content: content.into(),
        });
    }

    pub fn add_assistant_message(&mut self, content: impl Into<String>) {
        self.history.push(ChatTurn {
            role: TurnRole::Assistant,
            content: content.into(),
        });
    }

    pub fn add_system_message(&mut self, content: impl Into<String>) {
        self.history.push(ChatTurn {
            role: TurnRole::System,
            content: content.into(),
        });
    }

    pub fn messages_for_llm(&self) -> Vec<Message> {
        let mut messages = vec![Message::system(self.build_system_prompt())];
        for turn in &self.history {
            let m = match turn.role {
                TurnRole::System => Message::system(turn.content.clone()),
                TurnRole::User => Message::user(turn.content.clone()),
                TurnRole::Assistant => Message::assistant(turn.content.clone()),
            };
            messages.push(m);
        }
        messages
    }

    pub fn last_assistant_text(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|t| matches!(t.role, TurnRole::Assistant))
            .map(|t| t.content.as_str())
    }

    /// Serialize into `execution_context.conversation_state` (§4.6
    /// "Checkpoint"). Losslessly round-trips all fields (§8 invariant).
    pub fn to_state(&self) -> Value {
        serde_json::to_value(self).expect("ConversationManager is always representable as JSON")
    }

    pub fn from_state(state: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(state.clone())
    }
}
