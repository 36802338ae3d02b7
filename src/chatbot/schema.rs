//! JSON reply schema the model must follow, and the drafts parsed from it.

use serde::{Deserialize, Serialize};

use crate::chatbot::action::Recurrence;

/// Schema description embedded in the system prompt.
pub const REPLY_SCHEMA: &str = r#"Reply with exactly one JSON object and nothing else. One of:

{"intent": "create", "title": string|null, "start": "YYYY-MM-DD HH:MM"|"YYYY-MM-DD"|null,
 "end": "YYYY-MM-DD HH:MM"|"YYYY-MM-DD"|null, "all_day": bool, "location": string|null,
 "description": string|null, "participants": [string],
 "recurrence": {"frequency": "daily"|"weekly"|"monthly"|"yearly", "interval": int|null,
                "count": int|null, "until": "YYYY-MM-DD"|null} | null}

{"intent": "update", "target": {"event_ids": [string], "query": string|null},
 "title": string|null, "start": string|null, "end": string|null,
 "location": string|null, "description": string|null}

{"intent": "delete", "target": {"event_ids": [string], "query": string|null}}

{"intent": "clarify", "missing": ["action"], "question": string}

{"intent": "unrelated", "reason": string}"#;

/// A field the user still has to provide or disambiguate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Action,
    Title,
    Start,
    End,
    Target,
    Changes,
}

impl Field {
    pub fn label(&self) -> &'static str {
        match self {
            Field::Action => "cosa vuoi fare",
            Field::Title => "il titolo",
            Field::Start => "data e ora di inizio",
            Field::End => "data e ora di fine",
            Field::Target => "quale evento",
            Field::Changes => "cosa modificare",
        }
    }
}

/// Which existing event the model thinks the user means.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDraft {
    /// Ids copied from the event list in the prompt.
    #[serde(default)]
    pub event_ids: Vec<String>,
    /// Free-text description of the event ("dentista").
    #[serde(default)]
    pub query: Option<String>,
}

impl TargetDraft {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self { event_ids: vec![id.into()], query: None }
    }

    pub fn is_empty(&self) -> bool {
        self.event_ids.is_empty() && self.query.as_deref().is_none_or(|q| q.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDraft {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub all_day: bool,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDraft {
    #[serde(default)]
    pub target: TargetDraft,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteDraft {
    #[serde(default)]
    pub target: TargetDraft,
}

/// A partially specified calendar action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum ActionDraft {
    Create(CreateDraft),
    Update(UpdateDraft),
    Delete(DeleteDraft),
}

impl ActionDraft {
    pub fn target_mut(&mut self) -> Option<&mut TargetDraft> {
        match self {
            ActionDraft::Create(_) => None,
            ActionDraft::Update(d) => Some(&mut d.target),
            ActionDraft::Delete(d) => Some(&mut d.target),
        }
    }
}

/// Everything the model may answer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum ModelReply {
    Create(CreateDraft),
    Update(UpdateDraft),
    Delete(DeleteDraft),
    Clarify {
        #[serde(default)]
        missing: Vec<Field>,
        #[serde(default)]
        question: Option<String>,
    },
    Unrelated {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ModelReply {
    pub fn into_draft(self) -> Option<ActionDraft> {
        match self {
            ModelReply::Create(d) => Some(ActionDraft::Create(d)),
            ModelReply::Update(d) => Some(ActionDraft::Update(d)),
            ModelReply::Delete(d) => Some(ActionDraft::Delete(d)),
            ModelReply::Clarify { .. } | ModelReply::Unrelated { .. } => None,
        }
    }
}

/// Parse the model's text, tolerating code fences and prose around the object.
pub fn parse_reply(text: &str) -> Result<ModelReply, String> {
    let json = extract_json_object(text).ok_or_else(|| "no JSON object in reply".to_string())?;
    serde_json::from_str(json).map_err(|e| format!("reply does not match schema: {e}"))
}

fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
