//! Per-user dialogue state.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::chatbot::action::CalendarActionRequest;
use crate::chatbot::intent::ClarificationRequest;
use crate::chatbot::message::SessionKey;

/// Where a user is in a conversation with the bot.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum DialogState {
    #[default]
    Idle,
    /// `/spesa` asked for the amount.
    ExpenseAmount,
    ExpenseCategory { amount: f64 },
    ExpenseDescription { amount: f64, category: String },
    /// Waiting for the answer to a clarification question.
    Clarifying(ClarificationRequest),
    /// An action is shown with Confirm / Cancel buttons.
    Confirming(CalendarActionRequest),
}

/// Dialogue state of every active session.
#[derive(Default)]
pub struct Sessions {
    states: Mutex<HashMap<SessionKey, DialogState>>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return the state, leaving the session idle.
    pub async fn take(&self, key: SessionKey) -> DialogState {
        self.states.lock().await.remove(&key).unwrap_or_default()
    }

    pub async fn get(&self, key: SessionKey) -> DialogState {
        self.states.lock().await.get(&key).cloned().unwrap_or_default()
    }

    pub async fn set(&self, key: SessionKey, state: DialogState) {
        let mut states = self.states.lock().await;
        if state == DialogState::Idle {
            states.remove(&key);
        } else {
            states.insert(key, state);
        }
    }
}
