use std::{collections::VecDeque, sync::Arc};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub const HISTORY_CAPACITY: usize = 200;

const USER_NAME: &str = "You";
const USER_AVATAR: &str = "/images/beginner.png";
const BOT_NAME: &str = "AI Bot";
const BOT_AVATAR: &str = "/images/expert.png";

/// One chat bubble, in the shape the chat page renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub user: String,
    pub avatar: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistorySnapshot {
    pub history: Vec<ChatMessage>,
}

/// Exchanges relayed through this host, oldest first. The backend keeps no
/// history of its own.
#[derive(Clone)]
pub struct ChatHistory {
    messages: Arc<Mutex<VecDeque<ChatMessage>>>,
    capacity: usize,
}

impl ChatHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(256)))),
            capacity: capacity.max(2),
        }
    }

    pub async fn record_exchange(&self, question: &str, answer: &str) {
        let millis = Utc::now().timestamp_millis();
        let mut messages = self.messages.lock().await;
        messages.push_back(ChatMessage {
            id: millis.to_string(),
            text: question.to_string(),
            user: USER_NAME.to_string(),
            avatar: USER_AVATAR.to_string(),
        });
        messages.push_back(ChatMessage {
            id: (millis + 1).to_string(),
            text: answer.to_string(),
            user: BOT_NAME.to_string(),
            avatar: BOT_AVATAR.to_string(),
        });
        while messages.len() > self.capacity {
            messages.pop_front();
        }
    }

    pub async fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            history: self.messages.lock().await.iter().cloned().collect(),
        }
    }
}
