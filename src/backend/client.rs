use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;

const CHAT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    pub response: String,
}

/// Relays chat questions to the RAG backend's `/rag` endpoint.
#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(config: &BackendConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .timeout(CHAT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn ask(&self, message: &str) -> Result<ChatReply, reqwest::Error> {
        self.http
            .post(format!("{}/rag", self.base_url))
            .json(&ChatRequest {
                message: message.to_string(),
            })
            .send()
            .await?
            .error_for_status()?
            .json::<ChatReply>()
            .await
    }
}
