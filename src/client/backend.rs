use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CHAT_PATH: &str = "/api/mental-health";
pub const END_CONVERSATION_PATH: &str = "/api/end-conversation";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Data structures (pure, no I/O)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndConversation {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub satisfaction_score: Option<u8>,
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed backend response: {0}")]
    Malformed(String),
}

pub fn endpoint_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn send_prompt(&self, base_url: &str, request: &ChatRequest)
        -> Result<ChatReply, SendError>;

    async fn end_conversation(
        &self,
        base_url: &str,
        session_id: &str,
        satisfaction: Option<u8>,
    ) -> Result<(), SendError>;
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn post<T: Serialize + Sync>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<reqwest::Response, SendError> {
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| SendError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(SendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

impl Default for HttpBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn send_prompt(
        &self,
        base_url: &str,
        request: &ChatRequest,
    ) -> Result<ChatReply, SendError> {
        let url = endpoint_url(base_url, CHAT_PATH);
        debug!("POST {}", url);
        let response = self.post(&url, request).await?;
        response
            .json::<ChatReply>()
            .await
            .map_err(|e| SendError::Malformed(e.to_string()))
    }

    async fn end_conversation(
        &self,
        base_url: &str,
        session_id: &str,
        satisfaction: Option<u8>,
    ) -> Result<(), SendError> {
        let url = endpoint_url(base_url, END_CONVERSATION_PATH);
        let body = EndConversation {
            session_id: session_id.to_string(),
            satisfaction_score: satisfaction,
        };
        self.post(&url, &body).await.map(|_| ())
    }
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Answers every prompt with an echo, except from bases marked down
    #[derive(Default)]
    pub struct MockBackend {
        down: Mutex<HashSet<String>>,
        prompts: Mutex<Vec<(String, ChatRequest)>>,
        ended: Mutex<Vec<(String, String)>>,
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_down(&self, base_url: &str) {
            self.down.lock().unwrap().insert(base_url.to_string());
        }

        pub fn prompts(&self) -> Vec<(String, ChatRequest)> {
            self.prompts.lock().unwrap().clone()
        }

        pub fn ended(&self) -> Vec<(String, String)> {
            self.ended.lock().unwrap().clone()
        }

        fn check(&self, base_url: &str) -> Result<(), SendError> {
            if self.down.lock().unwrap().contains(base_url) {
                Err(SendError::Http("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl BackendApi for MockBackend {
        async fn send_prompt(
            &self,
            base_url: &str,
            request: &ChatRequest,
        ) -> Result<ChatReply, SendError> {
            self.prompts
                .lock()
                .unwrap()
                .push((base_url.to_string(), request.clone()));
            self.check(base_url)?;
            Ok(ChatReply {
                response: format!("echo: {}", request.prompt),
                session_id: request.session_id.clone(),
                model_version: Some("mock".to_string()),
                quality_score: None,
                response_time_ms: Some(1.0),
            })
        }

        async fn end_conversation(
            &self,
            base_url: &str,
            session_id: &str,
            _satisfaction: Option<u8>,
        ) -> Result<(), SendError> {
            self.check(base_url)?;
            self.ended
                .lock()
                .unwrap()
                .push((base_url.to_string(), session_id.to_string()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = ChatRequest::new("I feel anxious");
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"prompt":"I feel anxious"}"#);

        let req = req.with_session("abc");
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""session_id":"abc""#));
    }

    #[test]
    fn test_reply_deserialization() {
        let json = r#"{
            "response": "That sounds hard.",
            "session_id": "abc",
            "model_version": "gemini-1.5-pro",
            "quality_score": 0.82,
            "response_time_ms": 412.5
        }"#;
        let reply: ChatReply = serde_json::from_str(json).unwrap();
        assert_eq!(reply.response, "That sounds hard.");
        assert_eq!(reply.model_version.as_deref(), Some("gemini-1.5-pro"));

        // Only `response` is required
        let reply: ChatReply = serde_json::from_str(r#"{"response": "ok"}"#).unwrap();
        assert!(reply.session_id.is_none());

        assert!(serde_json::from_str::<ChatReply>(r#"{"reply": "ok"}"#).is_err());
    }

    #[test]
    fn test_endpoint_url() {
        assert_eq!(
            endpoint_url("http://localhost:8000/", CHAT_PATH),
            "http://localhost:8000/api/mental-health"
        );
    }
}
