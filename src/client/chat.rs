use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::backend::{BackendApi, ChatReply, ChatRequest, SendError};
use crate::discovery::{DiscoveryEngine, DiscoveryError};

#[derive(Error, Debug)]
pub enum ChatError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("Send to {endpoint} failed: {source}")]
    Send {
        endpoint: String,
        #[source]
        source: SendError,
    },
}

/// Conversation with whichever backend discovery selects.
///
/// A failed send invalidates the selection and re-runs discovery after the
/// engine's backoff, so the next prompt goes to a live endpoint.
pub struct ChatClient {
    engine: DiscoveryEngine,
    backend: Arc<dyn BackendApi>,
    session_id: String,
}

impl ChatClient {
    pub fn new(engine: DiscoveryEngine, backend: Arc<dyn BackendApi>) -> Self {
        Self {
            engine,
            backend,
            session_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn engine(&self) -> &DiscoveryEngine {
        &self.engine
    }

    pub async fn send(&mut self, prompt: &str) -> Result<ChatReply, ChatError> {
        let endpoint = self.engine.ensure_connected().await?;
        let request = ChatRequest::new(prompt).with_session(self.session_id.clone());

        match self.backend.send_prompt(&endpoint.url, &request).await {
            Ok(reply) => {
                if let Some(id) = &reply.session_id {
                    if *id != self.session_id {
                        info!("Backend assigned session {}", id);
                        self.session_id = id.clone();
                    }
                }
                Ok(reply)
            }
            Err(source) => {
                warn!("Send to {} failed: {}", endpoint, source);
                self.engine.rediscover().await;
                Err(ChatError::Send {
                    endpoint: endpoint.url,
                    source,
                })
            }
        }
    }

    /// Tell the connected backend the conversation is over
    pub async fn end(&mut self, satisfaction: Option<u8>) -> Result<(), ChatError> {
        let Some(base) = self.engine.session().base_url().map(str::to_string) else {
            return Ok(());
        };
        self.backend
            .end_conversation(&base, &self.session_id, satisfaction)
            .await
            .map_err(|source| ChatError::Send {
                endpoint: base,
                source,
            })
    }
}
