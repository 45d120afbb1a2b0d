pub mod backend;
pub mod chat;

pub use backend::{BackendApi, ChatReply, ChatRequest, HttpBackend, SendError};
pub use chat::{ChatClient, ChatError};
