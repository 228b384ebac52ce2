//! 记忆层：会话消息与会话存储

pub mod conversation;
pub mod session_store;

pub use conversation::{prompt_window, ConversationMemory, Message, Role};
pub use session_store::{InMemorySessionStore, SessionStore};
