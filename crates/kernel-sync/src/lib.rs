/// Kernel synchronization for the annotator widget.
/// Keeps one logical annotator state consistent between the local store
/// and a remote kernel-side mirror via patches, action replay and RPC.
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod app;
pub use app::*;

mod channel;
pub use channel::*;

mod manager;
pub use manager::*;

mod protocol;
pub use protocol::*;

mod registry;
pub use registry::*;

mod report;
pub use report::*;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("state error: {0}")]
    State(#[from] annotator::AnnotatorError),

    #[error("{message}")]
    Application { message: String, line: Option<u32> },

    #[error("no application bound")]
    NoApplication,

    #[error("method not in descriptor: {0}")]
    UnknownMethod(String),

    #[error("remote call `{0}` timed out")]
    CallTimeout(String),

    #[error("manager disposed")]
    Disposed,

    #[error("malformed `{method}` payload: {reason}")]
    Payload { method: String, reason: String },
}

impl SyncError {
    /// Application-logic fault, optionally tagged with the line of the
    /// peer-authored source it originated from.
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application {
            message: message.into(),
            line: None,
        }
    }

    pub fn application_at(message: impl Into<String>, line: u32) -> Self {
        Self::Application {
            message: message.into(),
            line: Some(line),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Identity of one sync manager instance, attached to outbound action
/// broadcasts so the manager can discard echoes of its own messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Correlation id for one outstanding remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallbackId(pub uuid::Uuid);

impl CallbackId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for CallbackId {
    fn default() -> Self {
        Self::new()
    }
}
