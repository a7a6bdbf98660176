/// Wire protocol between the manager and its kernel-side peer.
///
/// Every message is a JSON envelope `{ "method": ..., "data": ... }`,
/// optionally carrying `metadata.exceptId` on action broadcasts. Host
/// transports may add their own envelope fields; anything not listed here
/// is ignored.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use annotator::{Action, PatchOp};

use crate::{AppDescriptor, CallbackId, SessionId};

/// Method vocabulary, exhaustive from the client's perspective.
pub mod methods {
    /// Outbound: ask the peer to push its full current state.
    pub const SYNC_REQUEST: &str = "sync_request";
    /// Both directions: a reducer action to replay.
    pub const ACTION: &str = "action";
    /// Both directions: a structural patch set against the shared state.
    pub const PATCH: &str = "patch";
    /// Both directions: invoke a named method on the remote side.
    pub const METHOD_CALL: &str = "method_call";
    /// Inbound: the correlated reply to an earlier `method_call`.
    pub const METHOD_RETURN: &str = "method_return";
    /// Inbound: the peer announces its application capability descriptor.
    pub const SET_APP_CODE: &str = "set_app_code";
    /// Inbound: full-state resync.
    pub const SYNC: &str = "sync";
}

/// Host-level metadata attached to an envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(
        rename = "exceptId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub except_id: Option<SessionId>,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self.except_id.is_none()
    }
}

/// One wire message. `method` selects the handling; `data` carries the
/// method-specific body and is `null` for data-less methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub method: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,

    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

/// `data` body of a `patch` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchData {
    pub patches: Vec<PatchOp>,
}

/// `data` body of a `method_call` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodCallData {
    pub method_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    pub callback_id: CallbackId,
}

/// `data` body of a `method_return` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodReturnData {
    pub callback_id: CallbackId,
    #[serde(default)]
    pub value: Value,
}

/// `data` body of a `sync` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncData {
    pub state: Value,
}

fn to_data<T: Serialize>(body: &T) -> Value {
    match serde_json::to_value(body) {
        Ok(value) => value,
        Err(e) => {
            error!("failed to serialize envelope data: {e}");
            Value::Null
        }
    }
}

impl Envelope {
    pub fn new(method: impl Into<String>, data: Value) -> Self {
        Self {
            method: method.into(),
            data,
            metadata: Metadata::default(),
        }
    }

    pub fn sync_request() -> Self {
        Self::new(methods::SYNC_REQUEST, Value::Null)
    }

    /// Action broadcast stamped with the sending session so the sender can
    /// recognize its own echo.
    pub fn action(action: &Action, session: SessionId) -> Self {
        let mut envelope = Self::new(methods::ACTION, to_data(action));
        envelope.metadata.except_id = Some(session);
        envelope
    }

    pub fn patch(patches: Vec<PatchOp>) -> Self {
        Self::new(methods::PATCH, to_data(&PatchData { patches }))
    }

    pub fn method_call(name: impl Into<String>, args: Vec<Value>, callback_id: CallbackId) -> Self {
        Self::new(
            methods::METHOD_CALL,
            to_data(&MethodCallData {
                method_name: name.into(),
                args,
                callback_id,
            }),
        )
    }

    pub fn method_return(callback_id: CallbackId, value: Value) -> Self {
        Self::new(
            methods::METHOD_RETURN,
            to_data(&MethodReturnData { callback_id, value }),
        )
    }

    pub fn set_app_code(descriptor: &AppDescriptor) -> Self {
        Self::new(methods::SET_APP_CODE, to_data(descriptor))
    }

    pub fn sync(state: Value) -> Self {
        Self::new(methods::SYNC, to_data(&SyncData { state }))
    }
}
