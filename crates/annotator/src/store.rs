/// Client-side store for the annotator state.
/// Holds one immutable JSON root; every transition installs a new value.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AnnotatorError, Result};

/// Reserved action type that replaces the whole state with the payload,
/// bypassing any registered reducer.
pub const SET_STATE: &str = "SET_STATE";

/// A tagged record consumed by the reducer. Fields beyond `type` and
/// `payload` are carried through untouched so peer-authored actions keep
/// their shape on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Action {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: None,
            extra: Map::new(),
        }
    }

    pub fn with_payload(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload: Some(payload),
            extra: Map::new(),
        }
    }

    /// The full-state-replacement action.
    pub fn set_state(payload: Value) -> Self {
        Self::with_payload(SET_STATE, payload)
    }
}

/// Application-supplied state transition function.
pub trait Reducer: Send + Sync {
    fn reduce(&self, state: &Value, action: &Action) -> Result<Value>;
}

/// Adapter so plain closures can act as reducers.
pub struct FnReducer<F>(pub F);

impl<F> Reducer for FnReducer<F>
where
    F: Fn(&Value, &Action) -> Result<Value> + Send + Sync,
{
    fn reduce(&self, state: &Value, action: &Action) -> Result<Value> {
        (self.0)(state, action)
    }
}

/// Canonical holder of the client-side application state.
pub struct Store {
    state: Value,
    reducer: Option<Arc<dyn Reducer>>,
}

impl Store {
    pub fn new(initial: Value) -> Self {
        Self {
            state: initial,
            reducer: None,
        }
    }

    pub fn with_reducer(initial: Value, reducer: Arc<dyn Reducer>) -> Self {
        Self {
            state: initial,
            reducer: Some(reducer),
        }
    }

    /// Install or clear the reducer. The application object carries its
    /// own reducer, so this follows the app binding as it is replaced.
    pub fn set_reducer(&mut self, reducer: Option<Arc<dyn Reducer>>) {
        self.reducer = reducer;
    }

    /// Current snapshot. Callers must not mutate through interior tricks;
    /// transitions go through `dispatch` or `replace`.
    pub fn state(&self) -> &Value {
        &self.state
    }

    /// Full-state escape hatch. What a `SET_STATE` dispatch performs.
    pub fn replace(&mut self, value: Value) {
        self.state = value;
    }

    /// Apply `reduce(current, action)` and install the result.
    ///
    /// `SET_STATE` replaces the state with the payload verbatim and never
    /// consults the reducer. Any other action goes to the registered
    /// reducer; with none registered the state is left unchanged. Reducer
    /// failures propagate to the caller uncaught.
    pub fn dispatch(&mut self, action: &Action) -> Result<()> {
        if action.kind == SET_STATE {
            self.state = action.payload.clone().unwrap_or(Value::Null);
            return Ok(());
        }

        if let Some(reducer) = &self.reducer {
            self.state = reducer.reduce(&self.state, action)?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("state", &self.state)
            .field("has_reducer", &self.reducer.is_some())
            .finish()
    }
}
