/// Application capability binding.
///
/// The peer announces its business-logic surface as a descriptor: the
/// enumerated method names plus the peer-authored source retained for
/// error-line translation. Nothing the peer sends is ever executed; the
/// concrete application object is built locally by a registered factory.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use annotator::Reducer;

use crate::Result;

/// Capability descriptor carried by a `set_app_code` envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppDescriptor {
    /// The callable method surface, exhaustive.
    #[serde(default)]
    pub methods: Vec<String>,

    /// Peer-authored source text, kept for error translation only.
    #[serde(default)]
    pub source: String,

    /// Line map from reported (generated) lines into `source`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sourcemap: Vec<SourceMapEntry>,
}

impl AppDescriptor {
    pub fn allows(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }
}

/// One generated-line to source-line mapping. Lines are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMapEntry {
    pub generated: u32,
    pub source: u32,
}

/// The application object `method_call` envelopes are dispatched to.
/// Implementations cover exactly the methods their descriptor enumerates.
pub trait Application: Send + Sync {
    fn invoke(&self, method: &str, args: Vec<Value>) -> Result<()>;

    /// The application's own reducer, installed into the store while this
    /// binding is current. `None` leaves non-`SET_STATE` actions inert.
    fn reducer(&self) -> Option<Arc<dyn Reducer>> {
        None
    }
}

/// Builds the local application object when the peer (re)announces its
/// descriptor.
pub trait ApplicationFactory: Send + Sync {
    fn build(&self, descriptor: &AppDescriptor) -> Result<Arc<dyn Application>>;
}

/// Peer-authored source held for mapping error lines back to their origin.
#[derive(Debug, Clone, Default)]
pub struct PeerSource {
    lines: Vec<String>,
    map: Vec<SourceMapEntry>,
}

impl PeerSource {
    pub fn from_descriptor(descriptor: &AppDescriptor) -> Self {
        Self {
            lines: descriptor.source.lines().map(str::to_string).collect(),
            map: descriptor.sourcemap.clone(),
        }
    }

    /// Resolve a reported line to the original source line and its text.
    pub fn resolve_line(&self, generated: u32) -> Option<(u32, &str)> {
        let entry = self.map.iter().find(|e| e.generated == generated)?;
        let index = (entry.source as usize).checked_sub(1)?;
        let text = self.lines.get(index)?;
        Some((entry.source, text.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> AppDescriptor {
        AppDescriptor {
            methods: vec!["recompute".to_string(), "clear".to_string()],
            source: "def recompute(rows):\n    return relabel(rows)\n".to_string(),
            sourcemap: vec![
                SourceMapEntry {
                    generated: 10,
                    source: 1,
                },
                SourceMapEntry {
                    generated: 11,
                    source: 2,
                },
            ],
        }
    }

    #[test]
    fn descriptor_gates_method_names() {
        let descriptor = descriptor();
        assert!(descriptor.allows("recompute"));
        assert!(!descriptor.allows("shutdown"));
    }

    #[test]
    fn resolve_line_maps_back_into_source() {
        let source = PeerSource::from_descriptor(&descriptor());
        assert_eq!(source.resolve_line(11), Some((2, "return relabel(rows)")));
        assert_eq!(source.resolve_line(99), None);
    }

    #[test]
    fn descriptor_ignores_unknown_wire_fields() {
        let descriptor: AppDescriptor = serde_json::from_value(serde_json::json!({
            "methods": ["recompute"],
            "source": "",
            "py_version": "3.12"
        }))
        .unwrap();
        assert_eq!(descriptor.methods, vec!["recompute"]);
    }
}
