use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error};
use uuid::Uuid;

use kernel_sync::Envelope;

pub type Tx = mpsc::UnboundedSender<Message>;
pub type SessionMap = Arc<RwLock<HashMap<String, Session>>>;

/// One mirrored annotator document, keyed by its channel path.
pub struct Session {
    /// The server-side mirror of the shared state.
    pub state: Value,
    pub clients: HashMap<Uuid, Tx>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: Value::Object(serde_json::Map::new()),
            clients: HashMap::new(),
            created_at: chrono::Utc::now(),
        }
    }

    pub fn add_client(&mut self, client_id: Uuid, tx: Tx) {
        self.clients.insert(client_id, tx);
    }

    pub fn remove_client(&mut self, client_id: &Uuid) {
        self.clients.remove(client_id);
    }

    /// Forward an envelope to connected clients, optionally skipping one.
    pub fn broadcast(&self, envelope: &Envelope, exclude: Option<Uuid>) {
        let json = match serde_json::to_string(envelope) {
            Ok(json) => json,
            Err(e) => {
                error!("failed to serialize envelope for broadcast: {e}");
                return;
            }
        };

        for (client_id, tx) in &self.clients {
            if Some(*client_id) == exclude {
                continue;
            }
            if tx.send(Message::Text(json.clone())).is_err() {
                debug!(client = %client_id, "client channel closed, skipping");
            }
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize and queue one envelope for a single client.
pub fn send_envelope(tx: &Tx, envelope: &Envelope) {
    match serde_json::to_string(envelope) {
        Ok(json) => {
            if tx.send(Message::Text(json)).is_err() {
                debug!("client channel closed, dropping envelope");
            }
        }
        Err(e) => error!("failed to serialize envelope: {e}"),
    }
}
