/// Session-scoped message channel to the kernel-side peer.
///
/// Delivery is best-effort and ordered per channel; there is no
/// acknowledgement and nothing is queued for a peer that is gone.
use tokio::sync::mpsc;
use tracing::debug;

use crate::Envelope;

/// Outbound half of a channel.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    name: String,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl ChannelHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fire-and-forget send. A message for a closed channel is dropped.
    pub fn send(&self, envelope: Envelope) {
        if self.outbound.send(envelope).is_err() {
            debug!(channel = %self.name, "dropping message for closed channel");
        }
    }
}

/// A freshly opened channel: the outbound handle plus the inbound stream
/// the owner is expected to pump.
#[derive(Debug)]
pub struct ChannelEndpoint {
    pub handle: ChannelHandle,
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
}

/// Create a connected pair of endpoints sharing one logical channel name,
/// for in-process peers and tests. Messages sent on either handle arrive
/// on the other endpoint's inbound stream, in order.
pub fn channel_pair(name: impl Into<String>) -> (ChannelEndpoint, ChannelEndpoint) {
    let name = name.into();
    let (left_tx, left_rx) = mpsc::unbounded_channel();
    let (right_tx, right_rx) = mpsc::unbounded_channel();

    (
        ChannelEndpoint {
            handle: ChannelHandle {
                name: name.clone(),
                outbound: left_tx,
            },
            inbound: right_rx,
        },
        ChannelEndpoint {
            handle: ChannelHandle {
                name,
                outbound: right_tx,
            },
            inbound: left_rx,
        },
    )
}

/// Peer process status as observed from the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Restarting,
    Autorestarting,
    Dead,
}

/// Handle onto a peer process, queried during reconnection for channels
/// that are already open under the manager's channel name.
pub trait PeerHandle: Send + Sync {
    /// Open channels matching `name`. At most one is expected; callers
    /// attach to the first.
    fn open_channels(&self, name: &str) -> Vec<ChannelEndpoint>;
}
