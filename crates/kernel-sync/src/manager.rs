/// The sync manager: one instance per annotator document, bridging the
/// local store and the kernel-side mirror of the same state.
///
/// Remote-triggered state edits are serialized through a single queue so
/// at most one edit is in flight at a time; every local edit the peer must
/// mirror is shipped as a structural patch against a known-matching prior
/// snapshot rather than a full-state broadcast.
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use annotator::{self, Action, Store};

use crate::{
    methods, AppDescriptor, Application, ApplicationFactory, CallbackId, ChannelEndpoint,
    ChannelHandle, Envelope, ErrorReporter, MethodCallData, MethodReturnData, Notice, PatchData,
    PeerHandle, PeerSource, PeerStatus, Result, SessionId, SyncData, SyncError, TracingReporter,
};

/// Configuration for one sync manager.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Logical channel name identifying the peer endpoint. At most one
    /// open channel of this name is expected per session.
    pub channel_name: String,

    /// Optional expiry for outstanding remote calls. `None` keeps a call
    /// pending until its reply arrives or the manager is disposed.
    pub call_timeout: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel_name: "annotator".to_string(),
            call_timeout: None,
        }
    }
}

/// Connection lifecycle relative to the peer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Observer notified when the remote application object is (re)installed.
pub trait View: Send + Sync {
    fn show_content(&self);
}

/// Callable action handler published by a rendered view.
pub type ViewAction = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

struct AppBinding {
    descriptor: AppDescriptor,
    object: Option<Arc<dyn Application>>,
    source: PeerSource,
}

/// Mutable working copy of the state handed to a queued edit. The edit
/// mutates the draft freely, may await remote calls mid-edit, and hands
/// the draft back for finalization.
pub struct Edit {
    draft: Value,
    manager: SyncManager,
}

impl Edit {
    pub fn draft(&self) -> &Value {
        &self.draft
    }

    pub fn draft_mut(&mut self) -> &mut Value {
        &mut self.draft
    }

    /// Invoke a remote procedure while this edit is in flight. The edit
    /// queue stays parked on this edit until the reply arrives.
    pub async fn remote_call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.manager.remote_call(name, args).await
    }
}

type EditFn = Box<dyn FnOnce(Edit) -> BoxFuture<'static, Result<Edit>> + Send>;

struct QueuedEdit {
    label: String,
    frontend_only: bool,
    run: EditFn,
}

struct ManagerInner {
    session_id: SessionId,
    config: SyncConfig,
    created_at: chrono::DateTime<chrono::Utc>,
    store: Mutex<Store>,
    channel: RwLock<Option<ChannelHandle>>,
    connection: RwLock<ConnectionState>,
    callbacks: Mutex<HashMap<CallbackId, oneshot::Sender<Value>>>,
    app: RwLock<Option<AppBinding>>,
    factory: RwLock<Option<Arc<dyn ApplicationFactory>>>,
    views: Mutex<Vec<Arc<dyn View>>>,
    view_actions: Mutex<HashMap<String, HashMap<String, ViewAction>>>,
    reporter: Arc<dyn ErrorReporter>,
    edits: Mutex<Option<mpsc::UnboundedSender<QueuedEdit>>>,
    inbound_pump: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<ManagerInner>,
}

impl SyncManager {
    pub fn new(config: SyncConfig, store: Store) -> Self {
        Self::with_reporter(config, store, Arc::new(TracingReporter))
    }

    pub fn with_reporter(
        config: SyncConfig,
        store: Store,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let (edits_tx, edits_rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(ManagerInner {
                session_id: SessionId::new(),
                config,
                created_at: chrono::Utc::now(),
                store: Mutex::new(store),
                channel: RwLock::new(None),
                connection: RwLock::new(ConnectionState::Disconnected),
                callbacks: Mutex::new(HashMap::new()),
                app: RwLock::new(None),
                factory: RwLock::new(None),
                views: Mutex::new(Vec::new()),
                view_actions: Mutex::new(HashMap::new()),
                reporter,
                edits: Mutex::new(Some(edits_tx)),
                inbound_pump: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        };
        tokio::spawn(edit_pump(Arc::downgrade(&manager.inner), edits_rx));
        manager
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.session_id
    }

    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.inner.created_at
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.inner.connection.read().await
    }

    /// Current state snapshot.
    pub async fn state(&self) -> Value {
        self.inner.store.lock().await.state().clone()
    }

    /// Outstanding remote calls awaiting their `method_return`.
    pub async fn pending_calls(&self) -> usize {
        self.inner.callbacks.lock().await.len()
    }

    // ------------------------------------------------------------------
    // Connection protocol
    // ------------------------------------------------------------------

    /// The peer process was swapped. Detaches from the previous peer's
    /// channel and, if a new peer is present, attaches to an already-open
    /// channel of the configured name or stays connecting until one opens.
    pub async fn peer_changed(&self, peer: Option<&dyn PeerHandle>) {
        self.detach_channel().await;
        *self.inner.connection.write().await = ConnectionState::Disconnected;

        let Some(peer) = peer else {
            info!(session = %self.inner.session_id.0, "peer gone, disconnected");
            return;
        };

        *self.inner.connection.write().await = ConnectionState::Connecting;
        let mut endpoints = peer.open_channels(&self.inner.config.channel_name);
        if endpoints.is_empty() {
            debug!(
                channel = %self.inner.config.channel_name,
                "no open channel yet, waiting for channel_opened"
            );
            return;
        }
        if endpoints.len() > 1 {
            warn!(
                channel = %self.inner.config.channel_name,
                count = endpoints.len(),
                "multiple open channels, attaching to the first"
            );
        }
        self.channel_opened(endpoints.remove(0)).await;
    }

    /// A channel of this manager's name opened on the peer. Attaches,
    /// starts pumping inbound messages and immediately requests a full
    /// state push.
    pub async fn channel_opened(&self, endpoint: ChannelEndpoint) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }

        self.detach_channel().await;

        let ChannelEndpoint {
            handle,
            mut inbound,
        } = endpoint;
        *self.inner.channel.write().await = Some(handle);

        let weak = Arc::downgrade(&self.inner);
        let pump = tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                SyncManager { inner }.handle_message(envelope).await;
            }
            debug!("inbound channel closed");
        });
        *self.inner.inbound_pump.lock().await = Some(pump);

        self.send(Envelope::sync_request()).await;
        *self.inner.connection.write().await = ConnectionState::Connected;
        info!(
            session = %self.inner.session_id.0,
            channel = %self.inner.config.channel_name,
            "channel attached, state sync requested"
        );
    }

    /// Peer status transitions are observed but trigger no teardown;
    /// recovery is driven by `peer_changed`/`channel_opened`.
    pub async fn peer_status(&self, status: PeerStatus) {
        warn!(session = %self.inner.session_id.0, ?status, "peer status changed");
    }

    async fn detach_channel(&self) {
        if let Some(pump) = self.inner.inbound_pump.lock().await.take() {
            pump.abort();
        }
        *self.inner.channel.write().await = None;
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Best-effort send. With no attached channel the message is dropped.
    pub async fn send(&self, envelope: Envelope) {
        match self.inner.channel.read().await.as_ref() {
            Some(channel) => channel.send(envelope),
            None => debug!(method = %envelope.method, "no open channel, dropping outbound message"),
        }
    }

    pub async fn send_sync_request(&self) {
        self.send(Envelope::sync_request()).await;
    }

    /// Broadcast an action stamped with this session's id so the echo the
    /// peer sends back to all listeners is recognized and skipped.
    pub async fn broadcast_action(&self, action: &Action) {
        self.send(Envelope::action(action, self.inner.session_id)).await;
    }

    /// Invoke a named method on the peer and await its correlated reply.
    pub async fn remote_call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(SyncError::Disposed);
        }

        let callback_id = CallbackId::new();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .callbacks
            .lock()
            .await
            .insert(callback_id, reply_tx);

        self.send(Envelope::method_call(name, args, callback_id)).await;

        let reply = match self.inner.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, reply_rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.inner.callbacks.lock().await.remove(&callback_id);
                    return Err(SyncError::CallTimeout(name.to_string()));
                }
            },
            None => reply_rx.await,
        };

        reply.map_err(|_| SyncError::Disposed)
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    /// Route one inbound envelope. Unknown methods and malformed payloads
    /// are logged and dropped; nothing here re-throws.
    pub async fn handle_message(&self, envelope: Envelope) {
        let Envelope {
            method,
            data,
            metadata,
        } = envelope;

        match method.as_str() {
            methods::ACTION => {
                if metadata.except_id == Some(self.inner.session_id) {
                    debug!("skipping echo of our own action broadcast");
                    return;
                }
                match serde_json::from_value::<Action>(data) {
                    Ok(action) => {
                        let outcome = self.inner.store.lock().await.dispatch(&action);
                        if let Err(e) = outcome {
                            self.handle_error(e.into()).await;
                        }
                    }
                    Err(e) => self.drop_payload(&method, &e).await,
                }
            }

            methods::PATCH => match serde_json::from_value::<PatchData>(data) {
                Ok(PatchData { patches }) => {
                    let mut store = self.inner.store.lock().await;
                    match annotator::apply(store.state(), &patches) {
                        Ok(next) => {
                            if let Err(e) = store.dispatch(&Action::set_state(next)) {
                                drop(store);
                                self.handle_error(e.into()).await;
                            }
                        }
                        Err(e) => {
                            // State is left at its pre-patch value; resync
                            // is up to the host (send_sync_request).
                            warn!("failed to apply peer patch set: {e}");
                        }
                    }
                }
                Err(e) => self.drop_payload(&method, &e).await,
            },

            methods::METHOD_CALL => match serde_json::from_value::<MethodCallData>(data) {
                Ok(call) => {
                    if let Err(e) = self.invoke_app(&call.method_name, call.args).await {
                        self.handle_error(e).await;
                    }
                }
                Err(e) => self.drop_payload(&method, &e).await,
            },

            methods::METHOD_RETURN => match serde_json::from_value::<MethodReturnData>(data) {
                Ok(MethodReturnData { callback_id, value }) => {
                    match self.inner.callbacks.lock().await.remove(&callback_id) {
                        Some(reply_tx) => {
                            let _ = reply_tx.send(value);
                        }
                        None => debug!("method_return for unknown callback, ignoring"),
                    }
                }
                Err(e) => self.drop_payload(&method, &e).await,
            },

            methods::SET_APP_CODE => match serde_json::from_value::<AppDescriptor>(data) {
                Ok(descriptor) => self.install_app(descriptor).await,
                Err(e) => self.drop_payload(&method, &e).await,
            },

            methods::SYNC => match serde_json::from_value::<SyncData>(data) {
                Ok(SyncData { state }) => {
                    let outcome = self
                        .inner
                        .store
                        .lock()
                        .await
                        .dispatch(&Action::set_state(state));
                    if let Err(e) = outcome {
                        self.handle_error(e.into()).await;
                    }
                }
                Err(e) => self.drop_payload(&method, &e).await,
            },

            other => debug!(method = %other, "unknown method, ignoring"),
        }
    }

    async fn drop_payload(&self, method: &str, error: &serde_json::Error) {
        warn!(
            "{}",
            SyncError::Payload {
                method: method.to_string(),
                reason: error.to_string(),
            }
        );
    }

    // ------------------------------------------------------------------
    // Application binding
    // ------------------------------------------------------------------

    /// Register the factory that turns peer descriptors into the local
    /// application object.
    pub async fn bind_factory(&self, factory: Arc<dyn ApplicationFactory>) {
        *self.inner.factory.write().await = Some(factory);
    }

    async fn install_app(&self, descriptor: AppDescriptor) {
        let source = PeerSource::from_descriptor(&descriptor);

        let factory = self.inner.factory.read().await.clone();
        let object = match factory {
            Some(factory) => match factory.build(&descriptor) {
                Ok(object) => Some(object),
                Err(e) => {
                    self.handle_error(e).await;
                    None
                }
            },
            None => {
                warn!("application descriptor received but no factory is registered");
                None
            }
        };

        // The application carries its own reducer; the store follows the
        // binding as it is (re)installed.
        let reducer = object.as_ref().and_then(|object| object.reducer());
        self.inner.store.lock().await.set_reducer(reducer);

        *self.inner.app.write().await = Some(AppBinding {
            descriptor,
            object,
            source,
        });

        for view in self.inner.views.lock().await.iter() {
            view.show_content();
        }
        info!(session = %self.inner.session_id.0, "application descriptor installed");
    }

    async fn invoke_app(&self, method: &str, args: Vec<Value>) -> Result<()> {
        let object = {
            let app = self.inner.app.read().await;
            let binding = app.as_ref().ok_or(SyncError::NoApplication)?;
            if !binding.descriptor.allows(method) {
                return Err(SyncError::UnknownMethod(method.to_string()));
            }
            binding.object.clone().ok_or(SyncError::NoApplication)?
        };
        object.invoke(method, args)
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub async fn register_view(&self, view: Arc<dyn View>) {
        self.inner.views.lock().await.push(view);
    }

    /// Publish callable action handlers for one editor.
    pub async fn register_actions(
        &self,
        editor_id: impl Into<String>,
        actions: HashMap<String, ViewAction>,
    ) {
        self.inner
            .view_actions
            .lock()
            .await
            .insert(editor_id.into(), actions);
    }

    pub async fn view_action(&self, editor_id: &str, name: &str) -> Option<ViewAction> {
        self.inner
            .view_actions
            .lock()
            .await
            .get(editor_id)
            .and_then(|actions| actions.get(name))
            .cloned()
    }

    // ------------------------------------------------------------------
    // Serialized local-mutation execution
    // ------------------------------------------------------------------

    /// Run a fallible handler now. Failures are reported, never re-thrown.
    pub async fn try_exec<R>(&self, handler: impl FnOnce() -> Result<R>) -> Option<R> {
        match handler() {
            Ok(value) => Some(value),
            Err(e) => {
                self.handle_error(e).await;
                None
            }
        }
    }

    /// Queue an edit of the shared state. Edits run strictly one at a
    /// time in submission order; the resulting patch set is applied
    /// locally and transmitted to the peer.
    pub async fn queue_edit<F, Fut>(&self, label: impl Into<String>, edit: F)
    where
        F: FnOnce(Edit) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Edit>> + Send + 'static,
    {
        self.enqueue(label.into(), false, Box::new(move |scope| edit(scope).boxed()))
            .await;
    }

    /// Like `queue_edit`, but the resulting patch is applied locally only
    /// and intentionally not transmitted to the peer.
    pub async fn queue_edit_frontend<F, Fut>(&self, label: impl Into<String>, edit: F)
    where
        F: FnOnce(Edit) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Edit>> + Send + 'static,
    {
        self.enqueue(label.into(), true, Box::new(move |scope| edit(scope).boxed()))
            .await;
    }

    async fn enqueue(&self, label: String, frontend_only: bool, run: EditFn) {
        let queue = self.inner.edits.lock().await;
        match queue.as_ref() {
            Some(tx) => {
                if tx
                    .send(QueuedEdit {
                        label: label.clone(),
                        frontend_only,
                        run,
                    })
                    .is_err()
                {
                    warn!(label = %label, "edit queue closed, dropping edit");
                }
            }
            None => warn!(label = %label, "manager disposed, dropping edit"),
        }
    }

    async fn run_edit(&self, edit: QueuedEdit) {
        debug!(label = %edit.label, "running queued edit");

        let snapshot = self.state().await;
        let scope = Edit {
            draft: snapshot.clone(),
            manager: self.clone(),
        };

        let finalized = match (edit.run)(scope).await {
            Ok(scope) => scope.draft,
            Err(e) => {
                self.handle_error(e).await;
                return;
            }
        };

        let patches = annotator::diff(&snapshot, &finalized);
        if patches.is_empty() {
            return;
        }

        let outcome = self
            .inner
            .store
            .lock()
            .await
            .dispatch(&Action::set_state(finalized));
        if let Err(e) = outcome {
            self.handle_error(e.into()).await;
            return;
        }

        if !edit.frontend_only {
            self.send(Envelope::patch(patches)).await;
        }
    }

    // ------------------------------------------------------------------
    // Error reporting
    // ------------------------------------------------------------------

    /// Surface a fault as a user-visible notice, translating application
    /// errors back to the peer-authored source line when possible.
    pub async fn handle_error(&self, error: SyncError) {
        let message = match &error {
            SyncError::Application {
                message,
                line: Some(line),
            } => {
                let app = self.inner.app.read().await;
                match app.as_ref().and_then(|b| b.source.resolve_line(*line)) {
                    Some((source_line, text)) => {
                        format!("Error: {message} at line {source_line}: {text}")
                    }
                    None => format!("Error: {message}"),
                }
            }
            other => format!("Error: {other}"),
        };
        self.inner.reporter.report(Notice { message });
    }

    // ------------------------------------------------------------------
    // Disposal
    // ------------------------------------------------------------------

    /// Stop edit intake, detach the channel and fail all pending remote
    /// calls. Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        *self.inner.edits.lock().await = None;
        self.detach_channel().await;
        self.inner.callbacks.lock().await.clear();
        *self.inner.connection.write().await = ConnectionState::Disconnected;
        info!(session = %self.inner.session_id.0, "sync manager disposed");
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("session_id", &self.inner.session_id)
            .field("channel_name", &self.inner.config.channel_name)
            .field("disposed", &self.inner.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

async fn edit_pump(inner: Weak<ManagerInner>, mut edits: mpsc::UnboundedReceiver<QueuedEdit>) {
    while let Some(edit) = edits.recv().await {
        let Some(strong) = inner.upgrade() else { break };
        SyncManager { inner: strong }.run_edit(edit).await;
    }
    debug!("edit queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_pair;
    use annotator::{AnnotatorError, FnReducer, Store};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tokio::time::sleep;
    use tokio_test::assert_ok;

    struct RecordingReporter(StdMutex<Vec<String>>);

    impl RecordingReporter {
        fn new() -> Arc<Self> {
            Arc::new(Self(StdMutex::new(Vec::new())))
        }

        fn notices(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl ErrorReporter for RecordingReporter {
        fn report(&self, notice: Notice) {
            self.0.lock().unwrap().push(notice.message);
        }
    }

    fn counting_store() -> Store {
        let reducer = FnReducer(|state: &Value, action: &Action| {
            let mut next = state.clone();
            match action.kind.as_str() {
                "INCREMENT" => {
                    let count = next["count"].as_i64().unwrap_or(0);
                    next["count"] = json!(count + 1);
                    Ok(next)
                }
                other => Err(AnnotatorError::Reducer {
                    action: other.to_string(),
                    reason: "unknown action".to_string(),
                }),
            }
        });
        Store::with_reducer(json!({"count": 0}), Arc::new(reducer))
    }

    async fn settle() {
        sleep(Duration::from_millis(25)).await;
    }

    /// Connect a manager to an in-process peer endpoint and drain the
    /// sync_request it greets a fresh channel with.
    async fn connect(manager: &SyncManager) -> ChannelEndpoint {
        let (ours, mut peer) = channel_pair("annotator");
        manager.channel_opened(ours).await;
        let greeting = peer.inbound.recv().await.unwrap();
        assert_eq!(greeting.method, methods::SYNC_REQUEST);
        peer
    }

    #[tokio::test]
    async fn own_action_echo_is_suppressed() {
        let manager = SyncManager::new(SyncConfig::default(), counting_store());
        let peer = connect(&manager).await;

        let increment = Action::new("INCREMENT");

        // Echo of our own broadcast: must not re-apply.
        peer.handle
            .send(Envelope::action(&increment, manager.session_id()));
        // Same action attributed to another session: must apply.
        peer.handle
            .send(Envelope::action(&increment, SessionId::new()));
        // No metadata at all: must apply.
        peer.handle.send(Envelope::new(
            methods::ACTION,
            serde_json::to_value(&increment).unwrap(),
        ));
        settle().await;

        assert_eq!(manager.state().await["count"], json!(2));
    }

    #[tokio::test]
    async fn remote_call_resolves_on_matching_return_only() {
        let manager = SyncManager::new(SyncConfig::default(), Store::new(json!({})));
        let mut peer = connect(&manager).await;

        let caller = manager.clone();
        let call = tokio::spawn(async move {
            caller.remote_call("foo", vec![json!(1), json!(2)]).await
        });

        let outbound = peer.inbound.recv().await.unwrap();
        assert_eq!(outbound.method, methods::METHOD_CALL);
        let data: MethodCallData = serde_json::from_value(outbound.data).unwrap();
        assert_eq!(data.method_name, "foo");
        assert_eq!(data.args, vec![json!(1), json!(2)]);

        // A return for some other call leaves ours pending.
        peer.handle
            .send(Envelope::method_return(CallbackId::new(), json!(0)));
        settle().await;
        assert!(!call.is_finished());
        assert_eq!(manager.pending_calls().await, 1);

        peer.handle
            .send(Envelope::method_return(data.callback_id, json!(42)));
        let value = assert_ok!(call.await.unwrap());
        assert_eq!(value, json!(42));
        assert_eq!(manager.pending_calls().await, 0);
    }

    #[tokio::test]
    async fn queued_edits_run_one_at_a_time_in_order() {
        let manager = SyncManager::new(SyncConfig::default(), Store::new(json!({})));

        let log: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first_log = log.clone();
        manager
            .queue_edit("first", move |edit| async move {
                first_log.lock().unwrap().push("first-start");
                let _ = release_rx.await;
                first_log.lock().unwrap().push("first-end");
                Ok(edit)
            })
            .await;

        let second_log = log.clone();
        manager
            .queue_edit("second", move |edit| async move {
                second_log.lock().unwrap().push("second");
                Ok(edit)
            })
            .await;

        settle().await;
        // The second edit must not begin while the first is suspended.
        assert_eq!(*log.lock().unwrap(), vec!["first-start"]);

        release_tx.send(()).unwrap();
        settle().await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first-start", "first-end", "second"]
        );
    }

    #[tokio::test]
    async fn failing_edit_does_not_block_later_edits() {
        let reporter = RecordingReporter::new();
        let manager = SyncManager::with_reporter(
            SyncConfig::default(),
            Store::new(json!({})),
            reporter.clone(),
        );

        manager
            .queue_edit("broken", |_edit| async move {
                Err(SyncError::application("boom"))
            })
            .await;
        manager
            .queue_edit("follow-up", |mut edit| async move {
                edit.draft_mut()["done"] = json!(true);
                Ok(edit)
            })
            .await;
        settle().await;

        assert_eq!(manager.state().await["done"], json!(true));
        let notices = reporter.notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].contains("boom"));
    }

    #[tokio::test]
    async fn reconnect_resync_replaces_state_without_emitting_patches() {
        let manager = SyncManager::new(SyncConfig::default(), Store::new(json!({"count": 0})));
        let _old_peer = connect(&manager).await;

        // Peer restart: the old channel goes away, a fresh one opens.
        manager.peer_changed(None).await;
        assert_eq!(
            manager.connection_state().await,
            ConnectionState::Disconnected
        );

        let mut peer = connect(&manager).await;
        assert_eq!(manager.connection_state().await, ConnectionState::Connected);

        peer.handle.send(Envelope::sync(json!({"count": 5})));
        settle().await;

        assert_eq!(manager.state().await["count"], json!(5));
        // Applying a sync must not send anything back.
        assert!(peer.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn queued_edit_ships_its_patch_to_the_peer() {
        let manager = SyncManager::new(SyncConfig::default(), Store::new(json!({"rows": []})));
        let mut peer = connect(&manager).await;

        manager
            .queue_edit("add row", |mut edit| async move {
                edit.draft_mut()["rows"]
                    .as_array_mut()
                    .expect("rows")
                    .push(json!({"label": "r0"}));
                Ok(edit)
            })
            .await;
        settle().await;

        assert_eq!(manager.state().await["rows"][0]["label"], json!("r0"));

        let outbound = peer.inbound.recv().await.unwrap();
        assert_eq!(outbound.method, methods::PATCH);
        let data: PatchData = serde_json::from_value(outbound.data).unwrap();
        assert!(!data.patches.is_empty());
    }

    #[tokio::test]
    async fn frontend_only_edit_stays_local() {
        let manager = SyncManager::new(SyncConfig::default(), Store::new(json!({})));
        let mut peer = connect(&manager).await;

        manager
            .queue_edit_frontend("select row", |mut edit| async move {
                edit.draft_mut()["selection"] = json!({"row": 2});
                Ok(edit)
            })
            .await;
        settle().await;

        assert_eq!(manager.state().await["selection"]["row"], json!(2));
        assert!(peer.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn no_op_edit_emits_nothing() {
        let manager = SyncManager::new(SyncConfig::default(), Store::new(json!({"n": 1})));
        let mut peer = connect(&manager).await;

        manager.queue_edit("no-op", |edit| async move { Ok(edit) }).await;
        settle().await;

        assert_eq!(manager.state().await, json!({"n": 1}));
        assert!(peer.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_patch_is_dropped_and_state_kept() {
        let manager = SyncManager::new(SyncConfig::default(), Store::new(json!({"a": 1})));
        let peer = connect(&manager).await;

        // Removing a key that does not exist cannot apply.
        peer.handle.send(Envelope::new(
            methods::PATCH,
            json!({"patches": [{"op": "remove", "path": ["missing"]}]}),
        ));
        settle().await;

        assert_eq!(manager.state().await, json!({"a": 1}));
    }

    struct RecordingApp(Arc<StdMutex<Vec<(String, Vec<Value>)>>>);

    impl Application for RecordingApp {
        fn invoke(&self, method: &str, args: Vec<Value>) -> Result<()> {
            if method == "fail" {
                return Err(SyncError::application_at("kaboom", 10));
            }
            self.0.lock().unwrap().push((method.to_string(), args));
            Ok(())
        }
    }

    struct RecordingFactory(Arc<StdMutex<Vec<(String, Vec<Value>)>>>);

    impl ApplicationFactory for RecordingFactory {
        fn build(&self, _descriptor: &AppDescriptor) -> Result<Arc<dyn Application>> {
            Ok(Arc::new(RecordingApp(self.0.clone())))
        }
    }

    struct CountingView(StdMutex<usize>);

    impl View for CountingView {
        fn show_content(&self) {
            *self.0.lock().unwrap() += 1;
        }
    }

    fn test_descriptor() -> AppDescriptor {
        AppDescriptor {
            methods: vec!["recompute".to_string(), "fail".to_string()],
            source: "rows = annotate(text)\nraise ValueError(reason)\n".to_string(),
            sourcemap: vec![crate::SourceMapEntry {
                generated: 10,
                source: 2,
            }],
        }
    }

    #[tokio::test]
    async fn set_app_code_installs_binding_and_notifies_views() {
        let reporter = RecordingReporter::new();
        let manager = SyncManager::with_reporter(
            SyncConfig::default(),
            Store::new(json!({})),
            reporter.clone(),
        );
        let peer = connect(&manager).await;

        let invocations = Arc::new(StdMutex::new(Vec::new()));
        manager
            .bind_factory(Arc::new(RecordingFactory(invocations.clone())))
            .await;
        let view = Arc::new(CountingView(StdMutex::new(0)));
        manager.register_view(view.clone()).await;

        peer.handle.send(Envelope::set_app_code(&test_descriptor()));
        settle().await;
        assert_eq!(*view.0.lock().unwrap(), 1);

        // A declared method dispatches to the application object.
        peer.handle.send(Envelope::new(
            methods::METHOD_CALL,
            json!({
                "method_name": "recompute",
                "args": [7],
                "callback_id": CallbackId::new(),
            }),
        ));
        settle().await;
        assert_eq!(
            invocations.lock().unwrap().clone(),
            vec![("recompute".to_string(), vec![json!(7)])]
        );

        // A method outside the descriptor is rejected, not invoked.
        peer.handle.send(Envelope::new(
            methods::METHOD_CALL,
            json!({
                "method_name": "shutdown",
                "args": [],
                "callback_id": CallbackId::new(),
            }),
        ));
        settle().await;
        assert_eq!(invocations.lock().unwrap().len(), 1);
        assert!(reporter
            .notices()
            .iter()
            .any(|n| n.contains("method not in descriptor")));
    }

    struct ReducingApp;

    impl Application for ReducingApp {
        fn invoke(&self, _method: &str, _args: Vec<Value>) -> Result<()> {
            Ok(())
        }

        fn reducer(&self) -> Option<Arc<dyn annotator::Reducer>> {
            let marker: Arc<dyn annotator::Reducer> =
                Arc::new(FnReducer(|state: &Value, action: &Action| {
                    let mut next = state.clone();
                    if action.kind == "MARK" {
                        next["marked"] = json!(true);
                    }
                    Ok(next)
                }));
            Some(marker)
        }
    }

    struct ReducingFactory;

    impl ApplicationFactory for ReducingFactory {
        fn build(&self, _descriptor: &AppDescriptor) -> Result<Arc<dyn Application>> {
            Ok(Arc::new(ReducingApp))
        }
    }

    #[tokio::test]
    async fn installing_the_app_wires_its_reducer_into_the_store() {
        let manager = SyncManager::new(SyncConfig::default(), Store::new(json!({})));
        let peer = connect(&manager).await;

        // Before the binding arrives, peer actions are inert.
        peer.handle
            .send(Envelope::action(&Action::new("MARK"), SessionId::new()));
        settle().await;
        assert_eq!(manager.state().await, json!({}));

        manager.bind_factory(Arc::new(ReducingFactory)).await;
        peer.handle.send(Envelope::set_app_code(&test_descriptor()));
        settle().await;

        peer.handle
            .send(Envelope::action(&Action::new("MARK"), SessionId::new()));
        settle().await;
        assert_eq!(manager.state().await["marked"], json!(true));
    }

    #[tokio::test]
    async fn application_errors_are_translated_to_source_lines() {
        let reporter = RecordingReporter::new();
        let manager = SyncManager::with_reporter(
            SyncConfig::default(),
            Store::new(json!({})),
            reporter.clone(),
        );
        let peer = connect(&manager).await;

        manager
            .bind_factory(Arc::new(RecordingFactory(Arc::new(StdMutex::new(
                Vec::new(),
            )))))
            .await;
        peer.handle.send(Envelope::set_app_code(&test_descriptor()));
        settle().await;

        peer.handle.send(Envelope::new(
            methods::METHOD_CALL,
            json!({
                "method_name": "fail",
                "args": [],
                "callback_id": CallbackId::new(),
            }),
        ));
        settle().await;

        let notices = reporter.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(
            notices[0],
            "Error: kaboom at line 2: raise ValueError(reason)"
        );
    }

    #[tokio::test]
    async fn dispose_fails_pending_remote_calls() {
        let manager = SyncManager::new(SyncConfig::default(), Store::new(json!({})));
        let _peer = connect(&manager).await;

        let caller = manager.clone();
        let call = tokio::spawn(async move { caller.remote_call("slow", vec![]).await });
        settle().await;
        assert_eq!(manager.pending_calls().await, 1);

        manager.dispose().await;
        let outcome = call.await.unwrap();
        assert!(matches!(outcome, Err(SyncError::Disposed)));
    }

    #[tokio::test]
    async fn remote_call_times_out_when_configured() {
        let config = SyncConfig {
            call_timeout: Some(Duration::from_millis(30)),
            ..SyncConfig::default()
        };
        let manager = SyncManager::new(config, Store::new(json!({})));
        let _peer = connect(&manager).await;

        let outcome = manager.remote_call("never", vec![]).await;
        assert!(matches!(outcome, Err(SyncError::CallTimeout(_))));
        // The abandoned callback record is reclaimed.
        assert_eq!(manager.pending_calls().await, 0);
    }

    #[tokio::test]
    async fn edit_can_call_remote_mid_mutation() {
        let manager = SyncManager::new(SyncConfig::default(), Store::new(json!({"rows": []})));
        let mut peer = connect(&manager).await;

        manager
            .queue_edit("fetch label", |mut edit| async move {
                let label = edit.remote_call("next_label", vec![]).await?;
                edit.draft_mut()["rows"]
                    .as_array_mut()
                    .expect("rows")
                    .push(label);
                Ok(edit)
            })
            .await;

        // Answer the call issued from inside the suspended edit.
        let outbound = peer.inbound.recv().await.unwrap();
        let data: MethodCallData = serde_json::from_value(outbound.data).unwrap();
        assert_eq!(data.method_name, "next_label");
        peer.handle
            .send(Envelope::method_return(data.callback_id, json!("r9")));
        settle().await;

        assert_eq!(manager.state().await["rows"][0], json!("r9"));
        let patch = peer.inbound.recv().await.unwrap();
        assert_eq!(patch.method, methods::PATCH);
    }

    #[tokio::test]
    async fn try_exec_reports_and_swallows() {
        let reporter = RecordingReporter::new();
        let manager = SyncManager::with_reporter(
            SyncConfig::default(),
            Store::new(json!({})),
            reporter.clone(),
        );

        let ok = manager.try_exec(|| Ok(5)).await;
        assert_eq!(ok, Some(5));

        let failed: Option<()> = manager
            .try_exec(|| Err(SyncError::application("handler blew up")))
            .await;
        assert_eq!(failed, None);
        assert!(reporter.notices()[0].contains("handler blew up"));
    }

    #[tokio::test]
    async fn view_actions_are_registered_per_editor() {
        let manager = SyncManager::new(SyncConfig::default(), Store::new(json!({})));

        let hits = Arc::new(StdMutex::new(0usize));
        let hits_in_action = hits.clone();
        let mut actions: HashMap<String, ViewAction> = HashMap::new();
        actions.insert(
            "bump".to_string(),
            Arc::new(move |_args| {
                *hits_in_action.lock().unwrap() += 1;
            }),
        );
        manager.register_actions("table-editor", actions).await;

        let action = manager.view_action("table-editor", "bump").await.unwrap();
        action(vec![]);
        assert_eq!(*hits.lock().unwrap(), 1);
        assert!(manager.view_action("table-editor", "missing").await.is_none());
        assert!(manager.view_action("text-editor", "bump").await.is_none());
    }
}
