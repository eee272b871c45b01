//! Lifecycle controller for conversation monitoring
//!
//! Wires folder and account notifications to the operation queue, runs the
//! queue's single consumer, and owns the conversation set. External
//! callbacks never mutate the set; they enqueue operations (flag refreshes
//! are the one sanctioned in-place update). On connection loss the
//! controller stops with `retrying` set, waits, and starts again until the
//! session token is cancelled.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::account::{AccountAdapter, AccountEvent};
use crate::conversation::Conversation;
use crate::conversation_set::{AddResult, ConversationSet};
use crate::email::EmailId;
use crate::error::HeimdallResult;
use crate::folder::{FieldSet, FolderAdapter, FolderEvent, OpenFlags, OpenState};
use crate::RETRY_CONNECTION_SEC;

use super::operations::{self, with_cancel};
use super::queue::{Operation, OperationKind, OperationQueue};
use super::{MonitorEvent, SearchBlacklist};

pub(crate) struct MonitorState {
    pub(crate) conversations: ConversationSet,
    pub(crate) window_count: usize,
    pub(crate) all_loaded: bool,
    pub(crate) is_monitoring: bool,
    pub(crate) seed_notified: bool,
}

struct Session {
    worker: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// Live, windowed view of one folder's mail grouped into conversations.
///
/// Constructed with [`ConversationMonitor::new`]; nothing happens until
/// [`start`](Self::start) opens the folder and the worker begins applying
/// operations. Consumers subscribe for [`MonitorEvent`]s and read snapshots
/// through the accessors; they never mutate the set.
pub struct ConversationMonitor {
    pub(crate) folder: Arc<dyn FolderAdapter>,
    pub(crate) account: Arc<dyn AccountAdapter>,
    pub(crate) open_flags: OpenFlags,
    pub(crate) required_fields: FieldSet,
    pub(crate) blacklist: SearchBlacklist,
    pub(crate) queue: OperationQueue,
    state: Mutex<MonitorState>,
    cancel: Mutex<Option<CancellationToken>>,
    subscribers: Mutex<Vec<flume::Sender<MonitorEvent>>>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl ConversationMonitor {
    /// Create a monitor over the given folder.
    ///
    /// `required_fields` is widened to always include references, flags and
    /// date; `window_count` is the minimum number of conversations to keep
    /// materialized.
    pub fn new(
        folder: Arc<dyn FolderAdapter>,
        account: Arc<dyn AccountAdapter>,
        open_flags: OpenFlags,
        required_fields: FieldSet,
        window_count: usize,
    ) -> Arc<Self> {
        let path = folder.path();
        let blacklist = SearchBlacklist::for_monitor(account.as_ref(), &path);
        Arc::new(Self {
            folder,
            account,
            open_flags,
            required_fields: required_fields | FieldSet::REQUIRED,
            blacklist,
            queue: OperationQueue::new(),
            state: Mutex::new(MonitorState {
                conversations: ConversationSet::new(path),
                window_count,
                all_loaded: false,
                is_monitoring: false,
                seed_notified: false,
            }),
            cancel: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            session: tokio::sync::Mutex::new(None),
        })
    }

    /// Begin monitoring.
    ///
    /// Returns `Ok(false)` when already monitoring. A folder open failure
    /// unwinds cleanly and is returned to the caller. The token scopes the
    /// whole monitoring session, including reconnect retries; cancelling it
    /// terminates both background tasks.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> HeimdallResult<bool> {
        {
            // The guard flips before the first await so a reentrant start
            // sees it immediately.
            let mut state = self.state.lock().unwrap();
            if state.is_monitoring {
                return Ok(false);
            }
            state.is_monitoring = true;
            state.seed_notified = false;
            state.all_loaded = false;
        }
        *self.cancel.lock().unwrap() = Some(cancel.clone());

        self.queue.activate();
        self.queue.clear();
        self.queue.add(Operation::LocalLoad);
        if self.folder.open_state().is_remote() {
            self.queue.add(Operation::Reseed {
                reason: "already opened".to_string(),
            });
        }
        self.queue.add(Operation::FillWindow { is_insert: false });

        let dispatcher = tokio::spawn(Self::dispatch_events(
            Arc::clone(self),
            cancel.clone(),
            self.folder.subscribe(),
            self.account.subscribe(),
        ));

        if let Err(e) = with_cancel(&cancel, self.folder.open(self.open_flags)).await {
            dispatcher.abort();
            self.queue.clear();
            self.state.lock().unwrap().is_monitoring = false;
            warn!(folder = %self.folder.path(), error = %e, "folder open failed");
            return Err(e);
        }

        self.emit(MonitorEvent::MonitoringStarted);
        info!(folder = %self.folder.path(), "conversation monitoring started");

        let worker = tokio::spawn(Self::worker_loop(Arc::clone(self), cancel));
        *self.session.lock().await = Some(Session { worker, dispatcher });
        Ok(true)
    }

    /// Stop monitoring.
    ///
    /// Signals the session token first, then waits for the current
    /// operation to finish. Folder close failures are logged, not returned;
    /// the monitor counts as stopped either way.
    pub async fn stop(&self) -> HeimdallResult<()> {
        if let Some(token) = self.cancel.lock().unwrap().take() {
            token.cancel();
        }
        self.stop_internal(false).await
    }

    pub(crate) async fn stop_internal(&self, retrying: bool) -> HeimdallResult<()> {
        let session = self.session.lock().await.take();
        let Some(session) = session else {
            return Ok(());
        };

        self.queue.request_stop();
        let _ = session.worker.await;
        self.state.lock().unwrap().is_monitoring = false;
        session.dispatcher.abort();
        self.queue.clear();

        if let Err(e) = self.folder.close().await {
            warn!(folder = %self.folder.path(), error = %e, "folder close failed on stop");
        }

        self.emit(MonitorEvent::MonitoringStopped { retrying });
        info!(retrying, "conversation monitoring stopped");
        Ok(())
    }

    /// Grow the window by `delta` conversations and fill toward it.
    ///
    /// Returns false when a fill is already queued, everything is loaded
    /// already, or `delta` is zero.
    pub fn increase_window(&self, delta: usize) -> bool {
        if delta == 0 || self.queue.has(OperationKind::FillWindow) {
            return false;
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.all_loaded {
                return false;
            }
            state.window_count += delta;
        }
        self.queue.add(Operation::FillWindow { is_insert: false });
        true
    }

    /// Snapshot of every conversation, newest first
    pub fn conversations(&self) -> Vec<Conversation> {
        self.state.lock().unwrap().conversations.conversations()
    }

    /// Snapshot of the conversation holding the given email
    pub fn conversation_for(&self, id: EmailId) -> Option<Conversation> {
        self.state
            .lock()
            .unwrap()
            .conversations
            .get_by_email_id(id)
            .cloned()
    }

    /// Number of conversations currently materialized
    pub fn conversation_count(&self) -> usize {
        self.state.lock().unwrap().conversations.len()
    }

    /// Number of in-folder emails currently held
    pub fn email_count(&self) -> usize {
        self.state.lock().unwrap().conversations.email_count()
    }

    /// Check if every email of the folder has been loaded
    pub fn all_messages_loaded(&self) -> bool {
        self.state.lock().unwrap().all_loaded
    }

    /// Check if the monitor is between start and stop
    pub fn is_monitoring(&self) -> bool {
        self.state.lock().unwrap().is_monitoring
    }

    /// The current window target
    pub fn window_count(&self) -> usize {
        self.state.lock().unwrap().window_count
    }

    /// Subscribe to monitor events
    pub fn subscribe(&self) -> flume::Receiver<MonitorEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    // -- internals shared with the operation executors --

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&MonitorState) -> R) -> R {
        f(&self.state.lock().unwrap())
    }

    pub(crate) fn with_state_mut<R>(&self, f: impl FnOnce(&mut MonitorState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub(crate) fn emit(&self, event: MonitorEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Emit the outcome of a batched add: merge removals first, then
    /// additions, then appends
    pub(crate) fn emit_add_result(&self, result: AddResult) {
        for conversation in result.removed_by_merge {
            self.emit(MonitorEvent::ConversationRemoved { conversation });
        }
        if !result.added.is_empty() {
            self.emit(MonitorEvent::ConversationsAdded {
                conversations: result.added,
            });
        }
        for (conversation, emails) in result.appended {
            self.emit(MonitorEvent::ConversationAppended { conversation, emails });
        }
    }

    // -- background tasks --

    async fn worker_loop(monitor: Arc<Self>, cancel: CancellationToken) {
        loop {
            let op = tokio::select! {
                _ = cancel.cancelled() => None,
                op = monitor.queue.next() => op,
            };
            let Some(op) = op else { break };
            let name = op.describe();
            match operations::execute(&monitor, op, &cancel).await {
                Ok(()) => debug!(op = name, "operation completed"),
                Err(e) if e.is_cancelled() => debug!(op = name, "operation cancelled"),
                Err(e) => {
                    if e.is_invariant() {
                        error!(op = name, error = %e, "operation aborted on invariant violation");
                    } else {
                        warn!(op = name, error = %e, "operation failed");
                    }
                    monitor.emit(MonitorEvent::ScanError {
                        message: e.to_string(),
                    });
                }
            }
            monitor.queue.op_finished();
        }
        debug!("operation worker exited");
    }

    async fn dispatch_events(
        monitor: Arc<Self>,
        cancel: CancellationToken,
        folder_rx: flume::Receiver<FolderEvent>,
        account_rx: flume::Receiver<AccountEvent>,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = folder_rx.recv_async() => match event {
                    Ok(event) => monitor.on_folder_event(event, &cancel),
                    Err(_) => break,
                },
                event = account_rx.recv_async() => match event {
                    Ok(event) => monitor.on_account_event(event),
                    Err(_) => break,
                },
            }
        }
        debug!("event dispatcher exited");
    }

    fn on_folder_event(self: &Arc<Self>, event: FolderEvent, cancel: &CancellationToken) {
        match event {
            FolderEvent::Appended(ids) => {
                self.queue.add(Operation::Append { ids });
            }
            FolderEvent::Inserted(ids) => {
                self.queue.add(Operation::Append { ids });
                self.queue.add(Operation::FillWindow { is_insert: true });
            }
            FolderEvent::Removed(ids) => {
                self.queue.add(Operation::Remove { ids });
            }
            FolderEvent::OpenStateChanged { state, count } => {
                debug!(?state, count, "folder open state changed");
                if state.is_remote() {
                    self.queue.add(Operation::Reseed {
                        reason: format!("open state {:?}", state),
                    });
                    self.queue.add(Operation::FillWindow { is_insert: false });
                } else if state == OpenState::Closed
                    && self.open_flags.contains(OpenFlags::REESTABLISH_CONNECTIONS)
                    && self.is_monitoring()
                {
                    self.spawn_retry(cancel.clone());
                }
            }
        }
    }

    fn on_account_event(&self, event: AccountEvent) {
        match event {
            AccountEvent::FlagsChanged { folder: _, changes } => {
                let mut updates: Vec<_> = changes.into_iter().collect();
                updates.sort_by_key(|(id, _)| *id);
                let mut emitted = Vec::new();
                {
                    let mut state = self.state.lock().unwrap();
                    for (id, flags) in updates {
                        if let Some(snapshot) = state.conversations.update_flags(id, flags) {
                            emitted.push(snapshot);
                        }
                    }
                }
                for (conversation, email) in emitted {
                    self.emit(MonitorEvent::EmailFlagsChanged { conversation, email });
                }
            }
            AccountEvent::LocallyComplete { folder, ids } => {
                if folder != self.folder.path() {
                    self.queue.add(Operation::ExternalAppend { folder, ids });
                }
            }
        }
    }

    /// Stop with `retrying` set, wait out the backoff, then start again.
    /// Runs detached so it survives the dispatcher being torn down; the
    /// session token ends the cycle.
    fn spawn_retry(self: &Arc<Self>, cancel: CancellationToken) {
        info!(
            delay_sec = RETRY_CONNECTION_SEC,
            "connection lost; scheduling monitor restart"
        );
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = monitor.stop_internal(true).await {
                    warn!(error = %e, "stop before reconnect failed");
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(RETRY_CONNECTION_SEC)) => {}
                }
                match monitor.start(cancel.clone()).await {
                    Ok(_) => return,
                    Err(e) if e.is_cancelled() => return,
                    Err(e) => warn!(error = %e, "reconnect attempt failed; retrying"),
                }
            }
        });
    }
}
