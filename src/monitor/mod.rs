//! Conversation monitoring for Heimdall Mail
//!
//! The monitor keeps a windowed, incrementally-maintained set of
//! conversations over one folder. Folder and account notifications are
//! turned into typed operations, a single worker applies them one at a time,
//! and every observable change leaves the monitor as a [`MonitorEvent`].

mod controller;
mod operations;
mod queue;

pub use controller::ConversationMonitor;
pub use queue::{Operation, OperationKind, OperationQueue};

use serde::{Deserialize, Serialize};

use crate::account::AccountAdapter;
use crate::conversation::Conversation;
use crate::email::{Email, EmailFlags};
use crate::folder::{FolderPath, SpecialFolder};

/// Change notification emitted by a [`ConversationMonitor`].
///
/// Conversations and emails in events are snapshots taken when the event was
/// produced. Within one operation, removals caused by merges are emitted
/// before additions, additions before appends, and trims before removals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MonitorEvent {
    /// Monitoring started
    MonitoringStarted,
    /// Monitoring stopped; `retrying` is set when a reconnect will follow
    MonitoringStopped { retrying: bool },
    /// A scan-bearing operation began loading emails
    ScanStarted { local_only: bool },
    /// An operation failed; the queue continues with the next one
    ScanError { message: String },
    /// A scan-bearing operation finished
    ScanCompleted { local_only: bool },
    /// The first reseed of this monitoring session finished
    SeedCompleted,
    /// Conversations that did not exist before
    ConversationsAdded { conversations: Vec<Conversation> },
    /// Emails joined an existing conversation
    ConversationAppended {
        conversation: Conversation,
        emails: Vec<Email>,
    },
    /// Emails left a conversation that still has others
    ConversationTrimmed {
        conversation: Conversation,
        emails: Vec<Email>,
    },
    /// A conversation lost its last email or was absorbed by a merge
    ConversationRemoved { conversation: Conversation },
    /// An email's flags changed in place
    EmailFlagsChanged {
        conversation: Conversation,
        email: Email,
    },
}

/// Folders and flags excluded from thread expansion.
///
/// Spam, trash and drafts never represent a conversation, and neither does
/// the monitored folder itself (its mail arrives through folder listings,
/// not through local search). Draft-flagged mail is excluded wherever it
/// lives.
#[derive(Debug, Clone)]
pub struct SearchBlacklist {
    /// Folders whose emails never join a conversation from the outside
    pub folders: Vec<FolderPath>,
    /// Flags that exclude an email from thread expansion
    pub flags: EmailFlags,
}

impl SearchBlacklist {
    /// Build the blacklist for a monitor watching `monitored`
    pub fn for_monitor(account: &dyn AccountAdapter, monitored: &FolderPath) -> Self {
        let mut folders = vec![monitored.clone()];
        for kind in [SpecialFolder::Spam, SpecialFolder::Trash, SpecialFolder::Drafts] {
            if let Some(path) = account.special_folder(kind) {
                if !folders.contains(&path) {
                    folders.push(path);
                }
            }
        }
        Self {
            folders,
            flags: EmailFlags::DRAFT,
        }
    }

    /// Check if a folder is excluded
    pub fn contains_folder(&self, folder: &FolderPath) -> bool {
        self.folders.contains(folder)
    }

    /// Check if an email may join a conversation from outside the monitored
    /// folder
    pub fn allows(&self, email: &Email) -> bool {
        !self.contains_folder(&email.folder) && !email.flags.intersects(self.flags)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory folder and account backends for monitor tests

    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use time::OffsetDateTime;

    use crate::account::{AccountAdapter, AccountEvent};
    use crate::email::{Email, EmailFlags, EmailId, MessageId};
    use crate::error::{HeimdallError, HeimdallResult};
    use crate::folder::{
        FieldSet, FolderAdapter, FolderEvent, FolderPath, ListFlags, OpenFlags, OpenState,
        SpecialFolder,
    };

    pub fn test_date(n: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + n).unwrap()
    }

    pub fn make_email(id: i64, folder: &str, message_id: &str, refs: &[&str], date: i64) -> Email {
        Email::new(EmailId(id), FolderPath::new(folder), test_date(date))
            .with_message_id(MessageId::parse(message_id).unwrap())
            .with_references(refs.iter().map(|r| MessageId::parse(r).unwrap()).collect())
    }

    /// Folder backend backed by a map, emitting events on request
    pub struct MockFolder {
        path: FolderPath,
        emails: Mutex<BTreeMap<EmailId, Email>>,
        local: Mutex<BTreeSet<EmailId>>,
        open_state: Mutex<OpenState>,
        open_target: OpenState,
        fail_open: AtomicBool,
        subscribers: Mutex<Vec<flume::Sender<FolderEvent>>>,
    }

    impl MockFolder {
        pub fn new(path: &str) -> Arc<Self> {
            Arc::new(Self {
                path: FolderPath::new(path),
                emails: Mutex::new(BTreeMap::new()),
                local: Mutex::new(BTreeSet::new()),
                open_state: Mutex::new(OpenState::Closed),
                open_target: OpenState::Both,
                fail_open: AtomicBool::new(false),
                subscribers: Mutex::new(Vec::new()),
            })
        }

        /// Seed emails without emitting events; they land in the local
        /// mirror as well
        pub fn seed(&self, emails: Vec<Email>) {
            let mut held = self.emails.lock().unwrap();
            let mut local = self.local.lock().unwrap();
            for email in emails {
                local.insert(email.id);
                held.insert(email.id, email);
            }
        }

        pub fn set_fail_open(&self, fail: bool) {
            self.fail_open.store(fail, Ordering::SeqCst);
        }

        pub fn emit(&self, event: FolderEvent) {
            let mut subs = self.subscribers.lock().unwrap();
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }

        /// Add emails and notify subscribers they were appended
        pub fn append(&self, emails: Vec<Email>) {
            let ids: Vec<EmailId> = emails.iter().map(|e| e.id).collect();
            self.seed(emails);
            self.emit(FolderEvent::Appended(ids));
        }

        /// Drop emails and notify subscribers they were removed
        pub fn remove(&self, ids: &[EmailId]) {
            {
                let mut held = self.emails.lock().unwrap();
                let mut local = self.local.lock().unwrap();
                for id in ids {
                    held.remove(id);
                    local.remove(id);
                }
            }
            self.emit(FolderEvent::Removed(ids.to_vec()));
        }

        pub fn set_open_state(&self, state: OpenState) {
            *self.open_state.lock().unwrap() = state;
            let count = self.emails.lock().unwrap().len();
            self.emit(FolderEvent::OpenStateChanged { state, count });
        }
    }

    #[async_trait]
    impl FolderAdapter for MockFolder {
        fn path(&self) -> FolderPath {
            self.path.clone()
        }

        fn open_state(&self) -> OpenState {
            *self.open_state.lock().unwrap()
        }

        fn email_total(&self) -> usize {
            self.emails.lock().unwrap().len()
        }

        async fn open(&self, _flags: OpenFlags) -> HeimdallResult<()> {
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(HeimdallError::folder("mock open failure"));
            }
            self.set_open_state(self.open_target);
            Ok(())
        }

        async fn close(&self) -> HeimdallResult<()> {
            *self.open_state.lock().unwrap() = OpenState::Closed;
            Ok(())
        }

        async fn list_by_id(
            &self,
            start: Option<EmailId>,
            count: usize,
            _fields: FieldSet,
            flags: ListFlags,
        ) -> HeimdallResult<Vec<Email>> {
            let held = self.emails.lock().unwrap();
            let local = self.local.lock().unwrap();
            let inclusive = flags.contains(ListFlags::INCLUDING_ID);
            let mut ids: Vec<EmailId> = held
                .keys()
                .copied()
                .filter(|id| !flags.contains(ListFlags::LOCAL_ONLY) || local.contains(id))
                .filter(|id| match start {
                    None => true,
                    Some(s) if flags.contains(ListFlags::OLDEST_TO_NEWEST) => {
                        if inclusive {
                            *id >= s
                        } else {
                            *id > s
                        }
                    }
                    Some(s) => {
                        if inclusive {
                            *id <= s
                        } else {
                            *id < s
                        }
                    }
                })
                .collect();
            if !flags.contains(ListFlags::OLDEST_TO_NEWEST) {
                ids.reverse();
            }
            let limit = if count == usize::MAX { ids.len() } else { count };
            Ok(ids
                .into_iter()
                .take(limit)
                .filter_map(|id| held.get(&id).cloned())
                .collect())
        }

        async fn list_by_sparse_id(
            &self,
            ids: &[EmailId],
            _fields: FieldSet,
            _flags: ListFlags,
        ) -> HeimdallResult<Vec<Email>> {
            let held = self.emails.lock().unwrap();
            Ok(ids.iter().filter_map(|id| held.get(id).cloned()).collect())
        }

        async fn find_boundaries(
            &self,
            ids: &[EmailId],
        ) -> HeimdallResult<Option<(EmailId, EmailId)>> {
            let held = self.emails.lock().unwrap();
            let present: Vec<EmailId> =
                ids.iter().copied().filter(|id| held.contains_key(id)).collect();
            Ok(present
                .iter()
                .min()
                .zip(present.iter().max())
                .map(|(lo, hi)| (*lo, *hi)))
        }

        async fn fetch_local_newest(&self) -> HeimdallResult<Option<(EmailId, usize)>> {
            let held = self.emails.lock().unwrap();
            let local = self.local.lock().unwrap();
            let Some(newest) = local.iter().max().copied() else {
                return Ok(None);
            };
            let offset = held.keys().filter(|id| **id > newest).count();
            Ok(Some((newest, offset)))
        }

        fn subscribe(&self) -> flume::Receiver<FolderEvent> {
            let (tx, rx) = flume::unbounded();
            self.subscribers.lock().unwrap().push(tx);
            rx
        }
    }

    /// Account backend over a flat local store of emails from any folder
    pub struct MockAccount {
        store: Mutex<Vec<Email>>,
        folders: Mutex<HashMap<FolderPath, Arc<MockFolder>>>,
        special: Mutex<HashMap<SpecialFolder, FolderPath>>,
        subscribers: Mutex<Vec<flume::Sender<AccountEvent>>>,
    }

    impl MockAccount {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                store: Mutex::new(Vec::new()),
                folders: Mutex::new(HashMap::new()),
                special: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
            })
        }

        pub fn add_local(&self, email: Email) {
            self.store.lock().unwrap().push(email);
        }

        pub fn add_folder(&self, folder: Arc<MockFolder>) {
            self.folders
                .lock()
                .unwrap()
                .insert(folder.path.clone(), folder);
        }

        pub fn set_special(&self, kind: SpecialFolder, path: &str) {
            self.special
                .lock()
                .unwrap()
                .insert(kind, FolderPath::new(path));
        }

        pub fn emit(&self, event: AccountEvent) {
            let mut subs = self.subscribers.lock().unwrap();
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    #[async_trait]
    impl AccountAdapter for MockAccount {
        async fn local_fetch(
            &self,
            folder: &FolderPath,
            id: EmailId,
            _fields: FieldSet,
        ) -> HeimdallResult<Option<Email>> {
            Ok(self
                .store
                .lock()
                .unwrap()
                .iter()
                .find(|e| e.folder == *folder && e.id == id)
                .cloned())
        }

        async fn search_message_id(
            &self,
            message_id: &MessageId,
            _fields: FieldSet,
            folder_blacklist: &[FolderPath],
            flag_blacklist: EmailFlags,
        ) -> HeimdallResult<Vec<Email>> {
            Ok(self
                .store
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.ancestors().contains(message_id))
                .filter(|e| !folder_blacklist.contains(&e.folder))
                .filter(|e| !e.flags.intersects(flag_blacklist))
                .cloned()
                .collect())
        }

        fn special_folder(&self, kind: SpecialFolder) -> Option<FolderPath> {
            self.special.lock().unwrap().get(&kind).cloned()
        }

        async fn open_folder(
            &self,
            path: &FolderPath,
        ) -> HeimdallResult<Arc<dyn FolderAdapter>> {
            self.folders
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .map(|f| f as Arc<dyn FolderAdapter>)
                .ok_or_else(|| HeimdallError::not_found(format!("no folder {}", path)))
        }

        fn subscribe(&self) -> flume::Receiver<AccountEvent> {
            let (tx, rx) = flume::unbounded();
            self.subscribers.lock().unwrap().push(tx);
            rx
        }
    }

    /// Wait until the monitor's queue has drained and stayed idle
    pub async fn wait_until_idle(monitor: &super::ConversationMonitor) {
        let mut calm = 0;
        for _ in 0..1000 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            if monitor.queue.is_active() {
                calm = 0;
            } else {
                calm += 1;
                if calm >= 3 {
                    return;
                }
            }
        }
        panic!("monitor queue never went idle");
    }

    /// Drain every event currently pending on a receiver
    pub fn drain_events(
        rx: &flume::Receiver<super::MonitorEvent>,
    ) -> Vec<super::MonitorEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }
}
