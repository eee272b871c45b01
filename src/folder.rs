//! Folder model and the folder backend contract for Heimdall Mail
//!
//! The monitor never talks to a server or a database directly; it drives an
//! implementation of [`FolderAdapter`] and reacts to the [`FolderEvent`]
//! stream the adapter exposes.

use std::fmt;

use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::email::{Email, EmailId};
use crate::error::HeimdallResult;

/// Hierarchical path of a folder within an account
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FolderPath(Vec<String>);

impl FolderPath {
    /// Create a path from a `/`-separated string
    pub fn new(path: &str) -> Self {
        Self(
            path.split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Create a child path under this one
    pub fn child(&self, name: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.to_string());
        Self(segments)
    }

    /// The parent path, or `None` for a root folder
    pub fn parent(&self) -> Option<Self> {
        if self.0.len() < 2 {
            None
        } else {
            Self(self.0[..self.0.len() - 1].to_vec()).into()
        }
    }

    /// The last path segment
    pub fn basename(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or("")
    }

    /// Check if this path lies strictly below `other`
    pub fn is_descendant_of(&self, other: &FolderPath) -> bool {
        self.0.len() > other.0.len() && self.0[..other.0.len()] == other.0[..]
    }
}

impl fmt::Display for FolderPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// Well-known folder roles within an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecialFolder {
    /// Inbox folder
    Inbox,
    /// Spam folder
    Spam,
    /// Trash folder
    Trash,
    /// Drafts folder
    Drafts,
    /// Outbox folder
    Outbox,
    /// Sent folder
    Sent,
    /// Archive folder
    Archive,
    /// Search folder
    Search,
}

impl fmt::Display for SpecialFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecialFolder::Inbox => write!(f, "Inbox"),
            SpecialFolder::Spam => write!(f, "Spam"),
            SpecialFolder::Trash => write!(f, "Trash"),
            SpecialFolder::Drafts => write!(f, "Drafts"),
            SpecialFolder::Outbox => write!(f, "Outbox"),
            SpecialFolder::Sent => write!(f, "Sent"),
            SpecialFolder::Archive => write!(f, "Archive"),
            SpecialFolder::Search => write!(f, "Search"),
        }
    }
}

/// Connection state of an open folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenState {
    /// Not open
    Closed,
    /// Open in progress
    Opening,
    /// Only the local mirror is available
    Local,
    /// Only the remote is available
    Remote,
    /// Local mirror and remote are both available
    Both,
}

impl OpenState {
    /// Check if the remote side is reachable
    pub fn is_remote(self) -> bool {
        matches!(self, OpenState::Remote | OpenState::Both)
    }

    /// Check if listings should stay on the local mirror
    pub fn is_local_only(self) -> bool {
        matches!(self, OpenState::Closed | OpenState::Opening | OpenState::Local)
    }
}

bitflags! {
    /// Flags for opening a folder
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
    )]
    pub struct OpenFlags: u8 {
        /// Do not wait for the remote session before returning from open
        const NO_DELAY = 1 << 0;
        /// Re-open the folder automatically after a connection loss
        const REESTABLISH_CONNECTIONS = 1 << 1;
    }
}

bitflags! {
    /// Flags controlling a listing call
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
    )]
    pub struct ListFlags: u8 {
        /// Serve the listing from the local mirror only
        const LOCAL_ONLY = 1 << 0;
        /// List oldest-to-newest instead of the default newest-first
        const OLDEST_TO_NEWEST = 1 << 1;
        /// Include the `start` id itself in the listing
        const INCLUDING_ID = 1 << 2;
    }
}

bitflags! {
    /// Email fields a listing or fetch must materialize
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
    )]
    pub struct FieldSet: u8 {
        const REFERENCES = 1 << 0;
        const FLAGS = 1 << 1;
        const DATE = 1 << 2;
        const ENVELOPE = 1 << 3;
        const PREVIEW = 1 << 4;
    }
}

impl FieldSet {
    /// The fields conversation monitoring always needs
    pub const REQUIRED: FieldSet = FieldSet::REFERENCES
        .union(FieldSet::FLAGS)
        .union(FieldSet::DATE);
}

/// Change notification emitted by a folder backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FolderEvent {
    /// New emails appended at the top of the folder
    Appended(Vec<EmailId>),
    /// Emails inserted below the top (e.g. backfilled by the server)
    Inserted(Vec<EmailId>),
    /// Emails removed from the folder
    Removed(Vec<EmailId>),
    /// The folder's open state changed
    OpenStateChanged { state: OpenState, count: usize },
}

/// Contract the conversation monitor consumes to read and watch one folder.
///
/// Listings are ordered newest-first unless [`ListFlags::OLDEST_TO_NEWEST`]
/// is set; `start = None` lists from the top, and a `count` of `usize::MAX`
/// means "everything from `start` on". A `start` id is excluded unless
/// [`ListFlags::INCLUDING_ID`] is set. Every call is a suspension point and
/// may fail transiently; the monitor treats such failures as scan errors.
#[async_trait]
pub trait FolderAdapter: Send + Sync {
    /// The folder's path
    fn path(&self) -> FolderPath;

    /// Current open state
    fn open_state(&self) -> OpenState;

    /// Total number of emails in the folder, as last reported by the backend
    fn email_total(&self) -> usize;

    /// Open the folder
    async fn open(&self, flags: OpenFlags) -> HeimdallResult<()>;

    /// Close the folder
    async fn close(&self) -> HeimdallResult<()>;

    /// List `count` emails starting at `start`
    async fn list_by_id(
        &self,
        start: Option<EmailId>,
        count: usize,
        fields: FieldSet,
        flags: ListFlags,
    ) -> HeimdallResult<Vec<Email>>;

    /// Fetch a specific set of emails
    async fn list_by_sparse_id(
        &self,
        ids: &[EmailId],
        fields: FieldSet,
        flags: ListFlags,
    ) -> HeimdallResult<Vec<Email>>;

    /// Of the given ids, the chronologically lowest and highest present in
    /// the folder
    async fn find_boundaries(
        &self,
        ids: &[EmailId],
    ) -> HeimdallResult<Option<(EmailId, EmailId)>>;

    /// The newest email in the local mirror and its offset from the top of
    /// the folder
    async fn fetch_local_newest(&self) -> HeimdallResult<Option<(EmailId, usize)>>;

    /// Subscribe to the folder's change notifications
    fn subscribe(&self) -> flume::Receiver<FolderEvent>;
}
