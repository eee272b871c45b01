//! Heimdall Mail Core Library
//!
//! This crate contains the conversation-monitoring core for Heimdall Mail,
//! including:
//! - Domain models (Email, MessageId, FolderPath, Conversation)
//! - The conversation set (Message-ID threading, merging, trimming)
//! - The serialized operation queue and its operation verbs
//! - The monitor controller (lifecycle, window fill, change events)
//!
//! Folder and account I/O is not implemented here; the monitor drives any
//! backend that implements the [`FolderAdapter`] and [`AccountAdapter`]
//! traits and emits [`MonitorEvent`]s a UI can render without rescans.

pub mod account;
pub mod conversation;
pub mod conversation_set;
pub mod email;
pub mod error;
pub mod folder;
pub mod monitor;

// Re-export commonly used types
pub use account::{AccountAdapter, AccountEvent};
pub use conversation::{Conversation, EmailLocation, EmailOrdering};
pub use conversation_set::{AddResult, ConversationSet, RemoveResult};
pub use email::{Email, EmailFlags, EmailId, MessageId};
pub use error::{HeimdallError, HeimdallResult};
pub use folder::{
    FieldSet, FolderAdapter, FolderEvent, FolderPath, ListFlags, OpenFlags, OpenState,
    SpecialFolder,
};
pub use monitor::{ConversationMonitor, MonitorEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum number of messages a window fill loads per round when expanding
/// past the earliest known email
pub const WINDOW_FILL_MESSAGE_COUNT: usize = 5;

/// Seconds to wait before re-opening the folder after a connection loss
pub const RETRY_CONNECTION_SEC: u64 = 15;

/// Maximum number of local Message-ID searches run concurrently while
/// expanding a conversation
pub const LOCAL_SEARCH_CONCURRENCY: usize = 10;
