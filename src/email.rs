//! Email identity and reference metadata for Heimdall Mail
//!
//! These are the value types the conversation monitor threads over. Only the
//! fields the monitor needs are carried here; bodies, parts and attachments
//! stay behind the folder backend.

use std::collections::BTreeSet;
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::folder::FolderPath;

/// Identifier of an email within its folder.
///
/// Totally ordered by the folder's native receive order. Identifiers are
/// comparable for equality across folders of the same account.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EmailId(pub i64);

impl fmt::Display for EmailId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A normalized RFC 822 Message-ID.
///
/// Stored case-preserving with the surrounding angle brackets stripped.
/// Equality is byte-exact after normalization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Parse a Message-ID from header text.
    ///
    /// Accepts both `<id@host>` and bare `id@host` forms, with surrounding
    /// whitespace. Returns `None` for empty input.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let stripped = trimmed
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .unwrap_or(trimmed);
        if stripped.is_empty() {
            None
        } else {
            Some(Self(stripped.to_string()))
        }
    }

    /// A key for an email that carries neither a Message-ID nor references,
    /// so it threads with itself only.
    pub fn synthesized(folder: &FolderPath, id: EmailId) -> Self {
        Self(format!("local.{}.{}", id.0, folder))
    }

    /// The normalized id without angle brackets
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

bitflags! {
    /// Flags carried by an email
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
    )]
    pub struct EmailFlags: u8 {
        const UNREAD = 1 << 0;
        const FLAGGED = 1 << 1;
        const DRAFT = 1 << 2;
        const DELETED = 1 << 3;
        const ANSWERED = 1 << 4;
    }
}

/// Metadata of a single email as the monitor sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    /// Folder-native identifier
    pub id: EmailId,
    /// The email's own Message-ID, if it has one
    pub message_id: Option<MessageId>,
    /// Message-IDs from the References and In-Reply-To headers
    pub references: Vec<MessageId>,
    /// Date header
    pub date: OffsetDateTime,
    /// Current flags
    pub flags: EmailFlags,
    /// Folder the email lives in
    pub folder: FolderPath,
}

impl Email {
    /// Create a new email record
    pub fn new(id: EmailId, folder: FolderPath, date: OffsetDateTime) -> Self {
        Self {
            id,
            message_id: None,
            references: Vec::new(),
            date,
            flags: EmailFlags::empty(),
            folder,
        }
    }

    /// Set the email's own Message-ID
    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    /// Set the referenced Message-IDs
    pub fn with_references(mut self, references: Vec<MessageId>) -> Self {
        self.references = references;
        self
    }

    /// Set the email's flags
    pub fn with_flags(mut self, flags: EmailFlags) -> Self {
        self.flags = flags;
        self
    }

    /// All Message-IDs this email is an ancestor-member of: its own id (when
    /// present) unioned with every referenced id. Downstream merging relies
    /// on the own id always being included.
    pub fn ancestors(&self) -> BTreeSet<MessageId> {
        let mut set: BTreeSet<MessageId> = self.references.iter().cloned().collect();
        if let Some(mid) = &self.message_id {
            set.insert(mid.clone());
        }
        set
    }

    /// The keys this email threads under. Falls back to a synthesized
    /// singleton key when the email has no Message-ID and no references,
    /// so every email lands in exactly one conversation.
    pub fn thread_keys(&self) -> BTreeSet<MessageId> {
        let set = self.ancestors();
        if set.is_empty() {
            let mut set = BTreeSet::new();
            set.insert(MessageId::synthesized(&self.folder, self.id));
            set
        } else {
            set
        }
    }

    /// Check if the email is unread
    pub fn is_unread(&self) -> bool {
        self.flags.contains(EmailFlags::UNREAD)
    }

    /// Check if the email is flagged
    pub fn is_flagged(&self) -> bool {
        self.flags.contains(EmailFlags::FLAGGED)
    }
}
