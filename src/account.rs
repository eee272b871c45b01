//! Account backend contract for Heimdall Mail
//!
//! The monitor uses the account for everything that crosses folder
//! boundaries: looking up locally-cached emails by Message-ID, resolving
//! special folders for the search blacklist, and opening a foreign folder
//! when a message elsewhere in the account threads into a monitored
//! conversation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::email::{Email, EmailFlags, EmailId, MessageId};
use crate::error::HeimdallResult;
use crate::folder::{FieldSet, FolderAdapter, FolderPath, SpecialFolder};

/// Account-wide change notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AccountEvent {
    /// Flags changed on emails in some folder of the account
    FlagsChanged {
        folder: FolderPath,
        changes: HashMap<EmailId, EmailFlags>,
    },
    /// Emails finished syncing into the local store
    LocallyComplete {
        folder: FolderPath,
        ids: Vec<EmailId>,
    },
}

/// Contract the conversation monitor consumes for cross-folder work.
///
/// All lookups are served from the account's local store; none of these
/// calls touch the network.
#[async_trait]
pub trait AccountAdapter: Send + Sync {
    /// Read one email from the local cache of the given folder
    async fn local_fetch(
        &self,
        folder: &FolderPath,
        id: EmailId,
        fields: FieldSet,
    ) -> HeimdallResult<Option<Email>>;

    /// Find every locally-cached email carrying the given Message-ID in any
    /// folder, skipping blacklisted folders and emails carrying blacklisted
    /// flags
    async fn search_message_id(
        &self,
        message_id: &MessageId,
        fields: FieldSet,
        folder_blacklist: &[FolderPath],
        flag_blacklist: EmailFlags,
    ) -> HeimdallResult<Vec<Email>>;

    /// Resolve a special folder of the account, if it has one
    fn special_folder(&self, kind: SpecialFolder) -> Option<FolderPath>;

    /// Obtain an adapter for another folder of the account
    async fn open_folder(&self, path: &FolderPath) -> HeimdallResult<Arc<dyn FolderAdapter>>;

    /// Subscribe to account-wide change notifications
    fn subscribe(&self) -> flume::Receiver<AccountEvent>;
}
