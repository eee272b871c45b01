//! Conversation representation for Heimdall Mail
//!
//! A conversation is a set of emails connected through shared Message-IDs
//! (their own or referenced ones). Conversations are owned by the
//! [`ConversationSet`](crate::conversation_set::ConversationSet); consumers
//! receive snapshot clones and read them through the accessors here.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::email::{Email, EmailId, MessageId};
use crate::folder::FolderPath;

/// Which emails of a conversation an accessor should consider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailLocation {
    /// Emails in the monitored folder only
    InFolder,
    /// Emails in the monitored folder, falling back to out-of-folder ones
    /// when the folder holds none
    InFolderOutOfFolder,
    /// Every email regardless of folder
    Anywhere,
}

/// Orderings for listing a conversation's emails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailOrdering {
    /// Oldest date first
    DateAscending,
    /// Newest date first
    DateDescending,
    /// Ascending folder-native id
    IdAscending,
}

/// A set of emails sharing a transitive Message-ID closure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    id: Uuid,
    folder: FolderPath,
    emails: BTreeMap<EmailId, Email>,
    closure: HashSet<MessageId>,
}

impl Conversation {
    /// Create an empty conversation anchored to the monitored folder
    pub(crate) fn new(folder: FolderPath) -> Self {
        Self {
            id: Uuid::new_v4(),
            folder,
            emails: BTreeMap::new(),
            closure: HashSet::new(),
        }
    }

    /// Stable handle of this conversation
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of emails in the conversation
    pub fn len(&self) -> usize {
        self.emails.len()
    }

    /// Check if the conversation holds no emails
    pub fn is_empty(&self) -> bool {
        self.emails.is_empty()
    }

    /// Check if the conversation contains the given email
    pub fn contains(&self, id: EmailId) -> bool {
        self.emails.contains_key(&id)
    }

    /// The union of ancestor Message-IDs across all emails
    pub fn message_ids(&self) -> &HashSet<MessageId> {
        &self.closure
    }

    /// The lowest email id held, used for deterministic ordering and merge
    /// tie-breaking
    pub fn earliest_id(&self) -> Option<EmailId> {
        self.emails.keys().next().copied()
    }

    /// Date of the newest email anywhere in the conversation
    pub fn newest_date(&self) -> Option<OffsetDateTime> {
        self.emails.values().map(|e| e.date).max()
    }

    /// Date of the most recently received in-folder email
    pub fn newest_received_date(&self) -> Option<OffsetDateTime> {
        self.in_folder_emails().last().map(|e| e.date)
    }

    /// Check if any email is unread
    pub fn is_unread(&self) -> bool {
        self.emails.values().any(Email::is_unread)
    }

    /// Check if any email is flagged
    pub fn is_flagged(&self) -> bool {
        self.emails.values().any(Email::is_flagged)
    }

    /// The most recently received email matching the location filter.
    ///
    /// In-folder emails rank by folder-native id; out-of-folder emails have
    /// no comparable receive order, so they rank by date. Emails living in a
    /// blacklisted folder never represent the conversation.
    pub fn get_latest_received(
        &self,
        location: EmailLocation,
        blacklist: &[FolderPath],
    ) -> Option<&Email> {
        let allowed =
            |e: &&Email| !blacklist.contains(&e.folder);
        match location {
            EmailLocation::InFolder => {
                self.in_folder_emails().filter(allowed).max_by_key(|e| e.id)
            }
            EmailLocation::InFolderOutOfFolder => self
                .in_folder_emails()
                .filter(allowed)
                .max_by_key(|e| e.id)
                .or_else(|| {
                    self.out_of_folder_emails()
                        .filter(allowed)
                        .max_by_key(|e| (e.date, e.id))
                }),
            EmailLocation::Anywhere => self
                .emails
                .values()
                .filter(allowed)
                .max_by_key(|e| (e.date, e.id)),
        }
    }

    /// List the conversation's emails
    pub fn get_emails(
        &self,
        ordering: EmailOrdering,
        location: EmailLocation,
        blacklist: &[FolderPath],
    ) -> Vec<&Email> {
        let mut emails: Vec<&Email> = match location {
            EmailLocation::InFolder => self.in_folder_emails().collect(),
            EmailLocation::InFolderOutOfFolder | EmailLocation::Anywhere => {
                self.emails.values().collect()
            }
        };
        emails.retain(|e| !blacklist.contains(&e.folder));
        match ordering {
            EmailOrdering::DateAscending => emails.sort_by_key(|e| (e.date, e.id)),
            EmailOrdering::DateDescending => {
                emails.sort_by_key(|e| (std::cmp::Reverse(e.date), e.id))
            }
            EmailOrdering::IdAscending => emails.sort_by_key(|e| e.id),
        }
        emails
    }

    fn in_folder_emails(&self) -> impl Iterator<Item = &Email> {
        self.emails.values().filter(move |e| e.folder == self.folder)
    }

    fn out_of_folder_emails(&self) -> impl Iterator<Item = &Email> {
        self.emails.values().filter(move |e| e.folder != self.folder)
    }

    // -- mutation, reserved to the owning set --

    pub(crate) fn insert(&mut self, email: Email) {
        for key in email.thread_keys() {
            self.closure.insert(key);
        }
        self.emails.insert(email.id, email);
    }

    pub(crate) fn remove(&mut self, id: EmailId) -> Option<Email> {
        self.emails.remove(&id)
    }

    pub(crate) fn email_mut(&mut self, id: EmailId) -> Option<&mut Email> {
        self.emails.get_mut(&id)
    }

    pub(crate) fn email(&self, id: EmailId) -> Option<&Email> {
        self.emails.get(&id)
    }

    pub(crate) fn emails(&self) -> impl Iterator<Item = &Email> {
        self.emails.values()
    }

    pub(crate) fn email_ids(&self) -> impl Iterator<Item = EmailId> + '_ {
        self.emails.keys().copied()
    }

    /// Recompute the closure after emails were dropped, returning the stale
    /// Message-IDs that no longer belong to it.
    ///
    /// An id owned by a departed email leaves the closure even when a
    /// survivor still references it; a re-delivery of that message would
    /// re-merge through the surviving ids anyway. A survivor is never left
    /// without at least one key in the closure.
    pub(crate) fn recompute_closure(&mut self, dropped: &[Email]) -> Vec<MessageId> {
        let mut fresh: HashSet<MessageId> = self
            .emails
            .values()
            .flat_map(|e| e.thread_keys())
            .collect();
        for email in dropped {
            if let Some(own) = &email.message_id {
                let still_owned = self
                    .emails
                    .values()
                    .any(|e| e.message_id.as_ref() == Some(own));
                if !still_owned {
                    fresh.remove(own);
                }
            }
        }
        for email in self.emails.values() {
            let keys = email.thread_keys();
            if !keys.iter().any(|k| fresh.contains(k)) {
                fresh.extend(keys);
            }
        }
        let stale: Vec<MessageId> = self.closure.difference(&fresh).cloned().collect();
        self.closure = fresh;
        stale
    }

    /// Absorb another conversation's emails and closure
    pub(crate) fn absorb(&mut self, other: Conversation) {
        for (_, email) in other.emails {
            self.emails.insert(email.id, email);
        }
        self.closure.extend(other.closure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::EmailFlags;

    fn test_date(n: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + n).unwrap()
    }

    fn make_email(id: i64, folder: &str, date: i64) -> Email {
        Email::new(EmailId(id), FolderPath::new(folder), test_date(date))
            .with_message_id(MessageId::parse(&format!("<m{}@x>", id)).unwrap())
    }

    #[test]
    fn test_derived_predicates() {
        let mut conv = Conversation::new(FolderPath::new("INBOX"));
        conv.insert(make_email(1, "INBOX", 10).with_flags(EmailFlags::UNREAD));
        conv.insert(make_email(2, "INBOX", 20));

        assert!(conv.is_unread());
        assert!(!conv.is_flagged());
        assert_eq!(conv.newest_date(), Some(test_date(20)));
        assert_eq!(conv.earliest_id(), Some(EmailId(1)));
    }

    #[test]
    fn test_latest_received_prefers_in_folder() {
        let mut conv = Conversation::new(FolderPath::new("INBOX"));
        conv.insert(make_email(1, "INBOX", 10));
        // Out-of-folder email is newer by date but must not win the
        // in-folder-out-of-folder lookup while in-folder mail exists.
        conv.insert(make_email(9, "Archive", 99));

        let latest = conv
            .get_latest_received(EmailLocation::InFolderOutOfFolder, &[])
            .unwrap();
        assert_eq!(latest.id, EmailId(1));

        let anywhere = conv.get_latest_received(EmailLocation::Anywhere, &[]).unwrap();
        assert_eq!(anywhere.id, EmailId(9));
    }

    #[test]
    fn test_latest_received_blacklist() {
        let mut conv = Conversation::new(FolderPath::new("INBOX"));
        conv.insert(make_email(5, "Trash", 50));

        assert!(conv
            .get_latest_received(EmailLocation::Anywhere, &[FolderPath::new("Trash")])
            .is_none());
    }

    #[test]
    fn test_get_emails_ordering() {
        let mut conv = Conversation::new(FolderPath::new("INBOX"));
        conv.insert(make_email(3, "INBOX", 30));
        conv.insert(make_email(1, "INBOX", 10));
        conv.insert(make_email(2, "INBOX", 20));

        let ascending = conv.get_emails(EmailOrdering::DateAscending, EmailLocation::InFolder, &[]);
        let ids: Vec<EmailId> = ascending.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![EmailId(1), EmailId(2), EmailId(3)]);

        let descending =
            conv.get_emails(EmailOrdering::DateDescending, EmailLocation::InFolder, &[]);
        assert_eq!(descending.first().unwrap().id, EmailId(3));
    }

    #[test]
    fn test_recompute_closure_drops_stale_ids() {
        let mut conv = Conversation::new(FolderPath::new("INBOX"));
        conv.insert(make_email(1, "INBOX", 10));
        conv.insert(make_email(2, "INBOX", 20));

        let dropped = conv.remove(EmailId(2)).unwrap();
        let stale = conv.recompute_closure(&[dropped]);
        assert_eq!(stale, vec![MessageId::parse("<m2@x>").unwrap()]);
        assert!(conv.message_ids().contains(&MessageId::parse("<m1@x>").unwrap()));
    }

    #[test]
    fn test_recompute_closure_never_orphans_a_survivor() {
        let mut conv = Conversation::new(FolderPath::new("INBOX"));
        let anchor = make_email(1, "INBOX", 10);
        // Headerless reply that only references the anchor's id.
        let reply = Email::new(EmailId(2), FolderPath::new("INBOX"), test_date(20))
            .with_references(vec![MessageId::parse("<m1@x>").unwrap()]);
        conv.insert(anchor.clone());
        conv.insert(reply);

        let dropped = conv.remove(EmailId(1)).unwrap();
        conv.recompute_closure(&[dropped]);
        // The reply's only key is the departed anchor's id; it must stay in
        // the closure rather than leave the survivor unlinked.
        assert!(conv.message_ids().contains(&MessageId::parse("<m1@x>").unwrap()));
    }
}
