//! The in-memory conversation index for Heimdall Mail
//!
//! Conversations are held in an arena keyed by their handle, with two flat
//! hash indices mapping email ids and Message-IDs back to the owning
//! conversation. The indices partition the active Message-ID space: a
//! Message-ID belongs to at most one conversation at any time, and inserting
//! an email whose ancestors span several conversations collapses them into
//! one survivor.

use std::cmp::Reverse;
use std::collections::HashMap;

use tracing::debug;
use uuid::Uuid;

use crate::conversation::Conversation;
use crate::email::{Email, EmailFlags, EmailId, MessageId};
use crate::error::{HeimdallError, HeimdallResult};
use crate::folder::FolderPath;

/// Outcome of a batched [`ConversationSet::add_all`].
///
/// Snapshots are taken after the whole batch is applied, so a batch is
/// observed atomically: a conversation created and absorbed within the same
/// batch never appears at all.
#[derive(Debug, Clone, Default)]
pub struct AddResult {
    /// Conversations that did not exist before the batch
    pub added: Vec<Conversation>,
    /// Pre-existing conversations with the emails newly inserted into each
    pub appended: Vec<(Conversation, Vec<Email>)>,
    /// Pre-existing conversations absorbed into a merge survivor
    pub removed_by_merge: Vec<Conversation>,
}

/// Outcome of a batched [`ConversationSet::remove`]
#[derive(Debug, Clone, Default)]
pub struct RemoveResult {
    /// Conversations whose last email was removed
    pub removed: Vec<Conversation>,
    /// Surviving conversations with the emails dropped from each
    pub trimmed: Vec<(Conversation, Vec<Email>)>,
}

/// Index of every conversation the monitor currently materializes
pub struct ConversationSet {
    folder: FolderPath,
    conversations: HashMap<Uuid, Conversation>,
    by_email_id: HashMap<EmailId, Uuid>,
    by_message_id: HashMap<MessageId, Uuid>,
}

impl ConversationSet {
    /// Create an empty set anchored to the monitored folder
    pub fn new(folder: FolderPath) -> Self {
        Self {
            folder,
            conversations: HashMap::new(),
            by_email_id: HashMap::new(),
            by_message_id: HashMap::new(),
        }
    }

    /// Number of conversations
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Check if the set holds no conversations
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Number of emails held that live in the monitored folder.
    ///
    /// Out-of-folder emails pulled in by thread expansion do not count; this
    /// is the figure window-fill compares against the folder's total.
    pub fn email_count(&self) -> usize {
        self.conversations
            .values()
            .flat_map(|c| c.emails())
            .filter(|e| e.folder == self.folder)
            .count()
    }

    /// Check if a Message-ID belongs to any conversation
    pub fn has_message_id(&self, message_id: &MessageId) -> bool {
        self.by_message_id.contains_key(message_id)
    }

    /// The conversation holding the given email
    pub fn get_by_email_id(&self, id: EmailId) -> Option<&Conversation> {
        let cid = self.by_email_id.get(&id)?;
        self.conversations.get(cid)
    }

    /// Look up a conversation by handle
    pub fn get(&self, id: Uuid) -> Option<&Conversation> {
        self.conversations.get(&id)
    }

    /// Ids of every held email living in the monitored folder
    pub fn in_folder_ids(&self) -> Vec<EmailId> {
        let mut ids: Vec<EmailId> = self
            .conversations
            .values()
            .flat_map(|c| c.emails())
            .filter(|e| e.folder == self.folder)
            .map(|e| e.id)
            .collect();
        ids.sort();
        ids
    }

    /// The lowest in-folder email id held, if any
    pub fn earliest_in_folder_id(&self) -> Option<EmailId> {
        self.in_folder_ids().into_iter().next()
    }

    /// Snapshot of every conversation, newest first.
    ///
    /// Ordered by newest date descending; ties break on the conversation's
    /// lowest email id so listings are stable across runs.
    pub fn conversations(&self) -> Vec<Conversation> {
        let mut all: Vec<Conversation> = self.conversations.values().cloned().collect();
        all.sort_by_key(|c| (Reverse(c.newest_date()), c.earliest_id()));
        all
    }

    /// Thread a batch of emails into the set.
    ///
    /// Each email lands in the conversation its ancestor Message-IDs name;
    /// when the ancestors span several conversations those are merged into
    /// the largest one (ties broken by lowest email id, absorbed in
    /// ascending lowest-id order). Emails already held only have their
    /// flags and date refreshed. The returned snapshots are taken after the
    /// entire batch is applied.
    pub fn add_all(&mut self, emails: Vec<Email>) -> HeimdallResult<AddResult> {
        let mut created: Vec<Uuid> = Vec::new();
        let mut appended_order: Vec<Uuid> = Vec::new();
        let mut appended_ids: HashMap<Uuid, Vec<EmailId>> = HashMap::new();
        let mut removed_by_merge: Vec<Conversation> = Vec::new();

        for email in emails {
            if let Some(&cid) = self.by_email_id.get(&email.id) {
                self.refresh_in_place(cid, &email)?;
                continue;
            }

            let keys = email.thread_keys();
            let mut matches: Vec<Uuid> = keys
                .iter()
                .filter_map(|k| self.by_message_id.get(k).copied())
                .collect();
            matches.sort();
            matches.dedup();

            let target = match matches.len() {
                0 => {
                    let conv = Conversation::new(self.folder.clone());
                    let cid = conv.id();
                    self.conversations.insert(cid, conv);
                    created.push(cid);
                    cid
                }
                1 => matches[0],
                _ => self.merge(
                    matches,
                    &mut created,
                    &mut appended_order,
                    &mut appended_ids,
                    &mut removed_by_merge,
                )?,
            };

            let conv = self
                .conversations
                .get_mut(&target)
                .ok_or_else(|| HeimdallError::invariant("add_all target vanished"))?;
            conv.insert(email.clone());
            self.by_email_id.insert(email.id, target);
            for key in keys {
                self.by_message_id.insert(key, target);
            }
            if !created.contains(&target) {
                record_appended(&mut appended_order, &mut appended_ids, target, [email.id]);
            }
        }

        let added: Vec<Conversation> = created
            .iter()
            .filter_map(|cid| self.conversations.get(cid).cloned())
            .collect();
        let appended: Vec<(Conversation, Vec<Email>)> = appended_order
            .iter()
            .filter_map(|cid| {
                let conv = self.conversations.get(cid)?;
                let mut ids = appended_ids.remove(cid)?;
                ids.sort();
                ids.dedup();
                let emails: Vec<Email> = ids
                    .iter()
                    .filter_map(|id| conv.email(*id).cloned())
                    .collect();
                if emails.is_empty() {
                    None
                } else {
                    Some((conv.clone(), emails))
                }
            })
            .collect();

        if !added.is_empty() || !appended.is_empty() || !removed_by_merge.is_empty() {
            debug!(
                added = added.len(),
                appended = appended.len(),
                merged_away = removed_by_merge.len(),
                "conversation set updated"
            );
        }

        Ok(AddResult {
            added,
            appended,
            removed_by_merge,
        })
    }

    /// Drop the given emails from their conversations.
    ///
    /// A conversation left empty is removed outright; otherwise its closure
    /// is recomputed from the surviving emails. A conversation is never
    /// split, even when the removed email was the only bridge between two
    /// halves of its reference graph.
    pub fn remove(&mut self, ids: &[EmailId]) -> HeimdallResult<RemoveResult> {
        let mut order: Vec<Uuid> = Vec::new();
        let mut per_conv: HashMap<Uuid, Vec<EmailId>> = HashMap::new();
        for id in ids {
            if let Some(&cid) = self.by_email_id.get(id) {
                let entry = per_conv.entry(cid).or_insert_with(|| {
                    order.push(cid);
                    Vec::new()
                });
                entry.push(*id);
            }
        }

        let mut removed = Vec::new();
        let mut trimmed = Vec::new();
        for cid in order {
            let conv = self
                .conversations
                .get_mut(&cid)
                .ok_or_else(|| HeimdallError::invariant("email index named a missing conversation"))?;
            let mut dropped = Vec::new();
            for id in per_conv.remove(&cid).unwrap_or_default() {
                if let Some(email) = conv.remove(id) {
                    self.by_email_id.remove(&id);
                    dropped.push(email);
                }
            }
            if conv.is_empty() {
                for mid in conv.message_ids().clone() {
                    if self.by_message_id.get(&mid) == Some(&cid) {
                        self.by_message_id.remove(&mid);
                    }
                }
                if let Some(conv) = self.conversations.remove(&cid) {
                    removed.push(conv);
                }
            } else {
                for mid in conv.recompute_closure(&dropped) {
                    if self.by_message_id.get(&mid) == Some(&cid) {
                        self.by_message_id.remove(&mid);
                    }
                }
                trimmed.push((conv.clone(), dropped));
            }
        }

        Ok(RemoveResult { removed, trimmed })
    }

    /// Refresh one email's flags in place.
    ///
    /// Returns the updated conversation and email snapshots, or `None` when
    /// the email is not held or the flags did not change.
    pub fn update_flags(
        &mut self,
        id: EmailId,
        flags: EmailFlags,
    ) -> Option<(Conversation, Email)> {
        let cid = *self.by_email_id.get(&id)?;
        let conv = self.conversations.get_mut(&cid)?;
        {
            let email = conv.email_mut(id)?;
            if email.flags == flags {
                return None;
            }
            email.flags = flags;
        }
        let email = conv.email(id).cloned()?;
        Some((conv.clone(), email))
    }

    // -- internals --

    fn refresh_in_place(&mut self, cid: Uuid, email: &Email) -> HeimdallResult<()> {
        let conv = self
            .conversations
            .get_mut(&cid)
            .ok_or_else(|| HeimdallError::invariant("email index named a missing conversation"))?;
        if let Some(held) = conv.email_mut(email.id) {
            held.flags = email.flags;
            held.date = email.date;
        }
        Ok(())
    }

    /// Collapse the matched conversations into one survivor and return its
    /// handle. The survivor is the largest conversation; ties break on the
    /// lowest email id. Pre-existing absorbed conversations are reported;
    /// ones created earlier in the same batch silently disappear.
    fn merge(
        &mut self,
        mut matches: Vec<Uuid>,
        created: &mut Vec<Uuid>,
        appended_order: &mut Vec<Uuid>,
        appended_ids: &mut HashMap<Uuid, Vec<EmailId>>,
        removed_by_merge: &mut Vec<Conversation>,
    ) -> HeimdallResult<Uuid> {
        matches.sort_by_key(|cid| {
            let conv = &self.conversations[cid];
            (Reverse(conv.len()), conv.earliest_id())
        });
        let survivor = matches[0];
        let mut absorbed = matches.split_off(1);
        absorbed.sort_by_key(|cid| self.conversations[cid].earliest_id());

        for cid in absorbed {
            let conv = self
                .conversations
                .remove(&cid)
                .ok_or_else(|| HeimdallError::invariant("merge source vanished"))?;

            for id in conv.email_ids() {
                self.by_email_id.insert(id, survivor);
            }
            for mid in conv.message_ids() {
                self.by_message_id.insert(mid.clone(), survivor);
            }

            if let Some(pos) = created.iter().position(|c| *c == cid) {
                // Created within this batch: it was never observable.
                created.remove(pos);
            } else {
                removed_by_merge.push(conv.clone());
            }

            // Pending appended bookkeeping follows the emails to the survivor.
            let mut moved = appended_ids.remove(&cid).unwrap_or_default();
            moved.extend(conv.email_ids());
            if !created.contains(&survivor) && !moved.is_empty() {
                record_appended(appended_order, appended_ids, survivor, moved);
            }

            let survivor_conv = self
                .conversations
                .get_mut(&survivor)
                .ok_or_else(|| HeimdallError::invariant("merge survivor vanished"))?;
            survivor_conv.absorb(conv);
        }

        Ok(survivor)
    }
}

fn record_appended(
    order: &mut Vec<Uuid>,
    ids: &mut HashMap<Uuid, Vec<EmailId>>,
    cid: Uuid,
    emails: impl IntoIterator<Item = EmailId>,
) {
    let entry = ids.entry(cid).or_insert_with(|| {
        order.push(cid);
        Vec::new()
    });
    entry.extend(emails);
}
