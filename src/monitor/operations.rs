//! Operation executors for the conversation monitor
//!
//! Every executor runs inside the queue's single consumer: it may suspend on
//! adapter calls, but no other operation runs while it does, and change
//! notifications are batched to the end of each mutation. Ingesting
//! executors share one pipeline that collapses duplicates, pulls in
//! locally-cached emails for unknown ancestor Message-IDs (recursively,
//! bounded by the size of the local store) and applies the whole batch to
//! the conversation set at once.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::email::{Email, EmailId, MessageId};
use crate::error::{HeimdallError, HeimdallResult};
use crate::folder::{FieldSet, FolderAdapter, FolderPath, ListFlags, OpenFlags};
use crate::{LOCAL_SEARCH_CONCURRENCY, WINDOW_FILL_MESSAGE_COUNT};

use super::controller::ConversationMonitor;
use super::queue::Operation;
use super::MonitorEvent;

/// Run an adapter call under the session's cancellation token.
///
/// Cancellation surfaces as [`HeimdallError::Cancelled`], which terminates
/// the current operation without being reported as a scan error.
pub(crate) async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> HeimdallResult<T>
where
    F: Future<Output = HeimdallResult<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(HeimdallError::Cancelled),
        result = fut => result,
    }
}

/// Apply one operation to the monitor
pub(crate) async fn execute(
    monitor: &ConversationMonitor,
    op: Operation,
    cancel: &CancellationToken,
) -> HeimdallResult<()> {
    match op {
        Operation::LocalLoad => local_load(monitor, cancel).await,
        Operation::Reseed { reason } => reseed(monitor, cancel, &reason).await,
        Operation::FillWindow { is_insert } => fill_window(monitor, cancel, is_insert).await,
        Operation::Append { ids } => append(monitor, cancel, ids).await,
        Operation::Remove { ids } => remove(monitor, cancel, ids).await,
        Operation::ExternalAppend { folder, ids } => {
            external_append(monitor, cancel, folder, ids).await
        }
    }
}

/// Seed the conversation set from the local mirror
async fn local_load(
    monitor: &ConversationMonitor,
    cancel: &CancellationToken,
) -> HeimdallResult<()> {
    monitor.emit(MonitorEvent::ScanStarted { local_only: true });
    let newest = with_cancel(cancel, monitor.folder.fetch_local_newest()).await?;
    let window = monitor.window_count();
    // Load down to the window target, but never less than the local mirror
    // already holds above its newest mail.
    let count = match newest {
        Some((_, offset)) => window.max(offset + 1),
        None => window,
    };
    let emails = with_cancel(
        cancel,
        monitor
            .folder
            .list_by_id(None, count, monitor.required_fields, ListFlags::LOCAL_ONLY),
    )
    .await?;
    debug!(count = emails.len(), "local load listed");
    expand_and_add(monitor, cancel, emails, true, true).await
}

/// Re-list everything from the lowest held email upward.
///
/// Fired when the remote becomes available so locally-seeded state
/// reconciles with the server.
async fn reseed(
    monitor: &ConversationMonitor,
    cancel: &CancellationToken,
    reason: &str,
) -> HeimdallResult<()> {
    debug!(reason, "reseeding");
    monitor.emit(MonitorEvent::ScanStarted { local_only: false });
    let held = monitor.with_state(|s| s.conversations.in_folder_ids());
    let fields = monitor.required_fields;
    let emails = if held.is_empty() {
        let window = monitor.window_count();
        with_cancel(
            cancel,
            monitor.folder.list_by_id(None, window, fields, ListFlags::empty()),
        )
        .await?
    } else {
        let boundaries = with_cancel(cancel, monitor.folder.find_boundaries(&held)).await?;
        match boundaries {
            Some((lowest, _)) => {
                with_cancel(
                    cancel,
                    monitor.folder.list_by_id(
                        Some(lowest),
                        usize::MAX,
                        fields,
                        ListFlags::OLDEST_TO_NEWEST | ListFlags::INCLUDING_ID,
                    ),
                )
                .await?
            }
            None => {
                let window = monitor.window_count();
                with_cancel(
                    cancel,
                    monitor.folder.list_by_id(None, window, fields, ListFlags::empty()),
                )
                .await?
            }
        }
    };
    expand_and_add(monitor, cancel, emails, true, false).await?;

    // seed_completed latches: at most once per monitoring session.
    let first = monitor.with_state_mut(|s| {
        if s.seed_notified {
            false
        } else {
            s.seed_notified = true;
            true
        }
    });
    if first {
        monitor.emit(MonitorEvent::SeedCompleted);
    }
    Ok(())
}

/// Load more conversations until the window target is met
async fn fill_window(
    monitor: &ConversationMonitor,
    cancel: &CancellationToken,
    is_insert: bool,
) -> HeimdallResult<()> {
    let (window, size, lowest, before) = monitor.with_state(|s| {
        (
            s.window_count,
            s.conversations.len(),
            s.conversations.earliest_in_folder_id(),
            s.conversations.email_count(),
        )
    });
    if !monitor.is_monitoring() || size >= window {
        return Ok(());
    }

    let local_only = monitor.folder.open_state().is_local_only();
    let flags = if local_only {
        ListFlags::LOCAL_ONLY
    } else {
        ListFlags::empty()
    };
    monitor.emit(MonitorEvent::ScanStarted { local_only });

    let emails = match (is_insert, lowest) {
        (false, Some(low)) => {
            let count = (window - size).max(WINDOW_FILL_MESSAGE_COUNT);
            with_cancel(
                cancel,
                monitor
                    .folder
                    .list_by_id(Some(low), count, monitor.required_fields, flags),
            )
            .await?
        }
        _ => {
            with_cancel(
                cancel,
                monitor
                    .folder
                    .list_by_id(None, window, monitor.required_fields, flags),
            )
            .await?
        }
    };
    expand_and_add(monitor, cancel, emails, true, local_only).await?;

    let (after, size_now) =
        monitor.with_state(|s| (s.conversations.email_count(), s.conversations.len()));
    let total = monitor.folder.email_total();
    monitor.with_state_mut(|s| s.all_loaded = after >= total);

    // Progress was made but the window is still short: go around again.
    if after > before && size_now < window {
        monitor.queue.add(Operation::FillWindow { is_insert: false });
    }
    Ok(())
}

/// Ingest emails that appeared in the monitored folder
async fn append(
    monitor: &ConversationMonitor,
    cancel: &CancellationToken,
    ids: Vec<EmailId>,
) -> HeimdallResult<()> {
    monitor.emit(MonitorEvent::ScanStarted { local_only: false });
    let emails = with_cancel(
        cancel,
        monitor
            .folder
            .list_by_sparse_id(&ids, monitor.required_fields, ListFlags::empty()),
    )
    .await?;
    expand_and_add(monitor, cancel, emails, true, false).await
}

/// Drop emails from the set, then re-materialize out-of-folder
/// representatives for every conversation the removal trimmed
async fn remove(
    monitor: &ConversationMonitor,
    cancel: &CancellationToken,
    ids: Vec<EmailId>,
) -> HeimdallResult<()> {
    let result = monitor.with_state_mut(|s| s.conversations.remove(&ids))?;

    let mut closure_ids: BTreeSet<MessageId> = BTreeSet::new();
    for (conv, _) in &result.trimmed {
        closure_ids.extend(conv.message_ids().iter().cloned());
    }

    for (conversation, emails) in result.trimmed {
        monitor.emit(MonitorEvent::ConversationTrimmed { conversation, emails });
    }
    for conversation in result.removed {
        monitor.emit(MonitorEvent::ConversationRemoved { conversation });
    }

    if !closure_ids.is_empty() {
        let mids: Vec<MessageId> = closure_ids.into_iter().collect();
        let found = search_message_ids(monitor, cancel, &mids).await?;
        if !found.is_empty() {
            expand_and_add(monitor, cancel, found, false, true).await?;
        }
    }
    Ok(())
}

/// Ingest emails from another folder that thread into held conversations
async fn external_append(
    monitor: &ConversationMonitor,
    cancel: &CancellationToken,
    folder: FolderPath,
    ids: Vec<EmailId>,
) -> HeimdallResult<()> {
    if monitor.blacklist.contains_folder(&folder) {
        return Ok(());
    }
    if monitor.with_state(|s| s.conversations.is_empty()) {
        return Ok(());
    }

    let foreign = with_cancel(cancel, monitor.account.open_folder(&folder)).await?;
    with_cancel(cancel, foreign.open(OpenFlags::empty())).await?;
    let result = external_append_scan(monitor, cancel, foreign.as_ref(), &folder, &ids).await;
    if let Err(e) = foreign.close().await {
        warn!(folder = %folder, error = %e, "failed to close foreign folder");
    }
    result
}

async fn external_append_scan(
    monitor: &ConversationMonitor,
    cancel: &CancellationToken,
    foreign: &dyn FolderAdapter,
    folder: &FolderPath,
    ids: &[EmailId],
) -> HeimdallResult<()> {
    // Cheap prefilter: references only, keep the ids that thread into a
    // held conversation.
    let refs = with_cancel(
        cancel,
        foreign.list_by_sparse_id(ids, FieldSet::REFERENCES, ListFlags::empty()),
    )
    .await?;
    let interesting: Vec<EmailId> = monitor.with_state(|s| {
        refs.iter()
            .filter(|e| {
                e.ancestors()
                    .iter()
                    .any(|mid| s.conversations.has_message_id(mid))
            })
            .map(|e| e.id)
            .collect()
    });
    if interesting.is_empty() {
        return Ok(());
    }

    let full = with_cancel(
        cancel,
        foreign.list_by_sparse_id(&interesting, monitor.required_fields, ListFlags::empty()),
    )
    .await?;
    let mut batch = Vec::with_capacity(full.len());
    for email in full {
        let fetched = with_cancel(
            cancel,
            monitor
                .account
                .local_fetch(folder, email.id, monitor.required_fields),
        )
        .await?;
        batch.push(fetched.unwrap_or(email));
    }
    batch.retain(|e| monitor.blacklist.allows(e));
    debug!(folder = %folder, count = batch.len(), "external append threads in");
    expand_and_add(monitor, cancel, batch, false, true).await
}

/// Search the local store for every given Message-ID, a bounded chunk at a
/// time
async fn search_message_ids(
    monitor: &ConversationMonitor,
    cancel: &CancellationToken,
    mids: &[MessageId],
) -> HeimdallResult<Vec<Email>> {
    let mut found = Vec::new();
    for chunk in mids.chunks(LOCAL_SEARCH_CONCURRENCY) {
        let searches = chunk.iter().map(|mid| {
            monitor.account.search_message_id(
                mid,
                monitor.required_fields,
                &monitor.blacklist.folders,
                monitor.blacklist.flags,
            )
        });
        let results =
            with_cancel(cancel, async move { Ok::<_, HeimdallError>(join_all(searches).await) })
                .await?;
        for result in results {
            found.extend(result?);
        }
    }
    Ok(found)
}

/// The shared ingestion pipeline.
///
/// Collapses duplicate ids, recursively pulls in locally-cached emails for
/// ancestor Message-IDs the set does not know yet, then applies the whole
/// accumulated batch atomically. Recursion terminates because every round
/// either adds a strictly new email id or stops.
pub(crate) async fn expand_and_add(
    monitor: &ConversationMonitor,
    cancel: &CancellationToken,
    batch: Vec<Email>,
    inside_scan: bool,
    local_only: bool,
) -> HeimdallResult<()> {
    let mut accumulated: BTreeMap<EmailId, Email> = BTreeMap::new();
    for email in batch {
        accumulated.entry(email.id).or_insert(email);
    }

    let mut searched: BTreeSet<MessageId> = BTreeSet::new();
    loop {
        let needed: Vec<MessageId> = monitor.with_state(|s| {
            let mut needed = BTreeSet::new();
            for email in accumulated.values() {
                for mid in email.ancestors() {
                    if !searched.contains(&mid) && !s.conversations.has_message_id(&mid) {
                        needed.insert(mid);
                    }
                }
            }
            needed.into_iter().collect()
        });
        if needed.is_empty() {
            break;
        }
        searched.extend(needed.iter().cloned());

        let found = search_message_ids(monitor, cancel, &needed).await?;
        let mut grew = false;
        for email in found {
            if let std::collections::btree_map::Entry::Vacant(entry) =
                accumulated.entry(email.id)
            {
                entry.insert(email);
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    let result = monitor
        .with_state_mut(|s| s.conversations.add_all(accumulated.into_values().collect()))?;
    monitor.emit_add_result(result);
    if inside_scan {
        monitor.emit(MonitorEvent::ScanCompleted { local_only });
    }
    Ok(())
}
