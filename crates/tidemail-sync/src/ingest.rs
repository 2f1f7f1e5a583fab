//! Header ingestion and threading: turns fetched message summaries into
//! headers-only store rows linked into conversation threads.

use anyhow::Result;
use tracing::{debug, warn};

use tidemail_core::{Folder, MailStore, NewMessage, parse_date_ts};

use crate::session::{MailSession, MessageMeta};

#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    /// Summaries returned by the fetch, before any skip rules.
    pub fetched: usize,
    /// Row ids of the messages persisted this pass.
    pub stored: Vec<i64>,
}

/// One incremental pass over a folder already selected on `session`: fetch
/// everything above the stored high-water mark and persist each summary.
/// Per-record failures are logged and skipped; they never abort the batch.
pub async fn ingest_folder<Sess, St>(
    session: &mut Sess,
    store: &St,
    folder: &Folder,
) -> Result<IngestReport>
where
    Sess: MailSession + ?Sized,
    St: MailStore + ?Sized,
{
    let status = session.status(&folder.name)?;
    if status.messages == 0 {
        return Ok(IngestReport::default());
    }
    debug!(
        folder = %folder.name,
        messages = status.messages,
        uid_next = ?status.uid_next,
        "folder status"
    );

    let high_water = store.highest_uid_in_folder(folder.id).await?;
    let uid_from = high_water.map_or(1, |uid| uid.saturating_add(1));
    let summaries = session.fetch_headers_from(uid_from)?;

    let mut report = IngestReport {
        fetched: summaries.len(),
        stored: Vec::new(),
    };
    for summary in summaries {
        // "n:*" echoes the highest-uid message even when n exceeds it
        if summary.uid < uid_from {
            continue;
        }
        match ingest_one(store, folder, &summary).await {
            Ok(Some(id)) => report.stored.push(id),
            Ok(None) => {}
            Err(err) => warn!(
                folder = %folder.name,
                uid = summary.uid,
                error = %err,
                "failed to store message, skipping"
            ),
        }
    }
    Ok(report)
}

async fn ingest_one<St>(store: &St, folder: &Folder, summary: &MessageMeta) -> Result<Option<i64>>
where
    St: MailStore + ?Sized,
{
    // global message-id guard: a message visible through two folders still
    // gets exactly one row
    if !summary.message_id.is_empty()
        && store
            .message_by_message_id(&summary.message_id)
            .await?
            .is_some()
    {
        return Ok(None);
    }
    let Some(from_address) = summary.from_address.as_deref() else {
        debug!(uid = summary.uid, "summary has no sender, skipping");
        return Ok(None);
    };
    if summary.to_addresses.is_empty() {
        debug!(uid = summary.uid, "summary has no recipient, skipping");
        return Ok(None);
    }

    let date_ts = parse_date_ts(&summary.date);
    let thread_id = resolve_thread(store, folder.account_id, summary, date_ts).await?;

    let record = NewMessage {
        uid: summary.uid,
        thread_id,
        account_id: folder.account_id,
        folder_id: folder.id,
        message_id: summary.message_id.clone(),
        from_address: from_address.to_string(),
        from_name: summary.from_name.clone(),
        to_addresses: summary.to_addresses.join(", "),
        cc_addresses: join_nonempty(&summary.cc_addresses),
        bcc_addresses: join_nonempty(&summary.bcc_addresses),
        subject: summary.subject.clone(),
        date: summary.date.clone(),
        is_read: summary.is_read,
        is_starred: summary.is_starred,
        is_draft: summary.is_draft,
    };
    let id = store.insert_message(&record).await?;
    Ok(Some(id))
}

/// Reply-chain threading only: an in-reply-to hit reuses the parent's
/// thread and rewrites the thread's subject and timestamp; anything else
/// starts a fresh thread.
async fn resolve_thread<St>(
    store: &St,
    account_id: i64,
    summary: &MessageMeta,
    date_ts: i64,
) -> Result<i64>
where
    St: MailStore + ?Sized,
{
    if let Some(parent_id) = summary.in_reply_to.as_deref() {
        if let Some(parent) = store.message_by_message_id(parent_id).await? {
            store
                .update_thread(parent.thread_id, &summary.subject, date_ts)
                .await?;
            return Ok(parent.thread_id);
        }
    }
    store
        .create_thread(account_id, &summary.subject, date_ts)
        .await
}

fn join_nonempty(list: &[String]) -> Option<String> {
    if list.is_empty() {
        None
    } else {
        Some(list.join(", "))
    }
}
