//! Body backfill: a bounded queue plus a single consumer that fetches full
//! message bodies on short-lived secondary sessions, keeping slow body
//! traffic off the push listener's connection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tidemail_core::MailStore;
use tidemail_content::ExtractedContent;

use crate::config::SyncConfig;
use crate::session::{MailSession, SessionConnector};

pub struct BackfillWorker {
    queue: mpsc::Sender<i64>,
    producer: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

impl BackfillWorker {
    pub fn spawn<C, S>(
        connector: Arc<C>,
        store: Arc<S>,
        account_id: i64,
        config: SyncConfig,
        token: CancellationToken,
    ) -> Self
    where
        C: SessionConnector,
        S: MailStore + ?Sized + 'static,
    {
        let (tx, rx) = mpsc::channel(config.backfill_queue_capacity.max(1));
        let producer = tokio::spawn(producer_loop(
            store.clone(),
            account_id,
            tx.clone(),
            config.clone(),
            token.clone(),
        ));
        let consumer = tokio::spawn(consumer_loop(connector, store, rx, config, token));
        Self {
            queue: tx,
            producer,
            consumer,
        }
    }

    /// Non-blocking offer; a full queue drops the id, which the periodic
    /// scan picks up again later.
    pub fn enqueue(&self, message_row_id: i64) {
        match self.queue.try_send(message_row_id) {
            Ok(()) => {}
            Err(TrySendError::Full(id)) => debug!(id, "backfill queue full, dropping"),
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub fn sender(&self) -> mpsc::Sender<i64> {
        self.queue.clone()
    }

    /// Assumes the shared token was already cancelled.
    pub async fn shutdown(self, timeout: Duration) {
        drop(self.queue);
        let join = async {
            let _ = self.producer.await;
            let _ = self.consumer.await;
        };
        if tokio::time::timeout(timeout, join).await.is_err() {
            warn!("backfill worker did not stop in time, detaching");
        }
    }
}

async fn producer_loop<S>(
    store: Arc<S>,
    account_id: i64,
    tx: mpsc::Sender<i64>,
    config: SyncConfig,
    token: CancellationToken,
) where
    S: MailStore + ?Sized,
{
    let mut ticker = tokio::time::interval(config.backfill_scan_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let missing = match store
            .messages_missing_body(account_id, None, config.backfill_batch_limit)
            .await
        {
            Ok(missing) => missing,
            Err(err) => {
                warn!(error = %err, "missing-body scan failed");
                continue;
            }
        };
        for item in missing {
            match tx.try_send(item.id) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!("backfill queue full, deferring rest to next scan");
                    break;
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }
    debug!("backfill producer stopped");
}

async fn consumer_loop<C, S>(
    connector: Arc<C>,
    store: Arc<S>,
    mut rx: mpsc::Receiver<i64>,
    config: SyncConfig,
    token: CancellationToken,
) where
    C: SessionConnector,
    S: MailStore + ?Sized,
{
    loop {
        let id = tokio::select! {
            _ = token.cancelled() => break,
            id = rx.recv() => match id {
                Some(id) => id,
                None => break,
            },
        };
        match fill_body(connector.clone(), store.as_ref(), id).await {
            Ok(true) => debug!(id, "body backfilled"),
            Ok(false) => {}
            Err(err) => warn!(id, error = %err, "body backfill failed"),
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(config.backfill_fetch_delay) => {}
        }
    }
    debug!("backfill consumer stopped");
}

/// Fetches and stores one message body over a fresh session. Returns false
/// when there was nothing to do (row gone or body already filled).
pub(crate) async fn fill_body<C, S>(connector: Arc<C>, store: &S, id: i64) -> Result<bool>
where
    C: SessionConnector,
    S: MailStore + ?Sized,
{
    let Some(message) = store.get_message(id).await? else {
        return Ok(false);
    };
    // another component may have filled it since the scan
    if message.body_text.is_some() {
        return Ok(false);
    }
    let folder = store
        .get_folder(message.folder_id)
        .await?
        .ok_or_else(|| anyhow!("folder {} not found", message.folder_id))?;

    let uid = message.uid;
    let folder_name = folder.name;
    let raw =
        tokio::task::spawn_blocking(move || fetch_raw_body(connector.as_ref(), &folder_name, uid))
            .await
            .map_err(|err| anyhow!("body fetch task failed: {err}"))??;

    let content = tidemail_content::extract_content(&raw)?;
    store_content(store, id, &content).await?;
    Ok(true)
}

fn fetch_raw_body<C: SessionConnector>(connector: &C, folder: &str, uid: u32) -> Result<Vec<u8>> {
    let mut session = connector.connect()?;
    let result = (|| {
        session.select(folder)?;
        session.fetch_body(uid)
    })();
    // teardown runs on every exit path
    session.logout();
    result
}

/// Immediate body pass over one folder, reusing a session the caller
/// already selected. Used by the reconciler instead of the queue.
pub(crate) async fn fill_missing_in_folder<Sess, St>(
    session: &mut Sess,
    store: &St,
    account_id: i64,
    folder_id: i64,
    config: &SyncConfig,
) -> Result<usize>
where
    Sess: MailSession + ?Sized,
    St: MailStore + ?Sized,
{
    let missing = store
        .messages_missing_body(account_id, Some(folder_id), config.backfill_batch_limit)
        .await?;
    let mut filled = 0usize;
    for item in missing {
        let Some(message) = store.get_message(item.id).await? else {
            continue;
        };
        if message.body_text.is_some() {
            continue;
        }
        let raw = match session.fetch_body(message.uid) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(id = item.id, uid = message.uid, error = %err, "body fetch failed");
                continue;
            }
        };
        let content = match tidemail_content::extract_content(&raw) {
            Ok(content) => content,
            Err(err) => {
                warn!(id = item.id, error = %err, "body parse failed");
                continue;
            }
        };
        store_content(store, item.id, &content).await?;
        filled += 1;
        tokio::time::sleep(config.backfill_fetch_delay).await;
    }
    Ok(filled)
}

async fn store_content<S>(store: &S, id: i64, content: &ExtractedContent) -> Result<()>
where
    S: MailStore + ?Sized,
{
    // an empty body still marks the row filled so it is not refetched on
    // every scan (html-only messages)
    let body = content.body_text.clone().unwrap_or_default();
    let references = if content.references.is_empty() {
        None
    } else {
        Some(content.references.join(","))
    };
    store
        .update_message_content(id, Some(&body), references.as_deref())
        .await
}
