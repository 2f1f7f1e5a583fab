//! Periodic reconciliation: walks every known folder on an interval, with a
//! fresh session per folder, ingesting headers and immediately filling
//! missing bodies. The push-listener's folder is skipped; the watch loop
//! already keeps it current.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tidemail_core::{Folder, MailStore};

use crate::backfill;
use crate::config::SyncConfig;
use crate::ingest::ingest_folder;
use crate::retry::RetryPolicy;
use crate::session::{MailSession, SessionConnector};

pub fn spawn<C, S>(
    connector: Arc<C>,
    store: Arc<S>,
    account_id: i64,
    skip_folder: Option<String>,
    config: SyncConfig,
    token: CancellationToken,
) -> JoinHandle<()>
where
    C: SessionConnector,
    S: MailStore + ?Sized + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.reconcile_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = reconcile_once(
                connector.clone(),
                store.clone(),
                account_id,
                skip_folder.as_deref(),
                &config,
                &token,
            )
            .await
            {
                warn!(error = %err, "reconcile cycle failed");
            }
        }
        debug!("reconciler stopped");
    })
}

/// One pass over every registered folder. Per-folder failures are logged
/// and the walk continues.
pub async fn reconcile_once<C, S>(
    connector: Arc<C>,
    store: Arc<S>,
    account_id: i64,
    skip_folder: Option<&str>,
    config: &SyncConfig,
    token: &CancellationToken,
) -> Result<()>
where
    C: SessionConnector,
    S: MailStore + ?Sized + 'static,
{
    let folders = store.list_folders(account_id).await?;
    for folder in folders {
        if token.is_cancelled() {
            break;
        }
        if skip_folder == Some(folder.name.as_str()) {
            continue;
        }
        if let Err(err) = reconcile_folder(
            connector.clone(),
            store.clone(),
            folder.clone(),
            config.clone(),
            token.clone(),
        )
        .await
        {
            warn!(folder = %folder.name, error = %err, "folder reconcile failed");
        }
    }
    Ok(())
}

async fn reconcile_folder<C, S>(
    connector: Arc<C>,
    store: Arc<S>,
    folder: Folder,
    config: SyncConfig,
    token: CancellationToken,
) -> Result<()>
where
    C: SessionConnector,
    S: MailStore + ?Sized + 'static,
{
    let handle = Handle::current();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut session =
            connect_with_retry(connector.as_ref(), &folder.name, config.retry, &token, &handle)
                .ok_or_else(|| anyhow!("could not establish session for {}", folder.name))?;
        let result = handle.block_on(async {
            ingest_folder(&mut session, store.as_ref(), &folder).await?;
            backfill::fill_missing_in_folder(
                &mut session,
                store.as_ref(),
                folder.account_id,
                folder.id,
                &config,
            )
            .await?;
            Ok::<_, anyhow::Error>(())
        });
        session.logout();
        result
    })
    .await
    .map_err(|err| anyhow!("reconcile task failed: {err}"))?
}

fn connect_with_retry<C>(
    connector: &C,
    folder: &str,
    policy: RetryPolicy,
    token: &CancellationToken,
    handle: &Handle,
) -> Option<C::Session>
where
    C: SessionConnector,
{
    for delay in policy.delays() {
        if token.is_cancelled() {
            return None;
        }
        let attempt = connector.connect().and_then(|mut session| {
            session.select(folder)?;
            Ok(session)
        });
        match attempt {
            Ok(session) => return Some(session),
            Err(err) => {
                warn!(folder, error = %err, "reconcile connect failed");
                let cancelled = handle.block_on(async {
                    tokio::select! {
                        _ = token.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    }
                });
                if cancelled {
                    return None;
                }
            }
        }
    }
    None
}
