//! Per-account composition of the sync loops: folder discovery, the push
//! listener on the watched folder, the backfill worker, and the periodic
//! reconciler, all sharing one cancellation token.

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tidemail_core::{Account, Folder, MailStore};

use crate::backfill::BackfillWorker;
use crate::config::SyncConfig;
use crate::listener::PushListener;
use crate::reconcile;
use crate::session::{MailSession, SessionConnector};

pub struct SyncEngine<C, S>
where
    C: SessionConnector,
    S: MailStore + ?Sized + 'static,
{
    connector: Arc<C>,
    store: Arc<S>,
    account: Account,
    config: SyncConfig,
    token: CancellationToken,
    listener: Option<PushListener<C, S>>,
    backfill: Option<BackfillWorker>,
    reconciler: Option<JoinHandle<()>>,
}

impl<C, S> SyncEngine<C, S>
where
    C: SessionConnector,
    S: MailStore + ?Sized + 'static,
{
    pub fn new(connector: C, store: Arc<S>, account: Account, config: SyncConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            store,
            account,
            config,
            token: CancellationToken::new(),
            listener: None,
            backfill: None,
            reconciler: None,
        }
    }

    /// Foreground connectivity check: dial, authenticate, list folders, log
    /// out. The one failure path surfaced to a caller instead of a log.
    pub async fn verify_login(&self) -> Result<Vec<String>> {
        let connector = self.connector.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let mut session = connector.connect()?;
            let folders = session.list_folders();
            session.logout();
            folders
        })
        .await
        .map_err(|err| anyhow!("login check task failed: {err}"))?
    }

    /// Lists selectable folders on the server and registers unknown names
    /// in the store. The engine never deletes a folder row.
    pub async fn register_folders(&self) -> Result<Vec<Folder>> {
        let connector = self.connector.clone();
        let names = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let mut session = connector.connect()?;
            let names = session.list_folders();
            session.logout();
            names
        })
        .await
        .map_err(|err| anyhow!("folder discovery task failed: {err}"))??;

        let mut folders = Vec::with_capacity(names.len());
        for name in names {
            folders.push(self.store.ensure_folder(self.account.id, &name).await?);
        }
        Ok(folders)
    }

    /// Discovers folders, then brings up the backfill worker, the push
    /// listener on `watch_folder`, and the reconciler over everything else.
    pub async fn start(&mut self, watch_folder: &str) -> Result<()> {
        if self.listener.is_some() {
            bail!("sync engine already started");
        }
        // an earlier failed start leaves the token cancelled
        if self.token.is_cancelled() {
            self.token = CancellationToken::new();
        }
        self.register_folders().await?;

        let backfill = BackfillWorker::spawn(
            self.connector.clone(),
            self.store.clone(),
            self.account.id,
            self.config.clone(),
            self.token.clone(),
        );

        let mut listener = PushListener::new(
            self.connector.clone(),
            self.store.clone(),
            self.account.id,
            self.config.clone(),
            self.token.clone(),
        );
        listener.set_backfill_queue(backfill.sender());
        if let Err(err) = listener.start(watch_folder).await {
            // first session at startup is the one fatal failure
            self.token.cancel();
            backfill.shutdown(self.config.shutdown_timeout).await;
            return Err(err);
        }

        let reconciler = reconcile::spawn(
            self.connector.clone(),
            self.store.clone(),
            self.account.id,
            Some(watch_folder.to_string()),
            self.config.clone(),
            self.token.clone(),
        );

        self.backfill = Some(backfill);
        self.listener = Some(listener);
        self.reconciler = Some(reconciler);
        info!(account = %self.account.name, folder = watch_folder, "sync engine started");
        Ok(())
    }

    /// Nudges the listener to run an ingestion pass after its current wait.
    pub fn trigger_sync(&self) {
        if let Some(listener) = &self.listener {
            listener.trigger();
        }
    }

    pub async fn shutdown(&mut self) {
        self.token.cancel();
        if let Some(mut listener) = self.listener.take() {
            listener.stop().await;
        }
        if let Some(backfill) = self.backfill.take() {
            backfill.shutdown(self.config.shutdown_timeout).await;
        }
        if let Some(reconciler) = self.reconciler.take() {
            if tokio::time::timeout(self.config.shutdown_timeout, reconciler)
                .await
                .is_err()
            {
                warn!("reconciler did not stop in time, detaching");
            }
        }
        info!(account = %self.account.name, "sync engine stopped");
    }
}
