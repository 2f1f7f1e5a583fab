//! Push listener: one folder under long-poll watch on a dedicated thread.
//! The session is single-owner; other components nudge the listener through
//! a trigger channel drained between waits rather than touching the
//! connection themselves.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tidemail_core::{Folder, MailStore};

use crate::config::SyncConfig;
use crate::ingest::ingest_folder;
use crate::session::{IdleOutcome, MailSession, SessionConnector};

pub struct PushListener<C, S>
where
    C: SessionConnector,
    S: MailStore + ?Sized + 'static,
{
    connector: Arc<C>,
    store: Arc<S>,
    config: SyncConfig,
    account_id: i64,
    backfill_queue: Option<mpsc::Sender<i64>>,
    token: CancellationToken,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: Option<mpsc::Receiver<()>>,
    worker: Option<thread::JoinHandle<()>>,
    done_rx: Option<std::sync::mpsc::Receiver<()>>,
    watching: Option<String>,
}

impl<C, S> PushListener<C, S>
where
    C: SessionConnector,
    S: MailStore + ?Sized + 'static,
{
    pub fn new(
        connector: Arc<C>,
        store: Arc<S>,
        account_id: i64,
        config: SyncConfig,
        token: CancellationToken,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Self {
            connector,
            store,
            config,
            account_id,
            backfill_queue: None,
            token,
            trigger_tx,
            trigger_rx: Some(trigger_rx),
            worker: None,
            done_rx: None,
            watching: None,
        }
    }

    /// Row ids of newly ingested messages are offered to this queue.
    pub fn set_backfill_queue(&mut self, queue: mpsc::Sender<i64>) {
        self.backfill_queue = Some(queue);
    }

    pub fn watching(&self) -> Option<&str> {
        self.watching.as_deref()
    }

    /// Nudges the listener to run an ingestion pass after its current wait.
    /// Non-blocking; coalesces with a pending trigger.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Begins watching one folder. Fails if already watching, if the folder
    /// is not registered locally, or if the server lacks long-poll support.
    pub async fn start(&mut self, folder_name: &str) -> Result<()> {
        if self.worker.is_some() {
            bail!("already watching {:?}", self.watching);
        }
        let folder = self
            .store
            .folder_by_name(self.account_id, folder_name)
            .await?
            .ok_or_else(|| anyhow!("folder {folder_name} is not registered locally"))?;

        let connector = self.connector.clone();
        let name = folder.name.clone();
        let session = tokio::task::spawn_blocking(move || -> Result<C::Session> {
            let mut session = connector.connect()?;
            match session.supports_idle() {
                Ok(true) => {}
                Ok(false) => {
                    session.logout();
                    bail!("server does not advertise IDLE");
                }
                Err(err) => {
                    session.logout();
                    return Err(err);
                }
            }
            session.select(&name)?;
            Ok(session)
        })
        .await
        .map_err(|err| anyhow!("listener setup task failed: {err}"))??;

        let trigger_rx = self
            .trigger_rx
            .take()
            .ok_or_else(|| anyhow!("listener cannot be restarted"))?;
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let ctx = WatchContext {
            connector: self.connector.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            folder,
            backfill_queue: self.backfill_queue.clone(),
            token: self.token.clone(),
            handle: Handle::current(),
        };
        let worker = thread::Builder::new()
            .name("push-listener".into())
            .spawn(move || {
                watch_loop::<C, S>(session, ctx, trigger_rx);
                let _ = done_tx.send(());
            })?;
        self.worker = Some(worker);
        self.done_rx = Some(done_rx);
        self.watching = Some(folder_name.to_string());
        info!(folder = folder_name, "push listener started");
        Ok(())
    }

    /// Cancels the watch loop and waits a bounded time for the thread. A
    /// wait already in flight only ends at its idle timeout, so the thread
    /// may outlive this call; it is detached with a warning then.
    pub async fn stop(&mut self) {
        self.token.cancel();
        let Some(worker) = self.worker.take() else {
            return;
        };
        let done_rx = self.done_rx.take();
        let timeout = self.config.shutdown_timeout;
        let finished = tokio::task::spawn_blocking(move || {
            done_rx.is_some_and(|rx| rx.recv_timeout(timeout).is_ok())
        })
        .await
        .unwrap_or(false);
        if finished {
            let _ = worker.join();
        } else {
            warn!("push listener did not stop in time, detaching");
        }
        self.watching = None;
    }
}

struct WatchContext<C, S>
where
    C: SessionConnector,
    S: MailStore + ?Sized + 'static,
{
    connector: Arc<C>,
    store: Arc<S>,
    config: SyncConfig,
    folder: Folder,
    backfill_queue: Option<mpsc::Sender<i64>>,
    token: CancellationToken,
    handle: Handle,
}

fn watch_loop<C, S>(
    mut session: C::Session,
    ctx: WatchContext<C, S>,
    mut trigger_rx: mpsc::Receiver<()>,
) where
    C: SessionConnector,
    S: MailStore + ?Sized + 'static,
{
    // catch-up pass before the first wait
    run_ingest(&mut session, &ctx);

    while !ctx.token.is_cancelled() {
        // triggers that arrived while the previous wait was outstanding
        let mut triggered = false;
        while trigger_rx.try_recv().is_ok() {
            triggered = true;
        }
        if triggered {
            run_ingest(&mut session, &ctx);
            if ctx.token.is_cancelled() {
                break;
            }
        }

        match session.idle_wait(ctx.config.idle_restart_interval) {
            Ok(IdleOutcome::MailboxChanged) => {
                if ctx.token.is_cancelled() {
                    break;
                }
                run_ingest(&mut session, &ctx);
            }
            Ok(IdleOutcome::TimedOut) => {
                debug!(folder = %ctx.folder.name, "idle wait timed out, restarting");
            }
            Err(err) => {
                warn!(folder = %ctx.folder.name, error = %err, "idle wait failed");
                if !sleep_cancellable(&ctx, ctx.config.idle_retry_delay) {
                    break;
                }
                if let Some(replacement) = reconnect(&ctx) {
                    session = replacement;
                }
            }
        }
    }
    session.logout();
    debug!(folder = %ctx.folder.name, "push listener stopped");
}

fn run_ingest<C, S>(session: &mut C::Session, ctx: &WatchContext<C, S>)
where
    C: SessionConnector,
    S: MailStore + ?Sized + 'static,
{
    let result = ctx
        .handle
        .block_on(ingest_folder(session, ctx.store.as_ref(), &ctx.folder));
    match result {
        Ok(report) => {
            if !report.stored.is_empty() {
                info!(
                    folder = %ctx.folder.name,
                    count = report.stored.len(),
                    "ingested new messages"
                );
            }
            if let Some(queue) = &ctx.backfill_queue {
                for id in report.stored {
                    // non-blocking; the periodic scan picks up anything dropped
                    let _ = queue.try_send(id);
                }
            }
        }
        Err(err) => {
            warn!(folder = %ctx.folder.name, error = %err, "header ingestion failed");
        }
    }
}

/// Returns false when cancelled mid-sleep.
fn sleep_cancellable<C, S>(ctx: &WatchContext<C, S>, duration: Duration) -> bool
where
    C: SessionConnector,
    S: MailStore + ?Sized + 'static,
{
    ctx.handle.block_on(async {
        tokio::select! {
            _ = ctx.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    })
}

/// Re-establishes the watch session under the retry policy. Exhaustion
/// returns None; the loop retries on its next failed wait.
fn reconnect<C, S>(ctx: &WatchContext<C, S>) -> Option<C::Session>
where
    C: SessionConnector,
    S: MailStore + ?Sized + 'static,
{
    for delay in ctx.config.retry.delays() {
        if ctx.token.is_cancelled() {
            return None;
        }
        let attempt = ctx.connector.connect().and_then(|mut session| {
            session.select(&ctx.folder.name)?;
            Ok(session)
        });
        match attempt {
            Ok(session) => {
                info!(folder = %ctx.folder.name, "listener session re-established");
                return Some(session);
            }
            Err(err) => {
                warn!(folder = %ctx.folder.name, error = %err, "listener reconnect failed");
                if !sleep_cancellable(ctx, delay) {
                    return None;
                }
            }
        }
    }
    error!(folder = %ctx.folder.name, "listener reconnect attempts exhausted");
    None
}
