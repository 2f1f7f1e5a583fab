//! Mailbox synchronization engine: a push listener keeps one folder under
//! long-poll watch, header ingestion threads new messages into the local
//! store, a backfill worker fills message bodies on secondary sessions, and
//! a periodic reconciler keeps every other folder eventually consistent.

mod backfill;
mod config;
mod engine;
mod ingest;
mod listener;
mod outbound;
mod reconcile;
mod retry;
mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use backfill::BackfillWorker;
pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use ingest::{IngestReport, ingest_folder};
pub use listener::PushListener;
pub use outbound::{OutgoingMessage, SmtpConfig, send_and_record, send_message};
pub use reconcile::reconcile_once;
pub use retry::RetryPolicy;
pub use session::{
    FolderStatus, IdleOutcome, ImapConfig, ImapConnector, ImapSession, MailSession, MessageMeta,
    SessionConnector,
};
