//! Protocol session seam. Engine components are generic over these traits;
//! the IMAP implementation lives alongside them.

use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, FixedOffset};
use imap::extensions::idle::WaitOutcome;
use imap::types::Flag;
use imap::{ClientBuilder, ConnectionMode};
use imap_proto::types::{Address, Envelope};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub skip_tls_verify: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FolderStatus {
    pub messages: u32,
    pub uid_next: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    TimedOut,
    MailboxChanged,
}

/// Envelope-level view of one remote message, as returned by a headers-only
/// fetch. Body content is never carried here.
#[derive(Debug, Clone, Default)]
pub struct MessageMeta {
    pub uid: u32,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub subject: String,
    pub date: String,
    pub from_address: Option<String>,
    pub from_name: Option<String>,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub bcc_addresses: Vec<String>,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_draft: bool,
}

/// One authenticated connection. Commands run one at a time; a wait makes
/// the connection unusable for anything else until it returns.
pub trait MailSession: Send {
    fn supports_idle(&mut self) -> Result<bool>;
    fn list_folders(&mut self) -> Result<Vec<String>>;
    fn select(&mut self, folder: &str) -> Result<()>;
    fn status(&mut self, folder: &str) -> Result<FolderStatus>;
    /// Headers-only fetch for every message with uid >= `uid_from` in the
    /// selected folder. Servers echo the highest-uid message even when
    /// `uid_from` exceeds it; callers filter on the floor themselves.
    fn fetch_headers_from(&mut self, uid_from: u32) -> Result<Vec<MessageMeta>>;
    fn fetch_body(&mut self, uid: u32) -> Result<Vec<u8>>;
    fn idle_wait(&mut self, timeout: Duration) -> Result<IdleOutcome>;
    fn append(
        &mut self,
        folder: &str,
        body: &[u8],
        seen: bool,
        date: DateTime<FixedOffset>,
    ) -> Result<()>;
    /// Best-effort teardown; never fails.
    fn logout(&mut self);
}

pub trait SessionConnector: Send + Sync + 'static {
    type Session: MailSession + 'static;

    /// Dials and authenticates a fresh session.
    fn connect(&self) -> Result<Self::Session>;
}

#[derive(Clone)]
pub struct ImapConnector {
    config: ImapConfig,
}

impl ImapConnector {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

impl SessionConnector for ImapConnector {
    type Session = ImapSession;

    fn connect(&self) -> Result<ImapSession> {
        let config = &self.config;
        let client = ClientBuilder::new(config.host.as_str(), config.port)
            .tls_kind(imap::TlsKind::Native)
            .mode(ConnectionMode::AutoTls)
            .danger_skip_tls_verify(config.skip_tls_verify)
            .connect()?;
        let session = client
            .login(&config.username, &config.password)
            .map_err(|e| e.0)?;
        debug!(host = %config.host, port = config.port, "imap login ok");
        Ok(ImapSession { session })
    }
}

pub struct ImapSession {
    session: imap::Session<imap::Connection>,
}

impl MailSession for ImapSession {
    fn supports_idle(&mut self) -> Result<bool> {
        Ok(self.session.capabilities()?.has_str("IDLE"))
    }

    fn list_folders(&mut self) -> Result<Vec<String>> {
        let list = self.session.list(None, Some("*"))?;
        let mut names = Vec::new();
        for folder in list.iter() {
            if folder
                .attributes()
                .iter()
                .any(|attr| matches!(attr, imap_proto::NameAttribute::NoSelect))
            {
                continue;
            }
            names.push(folder.name().to_string());
        }
        Ok(names)
    }

    fn select(&mut self, folder: &str) -> Result<()> {
        self.session.select(folder)?;
        Ok(())
    }

    fn status(&mut self, folder: &str) -> Result<FolderStatus> {
        let mailbox = self.session.status(folder, "(MESSAGES UIDNEXT)")?;
        Ok(FolderStatus {
            messages: mailbox.exists,
            uid_next: mailbox.uid_next,
        })
    }

    fn fetch_headers_from(&mut self, uid_from: u32) -> Result<Vec<MessageMeta>> {
        let range = format!("{}:*", uid_from);
        let fetches = self
            .session
            .uid_fetch(range, "(UID FLAGS ENVELOPE BODYSTRUCTURE)")?;
        let mut out = Vec::new();
        for fetch in fetches.iter() {
            let Some(uid) = fetch.uid else { continue };
            let Some(envelope) = fetch.envelope() else {
                continue;
            };
            out.push(meta_from_envelope(uid, envelope, fetch.flags()));
        }
        Ok(out)
    }

    fn fetch_body(&mut self, uid: u32) -> Result<Vec<u8>> {
        let fetches = self.session.uid_fetch(uid.to_string(), "RFC822")?;
        fetches
            .iter()
            .find_map(|f| f.body().map(|b| b.to_vec()))
            .ok_or_else(|| anyhow!("no body returned for uid {}", uid))
    }

    fn idle_wait(&mut self, timeout: Duration) -> Result<IdleOutcome> {
        let mut idle = self.session.idle();
        idle.timeout(timeout);
        match idle.wait_while(imap::extensions::idle::stop_on_any)? {
            WaitOutcome::TimedOut => Ok(IdleOutcome::TimedOut),
            WaitOutcome::MailboxChanged => Ok(IdleOutcome::MailboxChanged),
        }
    }

    fn append(
        &mut self,
        folder: &str,
        body: &[u8],
        seen: bool,
        date: DateTime<FixedOffset>,
    ) -> Result<()> {
        let mut cmd = self.session.append(folder, body);
        if seen {
            cmd.flag(Flag::Seen);
        }
        cmd.internal_date(date);
        cmd.finish()?;
        Ok(())
    }

    fn logout(&mut self) {
        if let Err(err) = self.session.logout() {
            debug!(error = %err, "imap logout failed");
        }
    }
}

fn meta_from_envelope(uid: u32, envelope: &Envelope<'_>, flags: &[Flag<'_>]) -> MessageMeta {
    let (from_address, from_name) = envelope
        .from
        .as_deref()
        .and_then(|from| from.first())
        .map(|addr| (address_string(addr), address_name(addr)))
        .unwrap_or((None, None));

    MessageMeta {
        uid,
        message_id: envelope
            .message_id
            .as_deref()
            .and_then(|raw| normalize_msg_id(&String::from_utf8_lossy(raw)))
            .unwrap_or_default(),
        in_reply_to: envelope
            .in_reply_to
            .as_deref()
            .and_then(|raw| normalize_msg_id(&String::from_utf8_lossy(raw))),
        subject: envelope
            .subject
            .as_deref()
            .map(decode_header_text)
            .unwrap_or_default(),
        date: envelope
            .date
            .as_deref()
            .map(|raw| String::from_utf8_lossy(raw).trim().to_string())
            .unwrap_or_default(),
        from_address,
        from_name,
        to_addresses: address_strings(envelope.to.as_deref()),
        cc_addresses: address_strings(envelope.cc.as_deref()),
        bcc_addresses: address_strings(envelope.bcc.as_deref()),
        is_read: flags.iter().any(|f| matches!(f, Flag::Seen)),
        is_starred: flags.iter().any(|f| matches!(f, Flag::Flagged)),
        is_draft: flags.iter().any(|f| matches!(f, Flag::Draft)),
    }
}

fn address_strings(addrs: Option<&[Address<'_>]>) -> Vec<String> {
    addrs
        .unwrap_or(&[])
        .iter()
        .filter_map(address_string)
        .collect()
}

fn address_string(addr: &Address<'_>) -> Option<String> {
    let mailbox = addr.mailbox.as_deref()?;
    let host = addr.host.as_deref()?;
    Some(format!(
        "{}@{}",
        String::from_utf8_lossy(mailbox),
        String::from_utf8_lossy(host)
    ))
}

fn address_name(addr: &Address<'_>) -> Option<String> {
    let name = decode_header_text(addr.name.as_deref()?);
    if name.is_empty() { None } else { Some(name) }
}

/// Envelope strings may carry RFC 2047 encoded words; run them through the
/// header parser when they do.
fn decode_header_text(raw: &[u8]) -> String {
    let lossy = String::from_utf8_lossy(raw);
    if !lossy.contains("=?") {
        return lossy.trim().to_string();
    }
    let header = format!("X: {}", lossy);
    match mailparse::parse_header(header.as_bytes()) {
        Ok((parsed, _)) => parsed.get_value().trim().to_string(),
        Err(_) => lossy.trim().to_string(),
    }
}

/// Bare message-id, angle brackets stripped, so stored ids and in-reply-to
/// lookups compare consistently.
fn normalize_msg_id(raw: &str) -> Option<String> {
    if let Ok(ids) = mailparse::msgidparse(raw) {
        if let Some(first) = ids.first() {
            return Some(first.clone());
        }
    }
    let trimmed = raw.trim().trim_start_matches('<').trim_end_matches('>');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
