//! Scripted in-memory session/connector pair used by the engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, FixedOffset};

use tidemail_core::{Account, MailStore, SqliteMailStore};

use crate::session::{FolderStatus, IdleOutcome, MailSession, MessageMeta, SessionConnector};

#[derive(Default)]
pub struct MockState {
    pub folders: Vec<String>,
    pub messages: HashMap<String, Vec<MessageMeta>>,
    pub bodies: HashMap<(String, u32), Vec<u8>>,
    /// Outcomes handed out by `idle_wait`; once exhausted the mock sleeps
    /// briefly and reports a timeout, like a quiet server.
    pub idle_script: VecDeque<Result<IdleOutcome, String>>,
    pub supports_idle: bool,
    pub fail_connects: usize,
    pub connects: usize,
    pub header_fetches: usize,
    pub body_fetches: Vec<(String, u32)>,
    pub appends: Vec<(String, Vec<u8>)>,
    pub logouts: usize,
}

impl MockState {
    pub fn with_folders(folders: &[&str]) -> Self {
        Self {
            folders: folders.iter().map(|f| f.to_string()).collect(),
            supports_idle: true,
            ..Self::default()
        }
    }

    pub fn push_message(&mut self, folder: &str, meta: MessageMeta) {
        self.messages.entry(folder.to_string()).or_default().push(meta);
    }

    pub fn set_body(&mut self, folder: &str, uid: u32, raw: &[u8]) {
        self.bodies.insert((folder.to_string(), uid), raw.to_vec());
    }
}

#[derive(Clone)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new(state: MockState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl SessionConnector for MockConnector {
    type Session = MockSession;

    fn connect(&self) -> Result<MockSession> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(anyhow!("connection refused"));
        }
        Ok(MockSession {
            state: self.state.clone(),
            selected: None,
        })
    }
}

pub struct MockSession {
    state: Arc<Mutex<MockState>>,
    selected: Option<String>,
}

impl MockSession {
    fn selected(&self) -> Result<String> {
        self.selected
            .clone()
            .ok_or_else(|| anyhow!("no folder selected"))
    }
}

impl MailSession for MockSession {
    fn supports_idle(&mut self) -> Result<bool> {
        Ok(self.state.lock().unwrap().supports_idle)
    }

    fn list_folders(&mut self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().folders.clone())
    }

    fn select(&mut self, folder: &str) -> Result<()> {
        let state = self.state.lock().unwrap();
        if !state.folders.iter().any(|f| f == folder) {
            return Err(anyhow!("no such folder: {folder}"));
        }
        drop(state);
        self.selected = Some(folder.to_string());
        Ok(())
    }

    fn status(&mut self, folder: &str) -> Result<FolderStatus> {
        let state = self.state.lock().unwrap();
        let messages = state.messages.get(folder).map_or(0, Vec::len) as u32;
        let uid_next = state
            .messages
            .get(folder)
            .and_then(|list| list.iter().map(|m| m.uid).max())
            .map(|max| max + 1);
        Ok(FolderStatus { messages, uid_next })
    }

    fn fetch_headers_from(&mut self, uid_from: u32) -> Result<Vec<MessageMeta>> {
        let folder = self.selected()?;
        let mut state = self.state.lock().unwrap();
        state.header_fetches += 1;
        let all = state.messages.get(&folder).cloned().unwrap_or_default();
        let matching: Vec<MessageMeta> = all
            .iter()
            .filter(|m| m.uid >= uid_from)
            .cloned()
            .collect();
        if matching.is_empty() {
            // a real server echoes the highest-uid message for "n:*"
            return Ok(all
                .iter()
                .max_by_key(|m| m.uid)
                .cloned()
                .into_iter()
                .collect());
        }
        Ok(matching)
    }

    fn fetch_body(&mut self, uid: u32) -> Result<Vec<u8>> {
        let folder = self.selected()?;
        let mut state = self.state.lock().unwrap();
        state.body_fetches.push((folder.clone(), uid));
        state
            .bodies
            .get(&(folder, uid))
            .cloned()
            .ok_or_else(|| anyhow!("no body for uid {uid}"))
    }

    fn idle_wait(&mut self, timeout: Duration) -> Result<IdleOutcome> {
        let scripted = self.state.lock().unwrap().idle_script.pop_front();
        match scripted {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => Err(anyhow!(message)),
            None => {
                std::thread::sleep(timeout.min(Duration::from_millis(10)));
                Ok(IdleOutcome::TimedOut)
            }
        }
    }

    fn append(
        &mut self,
        folder: &str,
        body: &[u8],
        _seen: bool,
        _date: DateTime<FixedOffset>,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .appends
            .push((folder.to_string(), body.to_vec()));
        Ok(())
    }

    fn logout(&mut self) {
        self.state.lock().unwrap().logouts += 1;
    }
}

pub fn meta(uid: u32, message_id: &str, subject: &str) -> MessageMeta {
    MessageMeta {
        uid,
        message_id: message_id.to_string(),
        in_reply_to: None,
        subject: subject.to_string(),
        date: format!("Mon, 2 Jun 2025 10:00:{:02} +0000", uid % 60),
        from_address: Some("alice@example.com".to_string()),
        from_name: Some("Alice".to_string()),
        to_addresses: vec!["me@example.com".to_string()],
        cc_addresses: Vec::new(),
        bcc_addresses: Vec::new(),
        is_read: false,
        is_starred: false,
        is_draft: false,
    }
}

pub async fn memory_store() -> SqliteMailStore {
    let store = SqliteMailStore::connect_in_memory().await.unwrap();
    store.init().await.unwrap();
    store
}

pub async fn seeded_account(store: &SqliteMailStore) -> i64 {
    store
        .insert_account(&Account {
            id: 0,
            name: "personal".to_string(),
            display_name: "Personal".to_string(),
            email: "me@example.com".to_string(),
            imap_server: "imap.example.com".to_string(),
            imap_port: 993,
            imap_username: "me@example.com".to_string(),
            imap_auth_method: "password".to_string(),
            smtp_server: "smtp.example.com".to_string(),
            smtp_port: 465,
            smtp_username: "me@example.com".to_string(),
            smtp_auth_method: "password".to_string(),
            refresh_interval_minutes: 5,
            signature: None,
            is_default: true,
        })
        .await
        .unwrap()
}
