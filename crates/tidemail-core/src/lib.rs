//! Data model and SQLite-backed store for the local mail mirror.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use mailparse::dateparse;
use serde::{Deserialize, Serialize};
use sqlx::{SqlitePool, sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub email: String,
    pub imap_server: String,
    pub imap_port: u16,
    pub imap_username: String,
    pub imap_auth_method: String,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_auth_method: String,
    pub refresh_interval_minutes: i64,
    pub signature: Option<String>,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Thread {
    pub id: i64,
    pub account_id: i64,
    pub subject: String,
    pub snippet: Option<String>,
    pub message_count: i64,
    pub latest_message_ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: i64,
    pub uid: u32,
    pub thread_id: i64,
    pub account_id: i64,
    pub folder_id: i64,
    pub message_id: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub to_addresses: String,
    pub cc_addresses: Option<String>,
    pub bcc_addresses: Option<String>,
    pub reference_ids: Option<String>,
    pub subject: String,
    pub body_text: Option<String>,
    pub date: String,
    pub date_ts: i64,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_draft: bool,
}

/// Headers-only message row, as produced by ingestion. The body and the
/// reference list arrive later through the backfill path.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub uid: u32,
    pub thread_id: i64,
    pub account_id: i64,
    pub folder_id: i64,
    pub message_id: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub to_addresses: String,
    pub cc_addresses: Option<String>,
    pub bcc_addresses: Option<String>,
    pub subject: String,
    pub date: String,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_draft: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingBody {
    pub id: i64,
    pub folder_id: i64,
    pub uid: u32,
}

pub fn parse_date_ts(date: &str) -> i64 {
    dateparse(date).unwrap_or(0)
}

/// Default on-disk location for the mirror database.
pub fn default_db_path() -> PathBuf {
    let base = std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("state"))
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    base.join("tidemail").join("mail.sqlite")
}

#[async_trait]
pub trait MailStore: Send + Sync {
    async fn get_account(&self, account_id: i64) -> Result<Option<Account>>;
    async fn default_account(&self) -> Result<Option<Account>>;
    async fn insert_account(&self, account: &Account) -> Result<i64>;
    async fn set_refresh_interval(&self, account_id: i64, minutes: i64) -> Result<()>;

    async fn folder_by_name(&self, account_id: i64, name: &str) -> Result<Option<Folder>>;
    async fn get_folder(&self, folder_id: i64) -> Result<Option<Folder>>;
    async fn ensure_folder(&self, account_id: i64, name: &str) -> Result<Folder>;
    async fn list_folders(&self, account_id: i64) -> Result<Vec<Folder>>;

    async fn highest_uid_in_folder(&self, folder_id: i64) -> Result<Option<u32>>;
    async fn message_by_message_id(&self, message_id: &str) -> Result<Option<Message>>;
    async fn message_by_folder_uid(&self, folder_id: i64, uid: u32) -> Result<Option<Message>>;
    async fn get_message(&self, id: i64) -> Result<Option<Message>>;
    async fn insert_message(&self, msg: &NewMessage) -> Result<i64>;
    async fn list_messages(&self, folder_id: i64) -> Result<Vec<Message>>;
    async fn messages_missing_body(
        &self,
        account_id: i64,
        folder_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<MissingBody>>;
    async fn update_message_content(
        &self,
        id: i64,
        body_text: Option<&str>,
        reference_ids: Option<&str>,
    ) -> Result<()>;

    async fn create_thread(&self, account_id: i64, subject: &str, date_ts: i64) -> Result<i64>;
    async fn update_thread(&self, thread_id: i64, subject: &str, date_ts: i64) -> Result<()>;
    async fn get_thread(&self, thread_id: i64) -> Result<Option<Thread>>;
    async fn list_threads(&self, account_id: i64) -> Result<Vec<Thread>>;
}

const ACCOUNT_COLUMNS: &str = "id, name, display_name, email, imap_server, imap_port, \
     imap_username, imap_auth_method, smtp_server, smtp_port, smtp_username, \
     smtp_auth_method, refresh_interval_minutes, signature, is_default";

const MESSAGE_COLUMNS: &str = "id, uid, thread_id, account_id, folder_id, message_id, \
     from_address, from_name, to_addresses, cc_addresses, bcc_addresses, reference_ids, \
     subject, body_text, date, date_ts, is_read, is_starred, is_draft";

const THREAD_COLUMNS: &str =
    "id, account_id, subject, snippet, message_count, latest_message_ts";

#[derive(Clone)]
pub struct SqliteMailStore {
    pool: SqlitePool,
}

impl SqliteMailStore {
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.trim_start_matches("sqlite:"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// One connection only, so the in-memory database is shared across all
    /// store calls.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl MailStore for SqliteMailStore {
    async fn get_account(&self, account_id: i64) -> Result<Option<Account>> {
        let query = format!("SELECT {} FROM accounts WHERE id = ?", ACCOUNT_COLUMNS);
        let row = sqlx::query_as::<_, Account>(&query)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn default_account(&self) -> Result<Option<Account>> {
        let query = format!(
            "SELECT {} FROM accounts ORDER BY is_default DESC, id LIMIT 1",
            ACCOUNT_COLUMNS
        );
        let row = sqlx::query_as::<_, Account>(&query)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn insert_account(&self, account: &Account) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO accounts (name, display_name, email, imap_server, imap_port, \
             imap_username, imap_auth_method, smtp_server, smtp_port, smtp_username, \
             smtp_auth_method, refresh_interval_minutes, signature, is_default)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&account.name)
        .bind(&account.display_name)
        .bind(&account.email)
        .bind(&account.imap_server)
        .bind(account.imap_port)
        .bind(&account.imap_username)
        .bind(&account.imap_auth_method)
        .bind(&account.smtp_server)
        .bind(account.smtp_port)
        .bind(&account.smtp_username)
        .bind(&account.smtp_auth_method)
        .bind(account.refresh_interval_minutes)
        .bind(&account.signature)
        .bind(account.is_default)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn set_refresh_interval(&self, account_id: i64, minutes: i64) -> Result<()> {
        sqlx::query("UPDATE accounts SET refresh_interval_minutes = ? WHERE id = ?")
            .bind(minutes)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn folder_by_name(&self, account_id: i64, name: &str) -> Result<Option<Folder>> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT id FROM folders WHERE account_id = ? AND name = ?",
        )
        .bind(account_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Folder {
            id: r.0,
            account_id,
            name: name.to_string(),
        }))
    }

    async fn get_folder(&self, folder_id: i64) -> Result<Option<Folder>> {
        let row = sqlx::query_as::<_, (i64, i64, String)>(
            "SELECT id, account_id, name FROM folders WHERE id = ?",
        )
        .bind(folder_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Folder {
            id: r.0,
            account_id: r.1,
            name: r.2,
        }))
    }

    async fn ensure_folder(&self, account_id: i64, name: &str) -> Result<Folder> {
        if let Some(folder) = self.folder_by_name(account_id, name).await? {
            return Ok(folder);
        }
        let result = sqlx::query("INSERT INTO folders (account_id, name) VALUES (?, ?)")
            .bind(account_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(Folder {
            id: result.last_insert_rowid(),
            account_id,
            name: name.to_string(),
        })
    }

    async fn list_folders(&self, account_id: i64) -> Result<Vec<Folder>> {
        let rows = sqlx::query_as::<_, (i64, i64, String)>(
            "SELECT id, account_id, name FROM folders WHERE account_id = ? ORDER BY id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| Folder {
                id: row.0,
                account_id: row.1,
                name: row.2,
            })
            .collect())
    }

    async fn highest_uid_in_folder(&self, folder_id: i64) -> Result<Option<u32>> {
        let row = sqlx::query_as::<_, (Option<i64>,)>(
            "SELECT MAX(uid) FROM messages WHERE folder_id = ?",
        )
        .bind(folder_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0.map(|uid| uid as u32))
    }

    async fn message_by_message_id(&self, message_id: &str) -> Result<Option<Message>> {
        let query = format!(
            "SELECT {} FROM messages WHERE message_id = ? LIMIT 1",
            MESSAGE_COLUMNS
        );
        let row = sqlx::query_as::<_, Message>(&query)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn message_by_folder_uid(&self, folder_id: i64, uid: u32) -> Result<Option<Message>> {
        let query = format!(
            "SELECT {} FROM messages WHERE folder_id = ? AND uid = ?",
            MESSAGE_COLUMNS
        );
        let row = sqlx::query_as::<_, Message>(&query)
            .bind(folder_id)
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_message(&self, id: i64) -> Result<Option<Message>> {
        let query = format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS);
        let row = sqlx::query_as::<_, Message>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn insert_message(&self, msg: &NewMessage) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO messages (uid, thread_id, account_id, folder_id, message_id, \
             from_address, from_name, to_addresses, cc_addresses, bcc_addresses, subject, \
             date, date_ts, is_read, is_starred, is_draft)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(msg.uid)
        .bind(msg.thread_id)
        .bind(msg.account_id)
        .bind(msg.folder_id)
        .bind(&msg.message_id)
        .bind(&msg.from_address)
        .bind(&msg.from_name)
        .bind(&msg.to_addresses)
        .bind(&msg.cc_addresses)
        .bind(&msg.bcc_addresses)
        .bind(&msg.subject)
        .bind(&msg.date)
        .bind(parse_date_ts(&msg.date))
        .bind(msg.is_read)
        .bind(msg.is_starred)
        .bind(msg.is_draft)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list_messages(&self, folder_id: i64) -> Result<Vec<Message>> {
        let query = format!(
            "SELECT {} FROM messages WHERE folder_id = ? ORDER BY uid",
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query_as::<_, Message>(&query)
            .bind(folder_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn messages_missing_body(
        &self,
        account_id: i64,
        folder_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<MissingBody>> {
        let mut query = String::from(
            "SELECT id, folder_id, uid FROM messages WHERE account_id = ? AND body_text IS NULL",
        );
        if folder_id.is_some() {
            query.push_str(" AND folder_id = ?");
        }
        query.push_str(" ORDER BY id LIMIT ?");

        let mut q = sqlx::query_as::<_, (i64, i64, i64)>(&query).bind(account_id);
        if let Some(folder_id) = folder_id {
            q = q.bind(folder_id);
        }
        let rows = q.bind(limit).fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| MissingBody {
                id: row.0,
                folder_id: row.1,
                uid: row.2 as u32,
            })
            .collect())
    }

    async fn update_message_content(
        &self,
        id: i64,
        body_text: Option<&str>,
        reference_ids: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE messages SET body_text = ?, reference_ids = ? WHERE id = ?")
            .bind(body_text)
            .bind(reference_ids)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_thread(&self, account_id: i64, subject: &str, date_ts: i64) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO threads (account_id, subject, message_count, latest_message_ts)
             VALUES (?, ?, 1, ?)",
        )
        .bind(account_id)
        .bind(subject)
        .bind(date_ts)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_thread(&self, thread_id: i64, subject: &str, date_ts: i64) -> Result<()> {
        sqlx::query("UPDATE threads SET subject = ?, latest_message_ts = ? WHERE id = ?")
            .bind(subject)
            .bind(date_ts)
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_thread(&self, thread_id: i64) -> Result<Option<Thread>> {
        let query = format!("SELECT {} FROM threads WHERE id = ?", THREAD_COLUMNS);
        let row = sqlx::query_as::<_, Thread>(&query)
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_threads(&self, account_id: i64) -> Result<Vec<Thread>> {
        let query = format!(
            "SELECT {} FROM threads WHERE account_id = ? ORDER BY latest_message_ts DESC, id DESC",
            THREAD_COLUMNS
        );
        let rows = sqlx::query_as::<_, Thread>(&query)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteMailStore {
        let store = SqliteMailStore::connect_in_memory().await.unwrap();
        store.init().await.unwrap();
        store
    }

    fn test_account() -> Account {
        Account {
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
        }
    }

    fn headers_only(account_id: i64, folder_id: i64, thread_id: i64, uid: u32) -> NewMessage {
        NewMessage {
            uid,
            thread_id,
            account_id,
            folder_id,
            message_id: format!("<{}@example.com>", uid),
            from_address: "alice@example.com".to_string(),
            from_name: Some("Alice".to_string()),
            to_addresses: "me@example.com".to_string(),
            cc_addresses: None,
            bcc_addresses: None,
            subject: format!("message {}", uid),
            date: "Mon, 2 Jun 2025 10:00:00 +0000".to_string(),
            is_read: false,
            is_starred: false,
            is_draft: false,
        }
    }

    #[tokio::test]
    async fn account_roundtrip_and_default() {
        let store = test_store().await;
        let id = store.insert_account(&test_account()).await.unwrap();
        let loaded = store.get_account(id).await.unwrap().unwrap();
        assert_eq!(loaded.email, "me@example.com");
        assert_eq!(loaded.imap_port, 993);
        let default = store.default_account().await.unwrap().unwrap();
        assert_eq!(default.id, id);

        store.set_refresh_interval(id, 15).await.unwrap();
        let loaded = store.get_account(id).await.unwrap().unwrap();
        assert_eq!(loaded.refresh_interval_minutes, 15);
    }

    #[tokio::test]
    async fn ensure_folder_is_idempotent() {
        let store = test_store().await;
        let account_id = store.insert_account(&test_account()).await.unwrap();
        let first = store.ensure_folder(account_id, "INBOX").await.unwrap();
        let second = store.ensure_folder(account_id, "INBOX").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.list_folders(account_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn highest_uid_tracks_max_stored_uid() {
        let store = test_store().await;
        let account_id = store.insert_account(&test_account()).await.unwrap();
        let folder = store.ensure_folder(account_id, "INBOX").await.unwrap();
        assert_eq!(store.highest_uid_in_folder(folder.id).await.unwrap(), None);

        let thread = store.create_thread(account_id, "hi", 0).await.unwrap();
        for uid in [10, 12, 11] {
            store
                .insert_message(&headers_only(account_id, folder.id, thread, uid))
                .await
                .unwrap();
        }
        assert_eq!(
            store.highest_uid_in_folder(folder.id).await.unwrap(),
            Some(12)
        );
    }

    #[tokio::test]
    async fn duplicate_folder_uid_is_rejected() {
        let store = test_store().await;
        let account_id = store.insert_account(&test_account()).await.unwrap();
        let folder = store.ensure_folder(account_id, "INBOX").await.unwrap();
        let thread = store.create_thread(account_id, "hi", 0).await.unwrap();
        store
            .insert_message(&headers_only(account_id, folder.id, thread, 7))
            .await
            .unwrap();
        let err = store
            .insert_message(&headers_only(account_id, folder.id, thread, 7))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn missing_body_query_excludes_filled_messages() {
        let store = test_store().await;
        let account_id = store.insert_account(&test_account()).await.unwrap();
        let folder = store.ensure_folder(account_id, "INBOX").await.unwrap();
        let thread = store.create_thread(account_id, "hi", 0).await.unwrap();
        let first = store
            .insert_message(&headers_only(account_id, folder.id, thread, 1))
            .await
            .unwrap();
        let second = store
            .insert_message(&headers_only(account_id, folder.id, thread, 2))
            .await
            .unwrap();

        store
            .update_message_content(first, Some("hello"), Some("<a@x>,<b@y>"))
            .await
            .unwrap();

        let missing = store
            .messages_missing_body(account_id, Some(folder.id), 50)
            .await
            .unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].id, second);

        let filled = store.get_message(first).await.unwrap().unwrap();
        assert_eq!(filled.body_text.as_deref(), Some("hello"));
        assert_eq!(filled.reference_ids.as_deref(), Some("<a@x>,<b@y>"));
    }

    #[tokio::test]
    async fn thread_update_rewrites_subject_and_timestamp() {
        let store = test_store().await;
        let account_id = store.insert_account(&test_account()).await.unwrap();
        let thread = store.create_thread(account_id, "hello", 100).await.unwrap();
        store
            .update_thread(thread, "Re: hello", 200)
            .await
            .unwrap();
        let loaded = store.get_thread(thread).await.unwrap().unwrap();
        assert_eq!(loaded.subject, "Re: hello");
        assert_eq!(loaded.latest_message_ts, 200);
        assert_eq!(loaded.message_count, 1);
    }

    #[tokio::test]
    async fn message_lookup_by_global_id() {
        let store = test_store().await;
        let account_id = store.insert_account(&test_account()).await.unwrap();
        let folder = store.ensure_folder(account_id, "INBOX").await.unwrap();
        let thread = store.create_thread(account_id, "hi", 0).await.unwrap();
        store
            .insert_message(&headers_only(account_id, folder.id, thread, 3))
            .await
            .unwrap();

        let found = store
            .message_by_message_id("<3@example.com>")
            .await
            .unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().thread_id, thread);
        assert!(
            store
                .message_by_message_id("<nope@example.com>")
                .await
                .unwrap()
                .is_none()
        );
    }
}
