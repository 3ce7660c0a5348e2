use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OpenFlags, params};

use crate::error::{BridgeError, BridgeResult};
use crate::store::{Chat, MediaDescriptor, MessageRow, UpsertMessage};

/// Embedded file-backed driver for C1. Each call opens a fresh connection
/// with `SQLITE_OPEN_FULL_MUTEX` rather than holding one open across
/// `await` points, mirroring the upstream agent's `session::db::SqliteStore`.
#[derive(Debug, Clone)]
pub struct SqliteMessageStore {
    path: Arc<String>,
}

impl SqliteMessageStore {
    pub fn new(path: String) -> Self {
        Self {
            path: Arc::new(path),
        }
    }

    fn ensure_parent_dir(&self) -> BridgeResult<()> {
        if let Some(parent) = std::path::Path::new(self.path.as_str()).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
        }
        Ok(())
    }

    fn open(&self) -> BridgeResult<Connection> {
        self.ensure_parent_dir()?;
        Connection::open_with_flags(
            self.path.as_str(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .map_err(|err| BridgeError::IOFailed(err.to_string()))
    }

    fn migrate(&self, conn: &Connection) -> BridgeResult<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS chats (
                jid TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                last_message_time TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT NOT NULL,
                chat_jid TEXT NOT NULL REFERENCES chats(jid),
                sender TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL DEFAULT '',
                timestamp TEXT NOT NULL,
                from_me INTEGER NOT NULL DEFAULT 0,
                media_type TEXT NOT NULL DEFAULT '',
                filename TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL DEFAULT '',
                media_key BLOB,
                file_sha256 BLOB,
                file_enc_sha256 BLOB,
                file_length INTEGER,
                PRIMARY KEY (id, chat_jid)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat_jid ON messages(chat_jid);
            "#,
        )
        .map_err(|err| BridgeError::IOFailed(err.to_string()))
    }

    fn with_connection<F, T>(&self, f: F) -> BridgeResult<T>
    where
        F: FnOnce(&Connection) -> BridgeResult<T>,
    {
        let conn = self.open()?;
        self.migrate(&conn)?;
        f(&conn)
    }

    pub async fn init(&self) -> BridgeResult<()> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.with_connection(|_| Ok(())))
            .await
            .map_err(|err| BridgeError::IOFailed(err.to_string()))?
    }

    pub async fn upsert_chat(
        &self,
        jid: &str,
        name: &str,
        last_message_time: DateTime<Utc>,
    ) -> BridgeResult<()> {
        let this = self.clone();
        let jid = jid.to_string();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || {
            this.with_connection(|conn| {
                conn.execute(
                    r#"
                    INSERT INTO chats (jid, name, last_message_time) VALUES (?1, ?2, ?3)
                    ON CONFLICT(jid) DO UPDATE SET
                        name = CASE WHEN excluded.name <> '' AND excluded.last_message_time >= chats.last_message_time
                                    THEN excluded.name ELSE chats.name END,
                        last_message_time = CASE WHEN excluded.last_message_time >= chats.last_message_time
                                    THEN excluded.last_message_time ELSE chats.last_message_time END
                    "#,
                    params![jid, name, last_message_time.to_rfc3339()],
                )
                .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
                Ok(())
            })
        })
        .await
        .map_err(|err| BridgeError::IOFailed(err.to_string()))?
    }

    pub async fn upsert_message(&self, message: UpsertMessage) -> BridgeResult<()> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            this.with_connection(|conn| {
                conn.execute(
                    r#"
                    INSERT INTO messages (
                        id, chat_jid, sender, content, timestamp, from_me,
                        media_type, filename, url, media_key, file_sha256, file_enc_sha256, file_length
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                    ON CONFLICT(id, chat_jid) DO UPDATE SET
                        sender = excluded.sender,
                        content = excluded.content,
                        timestamp = excluded.timestamp,
                        from_me = excluded.from_me,
                        media_type = COALESCE(NULLIF(excluded.media_type, ''), messages.media_type),
                        filename = COALESCE(NULLIF(excluded.filename, ''), messages.filename),
                        url = COALESCE(NULLIF(excluded.url, ''), messages.url),
                        media_key = COALESCE(excluded.media_key, messages.media_key),
                        file_sha256 = COALESCE(excluded.file_sha256, messages.file_sha256),
                        file_enc_sha256 = COALESCE(excluded.file_enc_sha256, messages.file_enc_sha256),
                        file_length = COALESCE(excluded.file_length, messages.file_length)
                    "#,
                    params![
                        message.id,
                        message.chat_jid,
                        message.sender,
                        message.content,
                        message.timestamp.to_rfc3339(),
                        message.from_me as i64,
                        message.media_type.unwrap_or_default(),
                        message.filename.unwrap_or_default(),
                        message.url.unwrap_or_default(),
                        message.media_key,
                        message.file_sha256,
                        message.file_enc_sha256,
                        message.file_length.map(|v| v as i64),
                    ],
                )
                .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
                Ok(())
            })
        })
        .await
        .map_err(|err| BridgeError::IOFailed(err.to_string()))?
    }

    pub async fn get_chats(&self) -> BridgeResult<Vec<Chat>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            this.with_connection(|conn| {
                let mut stmt = conn
                    .prepare("SELECT jid, name, last_message_time FROM chats ORDER BY last_message_time DESC")
                    .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
                let rows = stmt
                    .query_map([], |row| {
                        let ts: String = row.get(2)?;
                        Ok(Chat {
                            jid: row.get(0)?,
                            name: row.get(1)?,
                            last_message_time: parse_ts(&ts),
                        })
                    })
                    .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(|err| BridgeError::IOFailed(err.to_string()))?);
                }
                Ok(out)
            })
        })
        .await
        .map_err(|err| BridgeError::IOFailed(err.to_string()))?
    }

    pub async fn get_messages(&self, chat_jid: &str, limit: usize) -> BridgeResult<Vec<MessageRow>> {
        let this = self.clone();
        let chat_jid = chat_jid.to_string();
        tokio::task::spawn_blocking(move || {
            this.with_connection(|conn| {
                let mut stmt = conn
                    .prepare(
                        r#"
                        SELECT id, chat_jid, sender, content, timestamp, from_me,
                               media_type, filename, url, media_key, file_sha256, file_enc_sha256, file_length
                        FROM messages WHERE chat_jid = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2
                        "#,
                    )
                    .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
                let rows = stmt
                    .query_map(params![chat_jid, limit as i64], row_to_message)
                    .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(|err| BridgeError::IOFailed(err.to_string()))?);
                }
                Ok(out)
            })
        })
        .await
        .map_err(|err| BridgeError::IOFailed(err.to_string()))?
    }

    pub async fn get_media_info(
        &self,
        message_id: &str,
        chat_jid: &str,
    ) -> BridgeResult<MediaDescriptor> {
        let this = self.clone();
        let message_id = message_id.to_string();
        let chat_jid = chat_jid.to_string();
        tokio::task::spawn_blocking(move || {
            this.with_connection(|conn| {
                conn.query_row(
                    r#"
                    SELECT media_type, filename, url, media_key, file_sha256, file_enc_sha256, file_length
                    FROM messages WHERE id = ?1 AND chat_jid = ?2
                    "#,
                    params![message_id, chat_jid],
                    |row| {
                        Ok(MediaDescriptor {
                            media_type: row.get(0)?,
                            filename: row.get(1)?,
                            url: row.get(2)?,
                            media_key: row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
                            file_sha256: row.get::<_, Option<Vec<u8>>>(4)?.unwrap_or_default(),
                            file_enc_sha256: row.get::<_, Option<Vec<u8>>>(5)?.unwrap_or_default(),
                            file_length: row.get::<_, Option<i64>>(6)?.unwrap_or(0) as u64,
                        })
                    },
                )
                .map_err(|err| match err {
                    rusqlite::Error::QueryReturnedNoRows => BridgeError::NotFound,
                    other => BridgeError::IOFailed(other.to_string()),
                })
            })
        })
        .await
        .map_err(|err| BridgeError::IOFailed(err.to_string()))?
    }

    pub async fn get_media_type_and_filename(
        &self,
        message_id: &str,
        chat_jid: &str,
    ) -> BridgeResult<(String, String)> {
        let descriptor = self.get_media_info(message_id, chat_jid).await?;
        Ok((descriptor.media_type, descriptor.filename))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_media_info(
        &self,
        message_id: &str,
        chat_jid: &str,
        url: &str,
        media_key: &[u8],
        file_sha256: &[u8],
        file_enc_sha256: &[u8],
        file_length: u64,
    ) -> BridgeResult<()> {
        let this = self.clone();
        let message_id = message_id.to_string();
        let chat_jid = chat_jid.to_string();
        let url = url.to_string();
        let media_key = media_key.to_vec();
        let file_sha256 = file_sha256.to_vec();
        let file_enc_sha256 = file_enc_sha256.to_vec();
        tokio::task::spawn_blocking(move || {
            this.with_connection(|conn| {
                let updated = conn
                    .execute(
                        r#"
                        UPDATE messages SET url = ?1, media_key = ?2, file_sha256 = ?3,
                               file_enc_sha256 = ?4, file_length = ?5
                        WHERE id = ?6 AND chat_jid = ?7
                        "#,
                        params![
                            url,
                            media_key,
                            file_sha256,
                            file_enc_sha256,
                            file_length as i64,
                            message_id,
                            chat_jid,
                        ],
                    )
                    .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
                if updated == 0 {
                    return Err(BridgeError::NotFound);
                }
                Ok(())
            })
        })
        .await
        .map_err(|err| BridgeError::IOFailed(err.to_string()))?
    }

    pub async fn count_messages(&self) -> BridgeResult<u64> {
        self.count_table("messages").await
    }

    pub async fn count_chats(&self) -> BridgeResult<u64> {
        self.count_table("chats").await
    }

    async fn count_table(&self, table: &'static str) -> BridgeResult<u64> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            this.with_connection(|conn| {
                let count: i64 = conn
                    .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                    .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
                Ok(count as u64)
            })
        })
        .await
        .map_err(|err| BridgeError::IOFailed(err.to_string()))?
    }

    pub async fn size_bytes(&self) -> BridgeResult<u64> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::metadata(path.as_str())
                .map(|meta| meta.len())
                .map_err(|err| BridgeError::IOFailed(err.to_string()))
        })
        .await
        .map_err(|err| BridgeError::IOFailed(err.to_string()))?
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    let ts: String = row.get(4)?;
    let media_type: String = row.get(6)?;
    let media = if media_type.is_empty() {
        None
    } else {
        Some(MediaDescriptor {
            media_type,
            filename: row.get(7)?,
            url: row.get(8)?,
            media_key: row.get::<_, Option<Vec<u8>>>(9)?.unwrap_or_default(),
            file_sha256: row.get::<_, Option<Vec<u8>>>(10)?.unwrap_or_default(),
            file_enc_sha256: row.get::<_, Option<Vec<u8>>>(11)?.unwrap_or_default(),
            file_length: row.get::<_, Option<i64>>(12)?.unwrap_or(0) as u64,
        })
    };
    Ok(MessageRow {
        id: row.get(0)?,
        chat_jid: row.get(1)?,
        sender: row.get(2)?,
        content: row.get(3)?,
        timestamp: parse_ts(&ts),
        from_me: row.get::<_, i64>(5)? != 0,
        media,
    })
}

fn parse_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).single().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn temp_store() -> SqliteMessageStore {
        let dir = std::env::temp_dir().join(format!("wa-bridge-test-{}", uuid::Uuid::new_v4()));
        SqliteMessageStore::new(dir.join("messages.db").to_string_lossy().to_string())
    }

    #[tokio::test]
    async fn upsert_chat_is_idempotent() {
        let store = temp_store();
        store.init().await.unwrap();
        let now = Utc::now();
        store.upsert_chat("1@s.whatsapp.net", "Alice", now).await.unwrap();
        store.upsert_chat("1@s.whatsapp.net", "Alice", now).await.unwrap();
        let chats = store.get_chats().await.unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].name, "Alice");
    }

    #[tokio::test]
    async fn upsert_chat_keeps_newer_timestamp() {
        let store = temp_store();
        store.init().await.unwrap();
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::seconds(10);
        store.upsert_chat("1@s.whatsapp.net", "Later", later).await.unwrap();
        store.upsert_chat("1@s.whatsapp.net", "Earlier", earlier).await.unwrap();
        let chats = store.get_chats().await.unwrap();
        assert_eq!(chats[0].name, "Later");
    }

    #[tokio::test]
    async fn upsert_message_preserves_richer_media_on_later_sparse_event() {
        let store = temp_store();
        store.init().await.unwrap();
        let now = Utc::now();
        store.upsert_chat("1@s.whatsapp.net", "Alice", now).await.unwrap();
        store
            .upsert_message(UpsertMessage {
                id: "m1".into(),
                chat_jid: "1@s.whatsapp.net".into(),
                sender: "1@s.whatsapp.net".into(),
                content: "hi".into(),
                timestamp: now,
                from_me: false,
                media_type: Some("image".into()),
                filename: Some("pic.jpg".into()),
                url: Some("https://cdn/x".into()),
                media_key: Some(vec![1, 2, 3]),
                file_sha256: Some(vec![4, 5, 6]),
                file_enc_sha256: Some(vec![7, 8, 9]),
                file_length: Some(42),
            })
            .await
            .unwrap();
        store
            .upsert_message(UpsertMessage {
                id: "m1".into(),
                chat_jid: "1@s.whatsapp.net".into(),
                sender: "1@s.whatsapp.net".into(),
                content: "hi".into(),
                timestamp: now,
                from_me: false,
                media_type: None,
                filename: None,
                url: None,
                media_key: None,
                file_sha256: None,
                file_enc_sha256: None,
                file_length: None,
            })
            .await
            .unwrap();
        let descriptor = store.get_media_info("m1", "1@s.whatsapp.net").await.unwrap();
        assert_eq!(descriptor.media_type, "image");
        assert_eq!(descriptor.file_length, 42);
    }

    #[tokio::test]
    async fn media_info_not_found() {
        let store = temp_store();
        store.init().await.unwrap();
        let err = store.get_media_info("missing", "1@s.whatsapp.net").await.unwrap_err();
        assert!(matches!(err, BridgeError::NotFound));
    }
}
