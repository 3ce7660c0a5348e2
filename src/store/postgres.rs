use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::error::{BridgeError, BridgeResult};
use crate::store::{Chat, MediaDescriptor, MessageRow, UpsertMessage};

/// External relational driver for C1, backed by Postgres via `sqlx`.
#[derive(Clone)]
pub struct PostgresMessageStore {
    pool: PgPool,
}

impl PostgresMessageStore {
    pub async fn connect(dsn: &str) -> BridgeResult<Self> {
        let pool = PgPool::connect(dsn)
            .await
            .map_err(|err| BridgeError::SessionUnavailable(err.to_string()))?;
        Ok(Self { pool })
    }

    /// Validates that the required tables exist; fails fast with
    /// `SchemaMissing` rather than creating them, per §4.1's contract for
    /// the external driver.
    pub async fn init(&self) -> BridgeResult<()> {
        for table in ["chats", "messages"] {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
            )
            .bind(table)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| BridgeError::SessionUnavailable(err.to_string()))?;
            if !exists {
                return Err(BridgeError::SchemaMissing(format!("table `{table}` missing")));
            }
        }
        Ok(())
    }

    pub async fn upsert_chat(
        &self,
        jid: &str,
        name: &str,
        last_message_time: DateTime<Utc>,
    ) -> BridgeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chats (jid, name, last_message_time) VALUES ($1, $2, $3)
            ON CONFLICT (jid) DO UPDATE SET
                name = CASE WHEN excluded.name <> '' AND excluded.last_message_time >= chats.last_message_time
                            THEN excluded.name ELSE chats.name END,
                last_message_time = GREATEST(chats.last_message_time, excluded.last_message_time)
            "#,
        )
        .bind(jid)
        .bind(name)
        .bind(last_message_time)
        .execute(&self.pool)
        .await
        .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
        Ok(())
    }

    pub async fn upsert_message(&self, message: UpsertMessage) -> BridgeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (
                id, chat_jid, sender, content, timestamp, from_me,
                media_type, filename, url, media_key, file_sha256, file_enc_sha256, file_length
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id, chat_jid) DO UPDATE SET
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
        )
        .bind(message.id)
        .bind(message.chat_jid)
        .bind(message.sender)
        .bind(message.content)
        .bind(message.timestamp)
        .bind(message.from_me)
        .bind(message.media_type.unwrap_or_default())
        .bind(message.filename.unwrap_or_default())
        .bind(message.url.unwrap_or_default())
        .bind(message.media_key)
        .bind(message.file_sha256)
        .bind(message.file_enc_sha256)
        .bind(message.file_length.map(|v| v as i64))
        .execute(&self.pool)
        .await
        .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
        Ok(())
    }

    pub async fn get_chats(&self) -> BridgeResult<Vec<Chat>> {
        let rows = sqlx::query("SELECT jid, name, last_message_time FROM chats ORDER BY last_message_time DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|row| Chat {
                jid: row.get(0),
                name: row.get(1),
                last_message_time: row.get(2),
            })
            .collect())
    }

    pub async fn get_messages(&self, chat_jid: &str, limit: usize) -> BridgeResult<Vec<MessageRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, chat_jid, sender, content, timestamp, from_me,
                   media_type, filename, url, media_key, file_sha256, file_enc_sha256, file_length
            FROM messages WHERE chat_jid = $1 ORDER BY timestamp DESC, id DESC LIMIT $2
            "#,
        )
        .bind(chat_jid)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
        Ok(rows.into_iter().map(row_to_message).collect())
    }

    pub async fn get_media_info(
        &self,
        message_id: &str,
        chat_jid: &str,
    ) -> BridgeResult<MediaDescriptor> {
        let row = sqlx::query(
            r#"
            SELECT media_type, filename, url, media_key, file_sha256, file_enc_sha256, file_length
            FROM messages WHERE id = $1 AND chat_jid = $2
            "#,
        )
        .bind(message_id)
        .bind(chat_jid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| BridgeError::IOFailed(err.to_string()))?
        .ok_or(BridgeError::NotFound)?;
        Ok(MediaDescriptor {
            media_type: row.get(0),
            filename: row.get(1),
            url: row.get(2),
            media_key: row.try_get::<Option<Vec<u8>>, _>(3).ok().flatten().unwrap_or_default(),
            file_sha256: row.try_get::<Option<Vec<u8>>, _>(4).ok().flatten().unwrap_or_default(),
            file_enc_sha256: row.try_get::<Option<Vec<u8>>, _>(5).ok().flatten().unwrap_or_default(),
            file_length: row.try_get::<Option<i64>, _>(6).ok().flatten().unwrap_or(0) as u64,
        })
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
        let result = sqlx::query(
            r#"
            UPDATE messages SET url = $1, media_key = $2, file_sha256 = $3,
                   file_enc_sha256 = $4, file_length = $5
            WHERE id = $6 AND chat_jid = $7
            "#,
        )
        .bind(url)
        .bind(media_key)
        .bind(file_sha256)
        .bind(file_enc_sha256)
        .bind(file_length as i64)
        .bind(message_id)
        .bind(chat_jid)
        .execute(&self.pool)
        .await
        .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(BridgeError::NotFound);
        }
        Ok(())
    }

    pub async fn count_messages(&self) -> BridgeResult<u64> {
        self.count_table("messages").await
    }

    pub async fn count_chats(&self) -> BridgeResult<u64> {
        self.count_table("chats").await
    }

    async fn count_table(&self, table: &'static str) -> BridgeResult<u64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
        Ok(count as u64)
    }

    pub async fn size_bytes(&self) -> BridgeResult<u64> {
        let size: i64 = sqlx::query_scalar("SELECT pg_database_size(current_database())")
            .fetch_one(&self.pool)
            .await
            .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
        Ok(size as u64)
    }
}

fn row_to_message(row: sqlx::postgres::PgRow) -> MessageRow {
    let media_type: String = row.get(6);
    let media = if media_type.is_empty() {
        None
    } else {
        Some(MediaDescriptor {
            media_type,
            filename: row.get(7),
            url: row.get(8),
            media_key: row.try_get::<Option<Vec<u8>>, _>(9).ok().flatten().unwrap_or_default(),
            file_sha256: row.try_get::<Option<Vec<u8>>, _>(10).ok().flatten().unwrap_or_default(),
            file_enc_sha256: row.try_get::<Option<Vec<u8>>, _>(11).ok().flatten().unwrap_or_default(),
            file_length: row.try_get::<Option<i64>, _>(12).ok().flatten().unwrap_or(0) as u64,
        })
    };
    MessageRow {
        id: row.get(0),
        chat_jid: row.get(1),
        sender: row.get(2),
        content: row.get(3),
        timestamp: row.get(4),
        from_me: row.get(5),
        media,
    }
}
