pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{BridgeError, BridgeResult};

/// A chat/conversation row, identified by its WhatsApp JID.
#[derive(Debug, Clone, PartialEq)]
pub struct Chat {
    pub jid: String,
    pub name: String,
    pub last_message_time: DateTime<Utc>,
}

/// A single message row, keyed on `(id, chat_jid)`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageRow {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub from_me: bool,
    pub media: Option<MediaDescriptor>,
}

/// Attributes needed to re-request previously referenced media by reference.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaDescriptor {
    pub media_type: String,
    pub filename: String,
    pub url: String,
    pub media_key: Vec<u8>,
    pub file_sha256: Vec<u8>,
    pub file_enc_sha256: Vec<u8>,
    pub file_length: u64,
}

impl MediaDescriptor {
    pub fn is_present(&self) -> bool {
        !self.media_type.is_empty()
    }
}

/// Fields accepted by an upsert; `None` means "leave existing value alone"
/// for media fields (a later event may supply richer metadata than an
/// earlier one for the same id), matching §4.1's overwrite-non-null rule.
#[derive(Debug, Clone, Default)]
pub struct UpsertMessage {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub from_me: bool,
    pub media_type: Option<String>,
    pub filename: Option<String>,
    pub url: Option<String>,
    pub media_key: Option<Vec<u8>>,
    pub file_sha256: Option<Vec<u8>>,
    pub file_enc_sha256: Option<Vec<u8>>,
    pub file_length: Option<u64>,
}

/// Driver-abstracted store for chats, messages, and media metadata (C1).
///
/// Both drivers (embedded file store, external relational store) must give
/// callers identical observable behavior; see §4.1 for the contract.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn init(&self) -> BridgeResult<()>;

    async fn upsert_chat(
        &self,
        jid: &str,
        name: &str,
        last_message_time: DateTime<Utc>,
    ) -> BridgeResult<()>;

    async fn upsert_message(&self, message: UpsertMessage) -> BridgeResult<()>;

    async fn get_chats(&self) -> BridgeResult<Vec<Chat>>;

    async fn get_messages(&self, chat_jid: &str, limit: usize) -> BridgeResult<Vec<MessageRow>>;

    async fn get_media_info(
        &self,
        message_id: &str,
        chat_jid: &str,
    ) -> BridgeResult<MediaDescriptor>;

    async fn get_media_type_and_filename(
        &self,
        message_id: &str,
        chat_jid: &str,
    ) -> BridgeResult<(String, String)>;

    async fn update_media_info(
        &self,
        message_id: &str,
        chat_jid: &str,
        url: &str,
        media_key: &[u8],
        file_sha256: &[u8],
        file_enc_sha256: &[u8],
        file_length: u64,
    ) -> BridgeResult<()>;

    async fn count_messages(&self) -> BridgeResult<u64>;
    async fn count_chats(&self) -> BridgeResult<u64>;
    async fn size_bytes(&self) -> BridgeResult<u64>;
}

/// Tagged dispatch over the two drivers, per the design note in §9: a trait
/// object would work equally well, but the concrete set is closed and small
/// enough that a variant-dispatched enum reads more plainly at call sites.
pub enum MessageBackend {
    Embedded(sqlite::SqliteMessageStore),
    External(postgres::PostgresMessageStore),
}

impl MessageBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBackend::Embedded(_) => "embedded",
            MessageBackend::External(_) => "external",
        }
    }
}

#[async_trait]
impl MessageStore for MessageBackend {
    async fn init(&self) -> BridgeResult<()> {
        match self {
            MessageBackend::Embedded(store) => store.init().await,
            MessageBackend::External(store) => store.init().await,
        }
    }

    async fn upsert_chat(
        &self,
        jid: &str,
        name: &str,
        last_message_time: DateTime<Utc>,
    ) -> BridgeResult<()> {
        match self {
            MessageBackend::Embedded(store) => store.upsert_chat(jid, name, last_message_time).await,
            MessageBackend::External(store) => store.upsert_chat(jid, name, last_message_time).await,
        }
    }

    async fn upsert_message(&self, message: UpsertMessage) -> BridgeResult<()> {
        match self {
            MessageBackend::Embedded(store) => store.upsert_message(message).await,
            MessageBackend::External(store) => store.upsert_message(message).await,
        }
    }

    async fn get_chats(&self) -> BridgeResult<Vec<Chat>> {
        match self {
            MessageBackend::Embedded(store) => store.get_chats().await,
            MessageBackend::External(store) => store.get_chats().await,
        }
    }

    async fn get_messages(&self, chat_jid: &str, limit: usize) -> BridgeResult<Vec<MessageRow>> {
        match self {
            MessageBackend::Embedded(store) => store.get_messages(chat_jid, limit).await,
            MessageBackend::External(store) => store.get_messages(chat_jid, limit).await,
        }
    }

    async fn get_media_info(
        &self,
        message_id: &str,
        chat_jid: &str,
    ) -> BridgeResult<MediaDescriptor> {
        match self {
            MessageBackend::Embedded(store) => store.get_media_info(message_id, chat_jid).await,
            MessageBackend::External(store) => store.get_media_info(message_id, chat_jid).await,
        }
    }

    async fn get_media_type_and_filename(
        &self,
        message_id: &str,
        chat_jid: &str,
    ) -> BridgeResult<(String, String)> {
        match self {
            MessageBackend::Embedded(store) => {
                store.get_media_type_and_filename(message_id, chat_jid).await
            }
            MessageBackend::External(store) => {
                store.get_media_type_and_filename(message_id, chat_jid).await
            }
        }
    }

    async fn update_media_info(
        &self,
        message_id: &str,
        chat_jid: &str,
        url: &str,
        media_key: &[u8],
        file_sha256: &[u8],
        file_enc_sha256: &[u8],
        file_length: u64,
    ) -> BridgeResult<()> {
        match self {
            MessageBackend::Embedded(store) => {
                store
                    .update_media_info(
                        message_id,
                        chat_jid,
                        url,
                        media_key,
                        file_sha256,
                        file_enc_sha256,
                        file_length,
                    )
                    .await
            }
            MessageBackend::External(store) => {
                store
                    .update_media_info(
                        message_id,
                        chat_jid,
                        url,
                        media_key,
                        file_sha256,
                        file_enc_sha256,
                        file_length,
                    )
                    .await
            }
        }
    }

    async fn count_messages(&self) -> BridgeResult<u64> {
        match self {
            MessageBackend::Embedded(store) => store.count_messages().await,
            MessageBackend::External(store) => store.count_messages().await,
        }
    }

    async fn count_chats(&self) -> BridgeResult<u64> {
        match self {
            MessageBackend::Embedded(store) => store.count_chats().await,
            MessageBackend::External(store) => store.count_chats().await,
        }
    }

    async fn size_bytes(&self) -> BridgeResult<u64> {
        match self {
            MessageBackend::Embedded(store) => store.size_bytes().await,
            MessageBackend::External(store) => store.size_bytes().await,
        }
    }
}
