use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, mpsc};
use wacore::proto_helpers::MessageExt;
use wacore::types::events::Event;
use waproto::whatsapp as wa;

use crate::qr::QrState;
use crate::store::{MediaDescriptor, MessageStore, UpsertMessage};

/// Depth of the persistence work queue between the library's delivery thread
/// and the store writer (§4.5). Saturation blocks rather than drops.
const QUEUE_DEPTH: usize = 1024;
/// Escalates to a client reconnect after this many consecutive persistence
/// failures inside the trailing window below.
const FAILURE_ESCALATION_THRESHOLD: u32 = 5;
const FAILURE_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug)]
enum PersistJob {
    UpsertChat {
        jid: String,
        name: String,
        last_message_time: DateTime<Utc>,
    },
    UpsertMessage(UpsertMessage),
}

/// Routes library events into the bounded persistence queue and tracks the
/// per-event error count exposed via `BridgeHealth` (§3, §4.5).
pub struct EventRouter {
    tx: mpsc::Sender<PersistJob>,
    error_count: Arc<AtomicU64>,
    reconnect_requested: Arc<Notify>,
}

impl EventRouter {
    /// Spawns the single persistence worker and returns the router plus a
    /// handle the caller can await on `reconnect_requested()` to learn when
    /// the failure budget has been exhausted (C4 drives the actual reconnect).
    pub fn spawn(store: Arc<dyn MessageStore>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let error_count = Arc::new(AtomicU64::new(0));
        let reconnect_requested = Arc::new(Notify::new());
        tokio::spawn(run_worker(
            store,
            rx,
            Arc::clone(&error_count),
            Arc::clone(&reconnect_requested),
        ));
        Self {
            tx,
            error_count,
            reconnect_requested,
        }
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn reconnect_requested(&self) -> Arc<Notify> {
        Arc::clone(&self.reconnect_requested)
    }

    /// Handles one library event. Cheap extraction happens inline; the
    /// resulting store writes are pushed to the bounded queue (blocking on
    /// saturation, never dropping).
    pub async fn handle(&self, event: Event, qr: &QrState) {
        match event {
            Event::PairingQrCode { code, .. } => {
                println!("{}", QrState::render_terminal(&code));
                qr.set(code);
            }
            Event::Connected(_) => {
                qr.clear();
                tracing::info!("whatsapp client connected");
            }
            Event::LoggedOut(_) => {
                tracing::warn!("whatsapp client logged out");
            }
            Event::Message(message, info) => {
                let chat_jid = info.source.chat.to_string();
                let sender = info.source.sender.to_string();
                let from_me = info.source.is_from_me;
                let timestamp = info.timestamp;
                let content = extract_text(&message);
                let media = extract_media(&message);

                // Pass no name here: `upsert_chat`'s merge keeps whatever
                // display name is already on file and only ever fills it in
                // from a source that actually carries one (rename events,
                // contact sync). The bare JID is never a display name.
                let _ = self
                    .tx
                    .send(PersistJob::UpsertChat {
                        jid: chat_jid.clone(),
                        name: String::new(),
                        last_message_time: timestamp,
                    })
                    .await;
                let _ = self
                    .tx
                    .send(PersistJob::UpsertMessage(UpsertMessage {
                        id: info.id.to_string(),
                        chat_jid,
                        sender,
                        content,
                        timestamp,
                        from_me,
                        media_type: media.as_ref().map(|m| m.media_type.clone()),
                        filename: media.as_ref().map(|m| m.filename.clone()),
                        url: media.as_ref().map(|m| m.url.clone()),
                        media_key: media.as_ref().map(|m| m.media_key.clone()),
                        file_sha256: media.as_ref().map(|m| m.file_sha256.clone()),
                        file_enc_sha256: media.as_ref().map(|m| m.file_enc_sha256.clone()),
                        file_length: media.as_ref().map(|m| m.file_length),
                    }))
                    .await;
            }
            // The fork this bridge builds against exposes history-sync
            // progress as an opaque notification rather than a destructurable
            // payload of synced conversations/messages. Those same messages
            // also replay through `Event::Message` during initial backfill,
            // so the per-message extraction pipeline above still populates
            // the store; this arm only logs that a sync occurred.
            Event::HistorySync(_) => {
                tracing::info!("history sync event received");
            }
            // Chat rename (§4.5) has no dedicated arm: every consumer of this
            // fork's `Event` enum we have to go on (this bot's own history-sync
            // handling above, plus every other project vendoring the same
            // library) only ever matches PairingQrCode, PairSuccess, Connected,
            // Disconnected, LoggedOut, Message, and HistorySync — none expose a
            // contact/chat-metadata rename notification. If a future version of
            // the library adds one, route it to `store.upsert_chat(jid, name,
            // existing_last_message_time)` here.
            other => {
                tracing::debug!(event = ?other, "unhandled whatsapp event");
            }
        }
    }
}

/// First non-empty of: plain conversation text, extended text block,
/// image/video/document caption (§4.5).
fn extract_text(message: &wa::Message) -> String {
    if let Some(text) = message.text_content() {
        if !text.is_empty() {
            return text.to_string();
        }
    }
    let base = message.get_base_message();
    if let Some(extended) = base.extended_text_message.as_deref() {
        if let Some(text) = &extended.text {
            if !text.is_empty() {
                return text.clone();
            }
        }
    }
    if let Some(image) = base.image_message.as_deref() {
        if let Some(caption) = &image.caption {
            if !caption.is_empty() {
                return caption.clone();
            }
        }
    }
    if let Some(video) = base.video_message.as_deref() {
        if let Some(caption) = &video.caption {
            if !caption.is_empty() {
                return caption.clone();
            }
        }
    }
    if let Some(document) = base.document_message.as_deref() {
        if let Some(caption) = &document.caption {
            if !caption.is_empty() {
                return caption.clone();
            }
        }
    }
    String::new()
}

/// Fixed priority image, video, audio, document, sticker; first match wins
/// (§4.5).
fn extract_media(message: &wa::Message) -> Option<MediaDescriptor> {
    let base = message.get_base_message();
    if let Some(msg) = base.image_message.as_deref() {
        return Some(descriptor(
            "image",
            String::new(),
            msg.url.clone(),
            msg.direct_path.clone(),
            msg.media_key.clone(),
            msg.file_sha256.clone(),
            msg.file_enc_sha256.clone(),
            msg.file_length,
        ));
    }
    if let Some(msg) = base.video_message.as_deref() {
        return Some(descriptor(
            "video",
            String::new(),
            msg.url.clone(),
            msg.direct_path.clone(),
            msg.media_key.clone(),
            msg.file_sha256.clone(),
            msg.file_enc_sha256.clone(),
            msg.file_length,
        ));
    }
    if let Some(msg) = base.audio_message.as_deref() {
        return Some(descriptor(
            "audio",
            String::new(),
            msg.url.clone(),
            msg.direct_path.clone(),
            msg.media_key.clone(),
            msg.file_sha256.clone(),
            msg.file_enc_sha256.clone(),
            msg.file_length,
        ));
    }
    if let Some(msg) = base.document_message.as_deref() {
        return Some(descriptor(
            "document",
            msg.file_name.clone().unwrap_or_default(),
            msg.url.clone(),
            msg.direct_path.clone(),
            msg.media_key.clone(),
            msg.file_sha256.clone(),
            msg.file_enc_sha256.clone(),
            msg.file_length,
        ));
    }
    if let Some(msg) = base.sticker_message.as_deref() {
        return Some(descriptor(
            "sticker",
            String::new(),
            msg.url.clone(),
            msg.direct_path.clone(),
            msg.media_key.clone(),
            msg.file_sha256.clone(),
            msg.file_enc_sha256.clone(),
            msg.file_length,
        ));
    }
    None
}

#[allow(clippy::too_many_arguments)]
fn descriptor(
    media_type: &str,
    filename: String,
    url: Option<String>,
    direct_path: Option<String>,
    media_key: Option<Vec<u8>>,
    file_sha256: Option<Vec<u8>>,
    file_enc_sha256: Option<Vec<u8>>,
    file_length: Option<u64>,
) -> MediaDescriptor {
    MediaDescriptor {
        media_type: media_type.to_string(),
        filename,
        url: url.or(direct_path).unwrap_or_default(),
        media_key: media_key.unwrap_or_default(),
        file_sha256: file_sha256.unwrap_or_default(),
        file_enc_sha256: file_enc_sha256.unwrap_or_default(),
        file_length: file_length.unwrap_or_default(),
    }
}

async fn run_worker(
    store: Arc<dyn MessageStore>,
    mut rx: mpsc::Receiver<PersistJob>,
    error_count: Arc<AtomicU64>,
    reconnect_requested: Arc<Notify>,
) {
    let failures: Mutex<VecDeque<Instant>> = Mutex::new(VecDeque::new());
    while let Some(job) = rx.recv().await {
        let result = match job {
            PersistJob::UpsertChat {
                jid,
                name,
                last_message_time,
            } => store.upsert_chat(&jid, &name, last_message_time).await,
            PersistJob::UpsertMessage(upsert) => store.upsert_message(upsert).await,
        };

        if let Err(err) = result {
            tracing::error!(error = %err, "event persistence failed");
            error_count.fetch_add(1, Ordering::Relaxed);

            let mut guard = failures.lock().await;
            let now = Instant::now();
            guard.push_back(now);
            while guard
                .front()
                .is_some_and(|oldest| now.duration_since(*oldest) > FAILURE_WINDOW)
            {
                guard.pop_front();
            }
            if guard.len() as u32 >= FAILURE_ESCALATION_THRESHOLD {
                guard.clear();
                drop(guard);
                tracing::error!("persistence failure budget exhausted, requesting reconnect");
                reconnect_requested.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_prefers_plain_conversation() {
        let message = wa::Message {
            conversation: Some("hello".to_string()),
            ..Default::default()
        };
        assert_eq!(extract_text(&message), "hello");
    }

    #[test]
    fn extract_text_falls_back_to_caption() {
        let message = wa::Message {
            image_message: Some(Box::new(wa::message::ImageMessage {
                caption: Some("a photo".to_string()),
                ..Default::default()
            })),
            ..Default::default()
        };
        assert_eq!(extract_text(&message), "a photo");
    }

    #[test]
    fn extract_text_empty_when_nothing_present() {
        let message = wa::Message::default();
        assert_eq!(extract_text(&message), "");
    }

    #[test]
    fn extract_media_prioritizes_image_over_document() {
        let message = wa::Message {
            image_message: Some(Box::new(wa::message::ImageMessage {
                url: Some("https://cdn/example.enc".to_string()),
                ..Default::default()
            })),
            document_message: Some(Box::new(wa::message::DocumentMessage {
                file_name: Some("report.pdf".to_string()),
                ..Default::default()
            })),
            ..Default::default()
        };
        let descriptor = extract_media(&message).unwrap();
        assert_eq!(descriptor.media_type, "image");
    }

    #[test]
    fn extract_media_keeps_document_filename() {
        let message = wa::Message {
            document_message: Some(Box::new(wa::message::DocumentMessage {
                file_name: Some("report.pdf".to_string()),
                url: Some("https://cdn/report.enc".to_string()),
                ..Default::default()
            })),
            ..Default::default()
        };
        let descriptor = extract_media(&message).unwrap();
        assert_eq!(descriptor.filename, "report.pdf");
    }

    #[test]
    fn extract_media_none_for_plain_text() {
        let message = wa::Message {
            conversation: Some("hi".to_string()),
            ..Default::default()
        };
        assert!(extract_media(&message).is_none());
    }
}
