use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;
use wacore::download::MediaType as UploadMediaType;
use wacore_binary::jid::Jid;
use waproto::whatsapp as wa;
use whatsapp_rust::Client;

use crate::error::{BridgeError, BridgeResult};
use crate::store::{MessageStore, UpsertMessage};

const DEFAULT_SERVER: &str = "s.whatsapp.net";
const SEND_DEADLINE: Duration = Duration::from_secs(30);
const FFMPEG_DEADLINE: Duration = Duration::from_secs(60);

const MAX_IMAGE_BYTES: u64 = 16 * 1024 * 1024;
const MAX_VIDEO_BYTES: u64 = 16 * 1024 * 1024;
const MAX_AUDIO_BYTES: u64 = 16 * 1024 * 1024;
const MAX_DOCUMENT_BYTES: u64 = 100 * 1024 * 1024;

/// Normalizes a bare phone number to a 1:1 JID by stripping non-digits and
/// appending the default server; a string that already contains `@` is
/// parsed as a JID directly (§9 identifier format).
pub fn normalize_recipient(recipient: &str) -> BridgeResult<Jid> {
    let candidate = if recipient.contains('@') {
        recipient.to_string()
    } else {
        let digits: String = recipient.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return Err(BridgeError::InvalidRecipient(recipient.to_string()));
        }
        format!("{digits}@{DEFAULT_SERVER}")
    };
    candidate
        .parse::<Jid>()
        .map_err(|_| BridgeError::InvalidRecipient(recipient.to_string()))
}

/// `SendText` (§4.7).
pub async fn send_text(
    client: &Arc<Client>,
    store: &dyn MessageStore,
    recipient: &str,
    text: &str,
) -> BridgeResult<String> {
    let jid = normalize_recipient(recipient)?;
    let chat_jid = jid.to_string();
    let message = wa::Message {
        conversation: Some(text.to_string()),
        ..Default::default()
    };
    let message_id = tokio::time::timeout(SEND_DEADLINE, client.send_message(jid, message))
        .await
        .map_err(|_| BridgeError::Timeout)?
        .map_err(|err| BridgeError::SendFailed(err.to_string()))?;

    record_sent(store, &message_id, &chat_jid, text, None).await;
    Ok(message_id)
}

/// `SendFile` (§4.7): content type is auto-detected from the first bytes of
/// the file, falling back to its extension.
pub async fn send_file(
    client: &Arc<Client>,
    store: &dyn MessageStore,
    recipient: &str,
    path: &str,
) -> BridgeResult<String> {
    let jid = normalize_recipient(recipient)?;
    let chat_jid = jid.to_string();

    let data = tokio::fs::read(path)
        .await
        .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
    let mime = sniff_content_type(&data, path);
    let (upload_kind, cap) = classify(&mime);
    if data.len() as u64 > cap {
        return Err(BridgeError::TooLarge);
    }

    let file_name = Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();

    let upload = client
        .upload(data, upload_kind)
        .await
        .map_err(|err| BridgeError::UploadFailed(err.to_string()))?;

    let message = build_media_message(&upload, &mime, &file_name, None);
    let message_id = tokio::time::timeout(SEND_DEADLINE, client.send_message(jid, message))
        .await
        .map_err(|_| BridgeError::Timeout)?
        .map_err(|err| BridgeError::SendFailed(err.to_string()))?;

    record_sent(
        store,
        &message_id,
        &chat_jid,
        &file_name,
        Some(DescriptorFields {
            media_type: media_kind_name(upload_kind).to_string(),
            filename: file_name,
            url: upload.url,
            media_key: upload.media_key,
            file_sha256: upload.file_sha256,
            file_enc_sha256: upload.file_enc_sha256,
            file_length: upload.file_length,
        }),
    )
    .await;
    Ok(message_id)
}

/// `SendVoice` (§4.7): converts to Opus-in-Ogg via `ffmpeg` when needed,
/// synthesizes a waveform preview, and sends as an audio message.
pub async fn send_voice(
    client: &Arc<Client>,
    store: &dyn MessageStore,
    recipient: &str,
    path: &str,
) -> BridgeResult<String> {
    let jid = normalize_recipient(recipient)?;
    let chat_jid = jid.to_string();

    let source_bytes = tokio::fs::read(path)
        .await
        .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
    let waveform = synthesize_waveform(&source_bytes);

    let ogg_path = if is_opus_in_ogg(&source_bytes, path) {
        path.to_string()
    } else {
        convert_to_opus(path).await?
    };

    let data = tokio::fs::read(&ogg_path)
        .await
        .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
    if data.len() as u64 > MAX_AUDIO_BYTES {
        return Err(BridgeError::TooLarge);
    }

    let upload = client
        .upload(data, UploadMediaType::Audio)
        .await
        .map_err(|err| BridgeError::UploadFailed(err.to_string()))?;

    let message = wa::Message {
        audio_message: Some(Box::new(wa::message::AudioMessage {
            url: Some(upload.url.clone()),
            direct_path: Some(upload.direct_path.clone()),
            media_key: Some(upload.media_key.clone()),
            file_sha256: Some(upload.file_sha256.clone()),
            file_enc_sha256: Some(upload.file_enc_sha256.clone()),
            file_length: Some(upload.file_length),
            mimetype: Some("audio/ogg; codecs=opus".to_string()),
            ptt: Some(true),
            waveform: Some(waveform.to_vec()),
            ..Default::default()
        })),
        ..Default::default()
    };

    let message_id = tokio::time::timeout(SEND_DEADLINE, client.send_message(jid, message))
        .await
        .map_err(|_| BridgeError::Timeout)?
        .map_err(|err| BridgeError::SendFailed(err.to_string()))?;

    record_sent(
        store,
        &message_id,
        &chat_jid,
        "",
        Some(DescriptorFields {
            media_type: "audio".to_string(),
            filename: String::new(),
            url: upload.url,
            media_key: upload.media_key,
            file_sha256: upload.file_sha256,
            file_enc_sha256: upload.file_enc_sha256,
            file_length: upload.file_length,
        }),
    )
    .await;
    Ok(message_id)
}

struct DescriptorFields {
    media_type: String,
    filename: String,
    url: String,
    media_key: Vec<u8>,
    file_sha256: Vec<u8>,
    file_enc_sha256: Vec<u8>,
    file_length: u64,
}

async fn record_sent(
    store: &dyn MessageStore,
    message_id: &str,
    chat_jid: &str,
    content: &str,
    media: Option<DescriptorFields>,
) {
    let now = Utc::now();
    if let Err(err) = store.upsert_chat(chat_jid, chat_jid, now).await {
        tracing::warn!(error = %err, chat_jid, "failed to upsert chat for outbound send");
    }
    let upsert = UpsertMessage {
        id: message_id.to_string(),
        chat_jid: chat_jid.to_string(),
        sender: chat_jid.to_string(),
        content: content.to_string(),
        timestamp: now,
        from_me: true,
        media_type: media.as_ref().map(|m| m.media_type.clone()),
        filename: media.as_ref().map(|m| m.filename.clone()),
        url: media.as_ref().map(|m| m.url.clone()),
        media_key: media.as_ref().map(|m| m.media_key.clone()),
        file_sha256: media.as_ref().map(|m| m.file_sha256.clone()),
        file_enc_sha256: media.as_ref().map(|m| m.file_enc_sha256.clone()),
        file_length: media.as_ref().map(|m| m.file_length),
    };
    if let Err(err) = store.upsert_message(upsert).await {
        tracing::error!(error = %err, message_id, "failed to persist sent message");
    }
}

fn build_media_message(
    upload: &whatsapp_rust::upload::UploadResponse,
    mime: &str,
    file_name: &str,
    caption: Option<String>,
) -> wa::Message {
    let (kind, _) = classify(mime);
    match kind {
        UploadMediaType::Image => wa::Message {
            image_message: Some(Box::new(wa::message::ImageMessage {
                url: Some(upload.url.clone()),
                direct_path: Some(upload.direct_path.clone()),
                media_key: Some(upload.media_key.clone()),
                file_sha256: Some(upload.file_sha256.clone()),
                file_enc_sha256: Some(upload.file_enc_sha256.clone()),
                file_length: Some(upload.file_length),
                mimetype: Some(mime.to_string()),
                caption,
                ..Default::default()
            })),
            ..Default::default()
        },
        UploadMediaType::Video => wa::Message {
            video_message: Some(Box::new(wa::message::VideoMessage {
                url: Some(upload.url.clone()),
                direct_path: Some(upload.direct_path.clone()),
                media_key: Some(upload.media_key.clone()),
                file_sha256: Some(upload.file_sha256.clone()),
                file_enc_sha256: Some(upload.file_enc_sha256.clone()),
                file_length: Some(upload.file_length),
                mimetype: Some(mime.to_string()),
                caption,
                ..Default::default()
            })),
            ..Default::default()
        },
        UploadMediaType::Audio => wa::Message {
            audio_message: Some(Box::new(wa::message::AudioMessage {
                url: Some(upload.url.clone()),
                direct_path: Some(upload.direct_path.clone()),
                media_key: Some(upload.media_key.clone()),
                file_sha256: Some(upload.file_sha256.clone()),
                file_enc_sha256: Some(upload.file_enc_sha256.clone()),
                file_length: Some(upload.file_length),
                mimetype: Some(mime.to_string()),
                ..Default::default()
            })),
            ..Default::default()
        },
        UploadMediaType::Document => wa::Message {
            document_message: Some(Box::new(wa::message::DocumentMessage {
                url: Some(upload.url.clone()),
                direct_path: Some(upload.direct_path.clone()),
                media_key: Some(upload.media_key.clone()),
                file_sha256: Some(upload.file_sha256.clone()),
                file_enc_sha256: Some(upload.file_enc_sha256.clone()),
                file_length: Some(upload.file_length),
                mimetype: Some(mime.to_string()),
                file_name: Some(file_name.to_string()),
                caption,
                ..Default::default()
            })),
            ..Default::default()
        },
    }
}

fn media_kind_name(kind: UploadMediaType) -> &'static str {
    match kind {
        UploadMediaType::Image => "image",
        UploadMediaType::Video => "video",
        UploadMediaType::Audio => "audio",
        UploadMediaType::Document => "document",
    }
}

fn classify(mime: &str) -> (UploadMediaType, u64) {
    if mime.starts_with("image/") {
        (UploadMediaType::Image, MAX_IMAGE_BYTES)
    } else if mime.starts_with("video/") {
        (UploadMediaType::Video, MAX_VIDEO_BYTES)
    } else if mime.starts_with("audio/") {
        (UploadMediaType::Audio, MAX_AUDIO_BYTES)
    } else {
        (UploadMediaType::Document, MAX_DOCUMENT_BYTES)
    }
}

fn sniff_content_type(data: &[u8], path: &str) -> String {
    if let Some(kind) = infer::get(data) {
        return kind.mime_type().to_string();
    }
    mime_guess_from_extension(path)
}

fn mime_guess_from_extension(path: &str) -> String {
    match Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("ogg") => "audio/ogg",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
    .to_string()
}

fn is_opus_in_ogg(data: &[u8], path: &str) -> bool {
    if data.len() >= 4 && &data[0..4] == b"OggS" {
        return true;
    }
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("ogg") || ext.eq_ignore_ascii_case("opus"))
        .unwrap_or(false)
}

/// Deterministic pipeline: `-c:a libopus -b:a 16k -ac 1 -ar 48000 -f ogg`.
/// Returns `VoiceConversionUnavailable` if ffmpeg is absent from PATH.
async fn convert_to_opus(input_path: &str) -> BridgeResult<String> {
    let output_path = format!("{input_path}.converted.ogg");
    let run = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(input_path)
        .args(["-c:a", "libopus", "-b:a", "16k", "-ac", "1", "-ar", "48000", "-f", "ogg"])
        .arg(&output_path)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output();

    let output = match tokio::time::timeout(FFMPEG_DEADLINE, run).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(BridgeError::VoiceConversionUnavailable);
        }
        Ok(Err(err)) => return Err(BridgeError::IOFailed(err.to_string())),
        Err(_) => return Err(BridgeError::Timeout),
    };

    if !output.status.success() {
        return Err(BridgeError::IOFailed(format!(
            "ffmpeg exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(output_path)
}

/// Synthetic 64-byte waveform preview: a deterministic placeholder mapping
/// input bytes to `0..=100` integers (§4.7, §8 invariant 5).
pub fn synthesize_waveform(bytes: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    if bytes.is_empty() {
        return out;
    }
    for (i, slot) in out.iter_mut().enumerate() {
        let idx = (i * bytes.len()) / 64;
        *slot = (bytes[idx] as u32 % 101) as u8;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bare_phone_number() {
        let jid = normalize_recipient("+1 (555) 123-4567").unwrap();
        assert_eq!(jid.to_string(), "15551234567@s.whatsapp.net");
    }

    #[test]
    fn rejects_recipient_with_no_digits() {
        assert!(normalize_recipient("not-a-number").is_err());
    }

    #[test]
    fn passes_through_explicit_jid() {
        let jid = normalize_recipient("123@g.us").unwrap();
        assert_eq!(jid.to_string(), "123@g.us");
    }

    #[test]
    fn waveform_has_fixed_length_and_range() {
        for input in [&b""[..], &b"x"[..], &[7u8; 500][..]] {
            let waveform = synthesize_waveform(input);
            assert_eq!(waveform.len(), 64);
            assert!(waveform.iter().all(|&v| v <= 100));
        }
    }

    #[test]
    fn classifies_known_mime_prefixes() {
        assert_eq!(classify("image/png").0, UploadMediaType::Image);
        assert_eq!(classify("video/mp4").0, UploadMediaType::Video);
        assert_eq!(classify("audio/ogg").0, UploadMediaType::Audio);
        assert_eq!(classify("application/pdf").0, UploadMediaType::Document);
    }
}
