use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use url::Url;
use waproto::whatsapp as wa;
use whatsapp_rust::Client;

use crate::error::{BridgeError, BridgeResult};
use crate::store::{MediaDescriptor, MessageStore};

const DOWNLOAD_DEADLINE: Duration = Duration::from_secs(60);

/// Chooses a file extension from a fixed map keyed by media type (§4.6).
/// Document keeps the stored filename's extension when present.
pub fn extension_for(media_type: &str, filename: &str) -> String {
    match media_type {
        "image" => "jpg".to_string(),
        "video" => "mp4".to_string(),
        "audio" => "ogg".to_string(),
        "sticker" => "webp".to_string(),
        "document" => Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| "bin".to_string()),
        _ => "bin".to_string(),
    }
}

/// Derives the CDN direct path from a full URL by stripping scheme, host,
/// and query; the result always begins with `/` and is strictly shorter
/// than the input (§8 invariant 4). Applying it to an already-bare direct
/// path is a fixpoint.
pub fn extract_direct_path(url: &str) -> String {
    if let Ok(parsed) = Url::parse(url) {
        let path = parsed.path();
        if path.starts_with('/') {
            return path.to_string();
        }
    }
    if url.starts_with('/') {
        return url.to_string();
    }
    format!("/{url}")
}

/// On-demand media download (C6 inbound path), entry point `Download`.
pub async fn download(
    store: &dyn MessageStore,
    client: &Arc<Client>,
    media_root: &Path,
    message_id: &str,
    chat_jid: &str,
) -> BridgeResult<PathBuf> {
    let descriptor = store.get_media_info(message_id, chat_jid).await?;
    if !descriptor.is_present() {
        return Err(BridgeError::NoMedia);
    }

    let bytes = download_with_retry(client, &descriptor).await?;

    let ext = extension_for(&descriptor.media_type, &descriptor.filename);
    let dir = media_root.join(chat_jid);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
    let final_path = dir.join(format!("{message_id}.{ext}"));
    let tmp_path = dir.join(format!("{message_id}.{ext}.tmp"));
    tokio::fs::write(&tmp_path, &bytes)
        .await
        .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
    tokio::fs::rename(&tmp_path, &final_path)
        .await
        .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
    Ok(final_path)
}

/// Runs the decrypt/download under a 60s deadline, retrying once on timeout
/// before surfacing `BridgeError::Timeout` (§5, §7).
async fn download_with_retry(client: &Arc<Client>, descriptor: &MediaDescriptor) -> BridgeResult<Vec<u8>> {
    match tokio::time::timeout(DOWNLOAD_DEADLINE, decrypt_download(client, descriptor)).await {
        Ok(result) => result.map_err(|err| BridgeError::DecryptFailed(err.to_string())),
        Err(_) => {
            tracing::warn!("media download timed out, retrying once");
            tokio::time::timeout(DOWNLOAD_DEADLINE, decrypt_download(client, descriptor))
                .await
                .map_err(|_| BridgeError::Timeout)?
                .map_err(|err| BridgeError::DecryptFailed(err.to_string()))
        }
    }
}

/// Reconstructs the minimal protocol message shape the library requires
/// for decryption from the persisted descriptor fields, then calls the
/// library's typed downloader. The descriptor's `url` may be a full CDN URL
/// (history-synced messages) or an already-bare direct path (freshly
/// received ones); both are accepted.
async fn decrypt_download(
    client: &Arc<Client>,
    descriptor: &MediaDescriptor,
) -> anyhow::Result<Vec<u8>> {
    let direct_path = extract_direct_path(&descriptor.url);
    let mut buf = Vec::new();
    match descriptor.media_type.as_str() {
        "image" => {
            let msg = wa::message::ImageMessage {
                url: Some(descriptor.url.clone()),
                direct_path: Some(direct_path),
                media_key: Some(descriptor.media_key.clone()),
                file_sha256: Some(descriptor.file_sha256.clone()),
                file_enc_sha256: Some(descriptor.file_enc_sha256.clone()),
                file_length: Some(descriptor.file_length),
                ..Default::default()
            };
            client.download_to_file(&msg, &mut buf).await?;
        }
        "video" => {
            let msg = wa::message::VideoMessage {
                url: Some(descriptor.url.clone()),
                direct_path: Some(direct_path),
                media_key: Some(descriptor.media_key.clone()),
                file_sha256: Some(descriptor.file_sha256.clone()),
                file_enc_sha256: Some(descriptor.file_enc_sha256.clone()),
                file_length: Some(descriptor.file_length),
                ..Default::default()
            };
            client.download_to_file(&msg, &mut buf).await?;
        }
        "audio" => {
            let msg = wa::message::AudioMessage {
                url: Some(descriptor.url.clone()),
                direct_path: Some(direct_path),
                media_key: Some(descriptor.media_key.clone()),
                file_sha256: Some(descriptor.file_sha256.clone()),
                file_enc_sha256: Some(descriptor.file_enc_sha256.clone()),
                file_length: Some(descriptor.file_length),
                ..Default::default()
            };
            client.download_to_file(&msg, &mut buf).await?;
        }
        "document" => {
            let msg = wa::message::DocumentMessage {
                url: Some(descriptor.url.clone()),
                direct_path: Some(direct_path),
                media_key: Some(descriptor.media_key.clone()),
                file_sha256: Some(descriptor.file_sha256.clone()),
                file_enc_sha256: Some(descriptor.file_enc_sha256.clone()),
                file_length: Some(descriptor.file_length),
                file_name: Some(descriptor.filename.clone()),
                ..Default::default()
            };
            client.download_to_file(&msg, &mut buf).await?;
        }
        "sticker" => {
            let msg = wa::message::StickerMessage {
                url: Some(descriptor.url.clone()),
                direct_path: Some(direct_path),
                media_key: Some(descriptor.media_key.clone()),
                file_sha256: Some(descriptor.file_sha256.clone()),
                file_enc_sha256: Some(descriptor.file_enc_sha256.clone()),
                file_length: Some(descriptor.file_length),
                ..Default::default()
            };
            client.download_to_file(&msg, &mut buf).await?;
        }
        other => anyhow::bail!("unsupported media type: {other}"),
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_map_matches_spec() {
        assert_eq!(extension_for("image", ""), "jpg");
        assert_eq!(extension_for("video", ""), "mp4");
        assert_eq!(extension_for("audio", ""), "ogg");
        assert_eq!(extension_for("sticker", ""), "webp");
        assert_eq!(extension_for("document", "report.pdf"), "pdf");
        assert_eq!(extension_for("document", ""), "bin");
    }

    #[test]
    fn direct_path_extraction_is_a_fixpoint() {
        let url = "https://mmg.whatsapp.net/v/t62.7118-24/abc?ccb=1&oh=foo";
        let path = extract_direct_path(url);
        assert!(path.starts_with('/'));
        assert!(path.len() < url.len());
        let again = extract_direct_path(&path);
        assert_eq!(again, path);
    }

    #[test]
    fn direct_path_of_bare_path_is_unchanged() {
        let path = "/v/t62.7118-24/abc";
        assert_eq!(extract_direct_path(path), path);
    }
}
