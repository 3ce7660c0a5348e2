use axum::Json;
use axum::extract::State;
use axum::response::{Html, IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

use super::state::AppState;

pub async fn health() -> &'static str {
    "ok"
}

pub async fn status(State(state): State<AppState>) -> Json<crate::gateway::BridgeHealth> {
    Json(state.gateway.health().await)
}

pub async fn session_backend(
    State(state): State<AppState>,
) -> Json<crate::gateway::SessionBackendView> {
    Json(state.gateway.session_backend_view().await)
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub recipient: String,
    pub message: Option<String>,
    pub file_path: Option<String>,
    pub audio: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /api/send` (§4.8): exactly one of `message | file_path | audio`.
pub async fn send(State(state): State<AppState>, Json(request): Json<SendRequest>) -> Response {
    let set_count = [
        request.message.is_some(),
        request.file_path.is_some(),
        request.audio.is_some(),
    ]
    .into_iter()
    .filter(|set| *set)
    .count();
    if set_count != 1 {
        return BridgeError::InvalidRequest(
            "exactly one of message, file_path, audio must be set".to_string(),
        )
        .into_response();
    }

    let result = if let Some(text) = &request.message {
        state.gateway.send_text(&request.recipient, text).await
    } else if let Some(path) = &request.file_path {
        state.gateway.send_file(&request.recipient, path).await
    } else {
        let path = request.audio.as_ref().expect("exactly-one check above");
        state.gateway.send_voice(&request.recipient, path).await
    };

    match result {
        Ok(message_id) => Json(SendResponse {
            success: true,
            message_id: Some(message_id),
            error: None,
        })
        .into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub message_id: String,
    pub chat_jid: String,
}

#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /api/download` (§4.8).
pub async fn download(
    State(state): State<AppState>,
    Json(request): Json<DownloadRequest>,
) -> Response {
    match state
        .gateway
        .download(&request.message_id, &request.chat_jid)
        .await
    {
        Ok(path) => Json(DownloadResponse {
            success: true,
            file_path: Some(path.to_string_lossy().to_string()),
            error: None,
        })
        .into_response(),
        Err(err) => err.into_response(),
    }
}

/// `GET /qr` (§4.8): inline PNG, polls `/api/status` every 2s, hides itself
/// once authenticated.
pub async fn qr_page(State(state): State<AppState>) -> Html<String> {
    let qr_image = match state.gateway.qr().current() {
        Some((code, _)) => crate::qr::QrState::render_png_base64(&code)
            .map(|b64| format!("<img src=\"data:image/png;base64,{b64}\" alt=\"pairing QR\" />"))
            .unwrap_or_else(|| "<p>Failed to render QR code.</p>".to_string()),
        None => "<p>No pairing QR is currently active.</p>".to_string(),
    };

    Html(format!(
        r#"<!DOCTYPE html>
<html><head><title>Pair device</title></head>
<body>
<div id="qr-container">{qr_image}</div>
<p>Scan this code from WhatsApp &gt; Linked Devices.</p>
<script>
async function poll() {{
  const res = await fetch('/api/status');
  const body = await res.json();
  if (body.authenticated) {{
    document.getElementById('qr-container').innerHTML = '<p>Paired.</p>';
    return;
  }}
  setTimeout(poll, 2000);
}}
poll();
</script>
</body></html>"#
    ))
}

/// `GET /status` (§4.8): dashboard auto-refreshing `/api/status` every 30s.
pub async fn status_page(State(state): State<AppState>) -> Html<String> {
    let health = state.gateway.health().await;
    Html(format!(
        r#"<!DOCTYPE html>
<html><head><title>Bridge status</title></head>
<body>
<h1>WhatsApp bridge</h1>
<pre id="health">{}</pre>
<script>
async function refresh() {{
  const res = await fetch('/api/status');
  const body = await res.json();
  document.getElementById('health').textContent = JSON.stringify(body, null, 2);
}}
setInterval(refresh, 30000);
</script>
</body></html>"#,
        serde_json::to_string_pretty(&health).unwrap_or_default()
    ))
}
