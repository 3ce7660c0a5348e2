use std::sync::Mutex;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use qrcode::QrCode;
use qrcode::render::unicode;

/// At-most-one current pairing QR plus its last-refresh timestamp. Exists
/// only while the device is unpaired; destroyed on pairing success (§3).
#[derive(Debug, Default)]
pub struct QrState {
    inner: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl QrState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, code: String) {
        let mut guard = self.inner.lock().expect("qr state mutex poisoned");
        *guard = Some((code, Utc::now()));
    }

    pub fn clear(&self) {
        let mut guard = self.inner.lock().expect("qr state mutex poisoned");
        *guard = None;
    }

    pub fn current(&self) -> Option<(String, DateTime<Utc>)> {
        self.inner.lock().expect("qr state mutex poisoned").clone()
    }

    pub fn render_terminal(payload: &str) -> String {
        match QrCode::new(payload) {
            Ok(code) => code.render::<unicode::Dense1x2>().quiet_zone(true).build(),
            Err(_) => payload.to_string(),
        }
    }

    /// Renders the payload as a PNG, base64-encoded for inline use in `/qr`.
    pub fn render_png_base64(payload: &str) -> Option<String> {
        let code = QrCode::new(payload).ok()?;
        let image = code.render::<image::Luma<u8>>().max_dimensions(320, 320).build();
        let mut bytes: Vec<u8> = Vec::new();
        image
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .ok()?;
        Some(BASE64.encode(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_state_holds_most_recent_only() {
        let state = QrState::new();
        assert!(state.current().is_none());
        state.set("first".to_string());
        state.set("second".to_string());
        let (code, _) = state.current().unwrap();
        assert_eq!(code, "second");
        state.clear();
        assert!(state.current().is_none());
    }
}
