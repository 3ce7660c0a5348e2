pub mod events;
pub mod media;
pub mod send;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use wacore::types::events::Event;
use whatsapp_rust::Client;
use whatsapp_rust::bot::Bot;
use whatsapp_rust_sqlite_storage::SqliteStore;
use whatsapp_rust_tokio_transport::TokioWebSocketTransportFactory;
use whatsapp_rust_ureq_http_client::UreqHttpClient;

use crate::bootstrap::{Bootstrap, SessionBackup};
use crate::config::Config;
use crate::error::{BridgeError, BridgeResult};
use crate::qr::QrState;
use crate::sessions::SessionBackend;
use crate::store::MessageStore;

use events::EventRouter;

const LIBRARY_OP_DEADLINE: Duration = Duration::from_secs(30);
const BACKOFF_BASE: Duration = Duration::from_millis(1000);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);
const SNAPSHOT_SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

/// `BridgeHealth` (§3), with the supplemented `uptime_secs`/`reconnect_count`
/// fields the ambient observability stack adds.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeHealth {
    pub process_up: bool,
    pub authenticated: bool,
    pub ready: bool,
    pub messages_db_reachable: bool,
    pub sessions_db_reachable: bool,
    pub chat_count: u64,
    pub message_count: u64,
    pub db_size_bytes: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub uptime_secs: u64,
    pub reconnect_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionBackendView {
    pub backend: &'static str,
    pub session_tables_ok: bool,
    pub session_host: String,
    pub message_backend: &'static str,
    pub message_tables_ok: bool,
    pub errors: Vec<String>,
}

/// C4: owns the single protocol client, the pairing QR, and the reconnect
/// loop. C5/C7 reach the client only through here.
pub struct Gateway {
    config: Config,
    store: Arc<dyn MessageStore>,
    message_backend_kind: &'static str,
    sessions: SessionBackend,
    session_db_path: PathBuf,
    backup: Option<Arc<SessionBackup>>,
    qr: QrState,
    events: EventRouter,
    client: RwLock<Option<Arc<Client>>>,
    authenticated: AtomicBool,
    started_at: Instant,
    reconnect_count: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_sync_at: Mutex<Option<DateTime<Utc>>>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(config: Config, bootstrap: Bootstrap) -> Arc<Self> {
        let message_backend_kind = bootstrap.messages.kind();
        let store: Arc<dyn MessageStore> = Arc::new(bootstrap.messages);
        let events = EventRouter::spawn(Arc::clone(&store));
        let session_db_path = config.session_db_path();
        Arc::new(Self {
            config,
            store,
            message_backend_kind,
            sessions: bootstrap.sessions,
            session_db_path,
            backup: bootstrap.backup.map(Arc::new),
            qr: QrState::new(),
            events,
            client: RwLock::new(None),
            authenticated: AtomicBool::new(false),
            started_at: Instant::now(),
            reconnect_count: AtomicU64::new(0),
            last_error: Mutex::new(None),
            last_sync_at: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn qr(&self) -> &QrState {
        &self.qr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn client(&self) -> BridgeResult<Arc<Client>> {
        self.client
            .read()
            .await
            .clone()
            .ok_or(BridgeError::NotConnected)
    }

    /// Drives the Unstarted→Pairing→Connected loop with exponential backoff
    /// reconnects, continuing indefinitely until shutdown is requested (§4.4).
    pub async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        let reconnect_signal = self.events.reconnect_requested();
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            let run_result = tokio::select! {
                result = self.run_once() => result,
                _ = reconnect_signal.notified() => {
                    tracing::warn!("reconnect requested by persistence failure budget");
                    Err(BridgeError::LibraryError("reconnect requested".to_string()))
                }
                _ = self.shutdown.cancelled() => return,
            };

            {
                let mut client = self.client.write().await;
                *client = None;
            }
            self.authenticated.store(false, Ordering::Relaxed);

            if let Err(err) = run_result {
                *self.last_error.lock().await = Some(err.to_string());
                tracing::error!(error = %err, "whatsapp client session ended");
            }

            if self.shutdown.is_cancelled() {
                return;
            }

            self.reconnect_count.fetch_add(1, Ordering::Relaxed);
            let backoff = compute_backoff(attempt);
            attempt = attempt.saturating_add(1);
            tracing::info!(backoff_ms = backoff.as_millis() as u64, "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown.cancelled() => return,
            }
        }
    }

    async fn run_once(self: &Arc<Self>) -> BridgeResult<()> {
        let backend = SqliteStore::new(&self.session_db_path.to_string_lossy())
            .await
            .map_err(|err| BridgeError::SessionUnavailable(err.to_string()))?;

        let (client_tx, mut client_rx) = tokio::sync::mpsc::unbounded_channel();
        let gateway = Arc::clone(self);

        let mut bot = Bot::builder()
            .with_backend(Arc::new(backend))
            .with_transport_factory(TokioWebSocketTransportFactory::new())
            .with_http_client(UreqHttpClient::new())
            .on_event(move |event, client| {
                let gateway = Arc::clone(&gateway);
                let client_tx = client_tx.clone();
                async move {
                    let _ = client_tx.send(Arc::clone(&client));
                    gateway.on_event(event).await;
                }
            })
            .build()
            .await
            .map_err(|err| BridgeError::LibraryError(err.to_string()))?;

        let mut run_task = tokio::spawn(async move {
            match bot.run().await {
                Ok(handle) => handle.await.ok(),
                Err(err) => {
                    tracing::error!(error = %err, "whatsapp bot error");
                    None
                }
            }
        });

        let client = tokio::select! {
            Some(client) = client_rx.recv() => client,
            _ = &mut run_task => return Err(BridgeError::LibraryError("bot exited before connecting".to_string())),
            _ = self.shutdown.cancelled() => {
                run_task.abort();
                return Ok(());
            }
        };
        {
            let mut guard = self.client.write().await;
            *guard = Some(client);
        }

        tokio::select! {
            _ = &mut run_task => Err(BridgeError::LibraryError("bot task ended".to_string())),
            _ = self.shutdown.cancelled() => {
                run_task.abort();
                Ok(())
            }
        }
    }

    async fn on_event(&self, event: Event) {
        match &event {
            Event::Connected(_) => self.authenticated.store(true, Ordering::Relaxed),
            Event::LoggedOut(_) => self.authenticated.store(false, Ordering::Relaxed),
            Event::Message(_, _) => {
                *self.last_sync_at.lock().await = Some(Utc::now());
            }
            _ => {}
        }
        self.events.handle(event, &self.qr).await;
    }

    pub async fn send_text(&self, recipient: &str, text: &str) -> BridgeResult<String> {
        let client = self.client().await?;
        send::send_text(&client, self.store.as_ref(), recipient, text).await
    }

    pub async fn send_file(&self, recipient: &str, path: &str) -> BridgeResult<String> {
        let client = self.client().await?;
        send::send_file(&client, self.store.as_ref(), recipient, path).await
    }

    pub async fn send_voice(&self, recipient: &str, path: &str) -> BridgeResult<String> {
        let client = self.client().await?;
        send::send_voice(&client, self.store.as_ref(), recipient, path).await
    }

    pub async fn download(&self, message_id: &str, chat_jid: &str) -> BridgeResult<PathBuf> {
        let client = self.client().await?;
        media::download(
            self.store.as_ref(),
            &client,
            &self.config.media_root(),
            message_id,
            chat_jid,
        )
        .await
    }

    pub async fn health(&self) -> BridgeHealth {
        let messages_ok = tokio::time::timeout(LIBRARY_OP_DEADLINE, self.store.count_chats())
            .await
            .is_ok_and(|result| result.is_ok());
        let chat_count = self.store.count_chats().await.unwrap_or(0);
        let message_count = self.store.count_messages().await.unwrap_or(0);
        let db_size_bytes = self.store.size_bytes().await.unwrap_or(0);
        let sessions_ok = self.sessions.tables_ok().await;
        let authenticated = self.authenticated.load(Ordering::Relaxed);

        BridgeHealth {
            process_up: true,
            authenticated,
            ready: authenticated && messages_ok && sessions_ok,
            messages_db_reachable: messages_ok,
            sessions_db_reachable: sessions_ok,
            chat_count,
            message_count,
            db_size_bytes,
            last_sync_at: *self.last_sync_at.lock().await,
            last_error: self.last_error.lock().await.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
        }
    }

    pub async fn session_backend_view(&self) -> SessionBackendView {
        let mut errors = Vec::new();
        let message_tables_ok = self.store.count_chats().await.is_ok();
        if !message_tables_ok {
            errors.push("message store unreachable".to_string());
        }
        let session_tables_ok = self.sessions.tables_ok().await;
        if !session_tables_ok {
            errors.push("session backend schema invalid or unreachable".to_string());
        }
        SessionBackendView {
            backend: self.sessions.kind(),
            session_tables_ok,
            session_host: self.sessions.host(),
            message_backend: self.message_backend_kind,
            message_tables_ok,
            errors,
        }
    }

    /// Spawns the periodic session-file snapshotter if object-store backup
    /// is configured; returns its join handle so shutdown can cancel it.
    pub fn spawn_backup(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        self.backup.clone().map(SessionBackup::spawn_periodic)
    }

    /// Graceful shutdown within the 30s total budget (§5): cancels the event
    /// loop and reconnect wait, then takes a final session snapshot bounded
    /// to 10s if object-store backup is active.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(backup) = &self.backup {
            let backup = Arc::clone(backup);
            let snapshot = tokio::time::timeout(SNAPSHOT_SHUTDOWN_BUDGET, async move {
                backup.snapshot_on_shutdown().await;
            });
            if snapshot.await.is_err() {
                tracing::warn!("session snapshot aborted at shutdown budget");
            }
        }
    }

    pub fn shutdown_budget() -> Duration {
        SHUTDOWN_BUDGET
    }
}

/// Exponential backoff with a 1s base, 30s cap, doubling per attempt, and
/// +/-20% jitter, generalizing the teacher's `compute_backoff` (§4.4).
fn compute_backoff(attempt: u32) -> Duration {
    let exp = attempt.min(5);
    let base_ms = BACKOFF_BASE.as_millis() as u64 * (1u64 << exp);
    let capped_ms = base_ms.min(BACKOFF_CAP.as_millis() as u64);
    let jitter_seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let jitter_pct = 80 + (jitter_seed % 41) as u64;
    Duration::from_millis(capped_ms.saturating_mul(jitter_pct) / 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_within_jittered_cap() {
        for attempt in 0..10 {
            let backoff = compute_backoff(attempt);
            assert!(backoff >= Duration::from_millis(800));
            assert!(backoff <= Duration::from_millis((BACKOFF_CAP.as_millis() as u64 * 120 / 100) as u64));
        }
    }

    #[test]
    fn backoff_grows_with_attempt_before_cap() {
        assert!(compute_backoff(0) < compute_backoff(3));
    }
}
