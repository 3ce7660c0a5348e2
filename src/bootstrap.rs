use std::path::{Path, PathBuf};
use std::time::Duration;

use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::primitives::ByteStream;

use crate::config::Config;
use crate::error::{BridgeError, BridgeResult};
use crate::sessions::SessionBackend;
use crate::store::postgres::PostgresMessageStore;
use crate::store::sqlite::SqliteMessageStore;
use crate::store::{MessageBackend, MessageStore};

/// Periodic snapshot interval for the embedded session file when object
/// store backup is active. Left unspecified upstream; this default mirrors
/// the agent's own hourly/periodic-task conventions scaled to the tighter
/// continuity requirement session files have.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct Bootstrap {
    pub messages: MessageBackend,
    pub sessions: SessionBackend,
    pub backup: Option<SessionBackup>,
}

/// Selects and prepares both backends per the precedence in §4.3, then
/// validates schema (fail-fast on `SchemaMissing`/unreachable external
/// backends), and wires the object-store backup loop when the embedded
/// session path is in play and a bucket/object is configured.
pub async fn bootstrap(config: &Config) -> BridgeResult<Bootstrap> {
    let messages = match config.data_dsn() {
        Some(dsn) if Config::is_remote_dsn(dsn) => {
            let store = PostgresMessageStore::connect(dsn).await?;
            MessageBackend::External(store)
        }
        _ => MessageBackend::Embedded(SqliteMessageStore::new(
            config.messages_db_path().to_string_lossy().to_string(),
        )),
    };
    messages.init().await?;

    let sessions_dsn = config
        .sessions_dsn()
        .filter(|dsn| Config::is_remote_dsn(dsn))
        .or_else(|| config.data_dsn().filter(|dsn| Config::is_remote_dsn(dsn)));

    let sessions = match sessions_dsn {
        Some(dsn) => SessionBackend::external(dsn).await?,
        None => SessionBackend::embedded(config.session_db_path().to_string_lossy().to_string()),
    };

    let backup = match &sessions {
        SessionBackend::Embedded { path } => {
            match (config.session_bucket(), config.session_object()) {
                (Some(bucket), Some(object)) => {
                    Some(SessionBackup::new(bucket.to_string(), object.to_string(), path.clone()).await?)
                }
                _ => None,
            }
        }
        SessionBackend::External { .. } => None,
    };

    Ok(Bootstrap {
        messages,
        sessions,
        backup,
    })
}

/// Restores and periodically snapshots the embedded session file to an
/// external object store, preserving continuity across ephemeral
/// containers. Skipped entirely in external-sessions mode, per the Open
/// Question resolved in DESIGN.md ("the original backs up only the
/// embedded session file... behavior is intentional and preserved").
pub struct SessionBackup {
    client: S3Client,
    bucket: String,
    object: String,
    session_path: PathBuf,
}

impl SessionBackup {
    pub async fn new(bucket: String, object: String, session_path: String) -> BridgeResult<Self> {
        let aws_config = aws_config::load_from_env().await;
        let client = S3Client::new(&aws_config);
        let backup = Self {
            client,
            bucket,
            object,
            session_path: PathBuf::from(session_path),
        };
        backup.restore_on_start().await;
        Ok(backup)
    }

    async fn restore_on_start(&self) {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.object)
            .send()
            .await
        {
            Ok(output) => {
                let body = match output.body.collect().await {
                    Ok(body) => body.into_bytes(),
                    Err(err) => {
                        tracing::warn!(error = %err, "session backup: failed to read object body");
                        return;
                    }
                };
                if let Some(parent) = self.session_path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(err) = std::fs::write(&self.session_path, &body) {
                    tracing::warn!(error = %err, "session backup: failed to write restored session file");
                } else {
                    tracing::info!("session backup: restored session file from object store");
                }
            }
            Err(err) => {
                tracing::info!(error = %err, "session backup: no prior snapshot to restore (or unreachable)");
            }
        }
    }

    /// Spawns the periodic snapshot loop; returns its join handle so the
    /// caller can await it (with a 10s budget) during shutdown.
    pub fn spawn_periodic(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SNAPSHOT_INTERVAL).await;
                if let Err(err) = self.snapshot_once().await {
                    tracing::warn!(error = %err, "session backup: periodic snapshot failed");
                }
            }
        })
    }

    pub async fn snapshot_once(&self) -> BridgeResult<()> {
        let path = self.session_path.clone();
        let bytes = tokio::task::spawn_blocking(move || read_atomically(&path))
            .await
            .map_err(|err| BridgeError::IOFailed(err.to_string()))??;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.object)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| BridgeError::IOFailed(err.to_string()))?;
        Ok(())
    }

    /// Final snapshot at shutdown; the caller enforces the 10s upload budget.
    pub async fn snapshot_on_shutdown(&self) {
        if let Err(err) = self.snapshot_once().await {
            tracing::warn!(error = %err, "session backup: final snapshot failed");
        }
    }
}

fn read_atomically(path: &Path) -> BridgeResult<Vec<u8>> {
    std::fs::read(path).map_err(|err| BridgeError::IOFailed(err.to_string()))
}
