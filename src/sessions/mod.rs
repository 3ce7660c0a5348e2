use sqlx::PgPool;
use url::Url;

use crate::error::{BridgeError, BridgeResult};

/// The 13 tables the protocol library's store contract requires, per §4.2.
pub const REQUIRED_SESSION_TABLES: &[&str] = &[
    "devices",
    "identities",
    "prekeys",
    "sessions",
    "sender_keys",
    "signed_prekeys",
    "app_state_sync_keys",
    "app_state_version",
    "app_state_mutation_macs",
    "contacts",
    "chat_settings",
    "message_secrets",
    "privacy_tokens",
];

/// Driver-abstracted protocol session backend (C2). The bridge never writes
/// these tables directly; the protocol library owns them entirely.
pub enum SessionBackend {
    /// File-backed store at `path`, opened by `whatsapp-rust-sqlite-storage`.
    Embedded { path: String },
    /// Validated Postgres connection. The ecosystem's protocol library ships
    /// only a SQLite-backed store implementation, so this variant validates
    /// connectivity/schema and reports health — it does not give the
    /// protocol library itself a second storage backend. See DESIGN.md.
    External { pool: PgPool, host: String },
}

impl SessionBackend {
    pub fn embedded(path: String) -> Self {
        SessionBackend::Embedded { path }
    }

    pub async fn external(dsn: &str) -> BridgeResult<Self> {
        let pool = PgPool::connect(dsn)
            .await
            .map_err(|err| BridgeError::SessionUnavailable(err.to_string()))?;
        let host = Url::parse(dsn)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        let backend = SessionBackend::External { pool, host };
        backend.validate_schema().await?;
        Ok(backend)
    }

    async fn validate_schema(&self) -> BridgeResult<()> {
        let SessionBackend::External { pool, .. } = self else {
            return Ok(());
        };
        for table in REQUIRED_SESSION_TABLES {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
            )
            .bind(table)
            .fetch_one(pool)
            .await
            .map_err(|err| BridgeError::SessionUnavailable(err.to_string()))?;
            if !exists {
                return Err(BridgeError::SchemaMissing(format!(
                    "session table `{table}` missing"
                )));
            }
        }
        Ok(())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SessionBackend::Embedded { .. } => "embedded",
            SessionBackend::External { .. } => "external",
        }
    }

    pub fn host(&self) -> String {
        match self {
            SessionBackend::Embedded { path } => path.clone(),
            SessionBackend::External { host, .. } => host.clone(),
        }
    }

    /// Re-checks the required tables; used by `/api/session-backend` and the
    /// periodic health sweep for the external driver.
    pub async fn tables_ok(&self) -> bool {
        match self {
            SessionBackend::Embedded { path } => std::path::Path::new(path).parent().is_some(),
            SessionBackend::External { .. } => self.validate_schema().await.is_ok(),
        }
    }

    pub fn embedded_path(&self) -> Option<&str> {
        match self {
            SessionBackend::Embedded { path } => Some(path.as_str()),
            SessionBackend::External { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_reports_its_path_as_host() {
        let backend = SessionBackend::embedded("./store/session.db".to_string());
        assert_eq!(backend.kind(), "embedded");
        assert_eq!(backend.host(), "./store/session.db");
    }
}
