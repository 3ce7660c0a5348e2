use std::path::PathBuf;

/// Process configuration, read once at startup from the environment.
///
/// Every field is given an explicit default via an accessor rather than
/// baked into the struct, the way the upstream agent's `SchedulerConfig`
/// centralizes its defaults (`enabled(&self) -> bool { ... unwrap_or(false) }`).
#[derive(Debug, Clone)]
pub struct Config {
    data_dsn: Option<String>,
    sessions_dsn: Option<String>,
    media_root: Option<PathBuf>,
    port: Option<u16>,
    session_bucket: Option<String>,
    session_object: Option<String>,
    log_level: Option<String>,
}

impl Config {
    /// A config pointed at a given data directory, everything else
    /// defaulted; used by integration tests to avoid depending on process
    /// environment variables.
    pub fn for_data_dir(media_root: PathBuf) -> Self {
        Self {
            data_dsn: None,
            sessions_dsn: None,
            media_root: Some(media_root),
            port: None,
            session_bucket: None,
            session_object: None,
            log_level: None,
        }
    }

    pub fn from_env() -> Self {
        Self {
            data_dsn: non_empty(std::env::var("DATA_DSN").ok()),
            sessions_dsn: non_empty(std::env::var("SESSIONS_DSN").ok()),
            media_root: std::env::var("MEDIA_ROOT").ok().map(PathBuf::from),
            port: std::env::var("PORT").ok().and_then(|v| v.parse().ok()),
            session_bucket: non_empty(std::env::var("SESSION_BUCKET").ok()),
            session_object: non_empty(std::env::var("SESSION_OBJECT").ok()),
            log_level: non_empty(std::env::var("LOG_LEVEL").ok()),
        }
    }

    pub fn data_dsn(&self) -> Option<&str> {
        self.data_dsn.as_deref()
    }

    pub fn sessions_dsn(&self) -> Option<&str> {
        self.sessions_dsn.as_deref()
    }

    pub fn media_root(&self) -> PathBuf {
        self.media_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("./store"))
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8080)
    }

    pub fn session_bucket(&self) -> Option<&str> {
        self.session_bucket.as_deref()
    }

    pub fn session_object(&self) -> Option<&str> {
        self.session_object.as_deref()
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn messages_db_path(&self) -> PathBuf {
        self.media_root().join("messages.db")
    }

    pub fn session_db_path(&self) -> PathBuf {
        self.media_root().join("session.db")
    }

    /// Whether a DSN names a remote scheme rather than an embedded file path.
    pub fn is_remote_dsn(value: &str) -> bool {
        !(value.starts_with("file:")
            || value.starts_with("sqlite:")
            || value.starts_with("./")
            || value.starts_with('/'))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        let config = Config {
            data_dsn: None,
            sessions_dsn: None,
            media_root: None,
            port: None,
            session_bucket: None,
            session_object: None,
            log_level: None,
        };
        assert_eq!(config.port(), 8080);
        assert_eq!(config.media_root(), PathBuf::from("./store"));
        assert_eq!(config.log_level(), "info");
    }

    #[test]
    fn recognizes_remote_dsn_schemes() {
        assert!(Config::is_remote_dsn("postgres://user@host/db"));
        assert!(!Config::is_remote_dsn("file:./store/messages.db"));
        assert!(!Config::is_remote_dsn("./store/messages.db"));
    }
}
