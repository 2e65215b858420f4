use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::common::{
    is_valid_expires_in, Session, User, DEFAULT_EXPIRES_IN_SECS, DEFAULT_TOKEN_TYPE,
};
use crate::error::AuthError;

/// Keys under which session fields are persisted. All values are strings.
pub mod keys {
    pub const ACCESS_TOKEN: &str = "accessToken";
    pub const REFRESH_TOKEN: &str = "refreshToken";
    pub const TOKEN_TYPE: &str = "tokenType";
    pub const EXPIRES_IN: &str = "expiresIn";
    pub const ISSUED_AT: &str = "auth_timestamp";
    pub const AUTHENTICATED: &str = "authenticated";
    pub const USER_EMAIL: &str = "userEmail";
    pub const TRAFFIC_STATE: &str = "traffic_report_state";

    pub const SESSION: [&str; 7] = [
        ACCESS_TOKEN,
        REFRESH_TOKEN,
        TOKEN_TYPE,
        EXPIRES_IN,
        ISSUED_AT,
        AUTHENTICATED,
        USER_EMAIL,
    ];
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Durable string key/value storage.
///
/// Batched writes are applied as one unit so readers never observe half of a
/// session record.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), StoreError>;

    fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError>;

    fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.set_many(&[(key, value)])
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.remove_many(&[key])
    }
}

/// JSON map on disk, readable only by the owner
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let entries = match fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Discarding corrupted store file");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(entries)?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, json)?;

        // Set permissions to 0600 (read/write for owner only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&tmp_path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&tmp_path, perms)?;
        }

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), StoreError> {
        let mut current = self.entries.write();
        let mut next = current.clone();
        for (key, value) in entries {
            next.insert((*key).to_string(), value.clone());
        }
        self.persist(&next)?;
        *current = next;
        Ok(())
    }

    fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        let mut current = self.entries.write();
        if !keys.iter().any(|k| current.contains_key(*k)) {
            return Ok(());
        }
        let mut next = current.clone();
        for key in keys {
            next.remove(*key);
        }
        self.persist(&next)?;
        *current = next;
        Ok(())
    }
}

/// Process-local store for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.entries.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }

    fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        for key in keys {
            self.entries.remove(*key);
        }
        Ok(())
    }
}

/// Persists the session fields into a [`KeyValueStore`]
#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    pub fn save(&self, session: &Session) -> Result<(), AuthError> {
        if session.access_token.is_empty() {
            return Err(AuthError::ProtocolError("Missing accessToken".into()));
        }
        if session.refresh_token.is_empty() {
            return Err(AuthError::ProtocolError("Missing refreshToken".into()));
        }

        let token_type = if session.token_type.is_empty() {
            DEFAULT_TOKEN_TYPE.to_string()
        } else {
            session.token_type.clone()
        };
        let expires_in = if is_valid_expires_in(session.expires_in_secs) {
            session.expires_in_secs
        } else {
            DEFAULT_EXPIRES_IN_SECS
        };

        let mut entries = vec![
            (keys::ACCESS_TOKEN, session.access_token.clone()),
            (keys::REFRESH_TOKEN, session.refresh_token.clone()),
            (keys::TOKEN_TYPE, token_type),
            (keys::EXPIRES_IN, expires_in.to_string()),
            (
                keys::ISSUED_AT,
                session.issued_at.timestamp_millis().to_string(),
            ),
            (keys::AUTHENTICATED, "true".to_string()),
        ];
        if let Some(email) = session.email() {
            entries.push((keys::USER_EMAIL, email.to_string()));
        }

        self.kv.set_many(&entries)?;
        tracing::debug!(expires_in, "Session stored");
        Ok(())
    }

    /// Reads the persisted session. Any missing or unreadable field means
    /// "no session"; the caller is expected to clear storage in that case.
    pub fn restore(&self) -> Option<Session> {
        match self.try_restore() {
            Ok(session) => session,
            Err(reason) => {
                tracing::warn!(%reason, "Stored session is unreadable");
                None
            }
        }
    }

    fn try_restore(&self) -> Result<Option<Session>, String> {
        let read = |key: &str| self.kv.get(key).map_err(|e| e.to_string());

        if read(keys::AUTHENTICATED)?.as_deref() != Some("true") {
            return Ok(None);
        }

        let access_token = read(keys::ACCESS_TOKEN)?.filter(|t| !t.is_empty());
        let refresh_token = read(keys::REFRESH_TOKEN)?.filter(|t| !t.is_empty());
        let (Some(access_token), Some(refresh_token)) = (access_token, refresh_token) else {
            return Ok(None);
        };

        let issued_at = read(keys::ISSUED_AT)?
            .ok_or("missing issue timestamp")?
            .parse::<i64>()
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or("malformed issue timestamp")?;
        let expires_in_secs = read(keys::EXPIRES_IN)?
            .ok_or("missing expiry")?
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or("malformed expiry")?;
        let expires_in_secs = if is_valid_expires_in(expires_in_secs) {
            expires_in_secs
        } else {
            tracing::warn!(expires_in_secs, "Stored expiry out of range, using default");
            DEFAULT_EXPIRES_IN_SECS
        };
        let token_type = read(keys::TOKEN_TYPE)?
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string());

        Ok(Some(Session {
            access_token,
            refresh_token,
            token_type,
            issued_at,
            expires_in_secs,
            user: Some(User {
                email: read(keys::USER_EMAIL)?,
                login_time: issued_at,
                app_id: None,
            }),
        }))
    }

    pub fn clear(&self) -> Result<(), AuthError> {
        self.kv.remove_many(&keys::SESSION)?;
        tracing::debug!("Session storage cleared");
        Ok(())
    }
}
