// Credential state shared by every authenticated component.
//
// `TokenStore` is the only mutable owner of the current `Credential`. The
// refresher thread replaces it whole; request paths take a cloned snapshot
// and never write back.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Default access-token lifetime used when nothing else is configured.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 2000;

/// OAuth credential for one registered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub client_id: String,
    pub device_code: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    pub issued_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl Credential {
    /// A credential that only knows its client id, before any token exchange.
    pub fn unissued(client_id: &str, ttl_seconds: u64) -> Self {
        Self {
            client_id: client_id.to_string(),
            device_code: None,
            access_token: String::new(),
            refresh_token: String::new(),
            issued_at: Utc::now(),
            ttl_seconds,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.ttl_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|ttl| self.issued_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// Returns a copy carrying a freshly issued token pair.
    pub fn renewed(&self, access_token: String, refresh_token: String) -> Self {
        Self {
            access_token,
            refresh_token,
            issued_at: Utc::now(),
            ..self.clone()
        }
    }

    fn to_persisted(&self) -> PersistedCredential {
        PersistedCredential {
            client_id: self.client_id.clone(),
            device_code: self.device_code.clone(),
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
        }
    }
}

#[derive(Debug)]
struct Slot {
    credential: Credential,
    stale: bool,
}

/// Thread-safe holder of the current [`Credential`].
///
/// Cloning the store clones the handle, not the credential.
#[derive(Debug, Clone)]
pub struct TokenStore {
    inner: Arc<Mutex<Slot>>,
}

impl TokenStore {
    pub fn new(credential: Credential) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slot {
                credential,
                stale: false,
            })),
        }
    }

    // A poisoned lock still holds a whole credential: `set` swaps the record
    // in a single assignment, so recovering the guard is sound.
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of the current credential.
    pub fn get(&self) -> Credential {
        self.lock().credential.clone()
    }

    /// Replace the credential whole and clear the stale flag.
    pub fn set(&self, credential: Credential) {
        let mut slot = self.lock();
        slot.credential = credential;
        slot.stale = false;
    }

    /// Flag the credential as no longer being renewed.
    pub fn mark_stale(&self) {
        self.lock().stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.lock().stale
    }
}

/// On-disk shape of the credential file.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedCredential {
    client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_code: Option<String>,
    #[serde(default)]
    access_token: String,
    refresh_token: String,
}

/// Default location of the credential file in the user's home directory.
pub fn default_auth_file() -> PathBuf {
    let dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    dir.join(".anaplan_auth.json")
}

/// Overwrite the credential file with the current token pair.
///
/// The device code is only written when the credential still carries one,
/// which is the case right after registration.
pub fn persist_credential(path: &Path, credential: &Credential) -> Result<()> {
    let json = serde_json::to_string_pretty(&credential.to_persisted())
        .context("Serializing credential")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write credential file {}", path.display()))?;
    Ok(())
}

/// Load a previously persisted credential.
///
/// The stored tokens are considered issued now; callers are expected to
/// refresh right away anyway.
pub fn load_credential(path: &Path, ttl_seconds: u64) -> Result<Credential> {
    let data = std::fs::read_to_string(path).with_context(|| {
        format!(
            "Unable to open the credential file {}. Register the device first with --register",
            path.display()
        )
    })?;
    let stored: PersistedCredential = serde_json::from_str(&data)
        .with_context(|| format!("Malformed credential file {}", path.display()))?;
    tracing::info!(path = %path.display(), "read in tokens successfully");
    Ok(Credential {
        client_id: stored.client_id,
        device_code: stored.device_code,
        access_token: stored.access_token,
        refresh_token: stored.refresh_token,
        issued_at: Utc::now(),
        ttl_seconds,
    })
}
