//! File-backed settings and credential store
//!
//! The vault persists the account list, per-account credentials and sync
//! checkpoints, and the user-facing settings (ports, TLS, data directory).
//! The file itself is treated as already protected by the host; this module
//! only guarantees atomic replacement on every write.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::NaiveDate;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};

pub const DEFAULT_IMAP_PORT: u16 = 1143;
pub const DEFAULT_SMTP_PORT: u16 = 1025;

/// How an account's addresses map onto local mailbox stores
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressMode {
    /// Every address shares one store
    #[default]
    Combined,
    /// Each address gets its own store
    Split,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateChannel {
    #[default]
    Stable,
    Early,
}

/// Credential string that never shows up in `Debug` output
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sensitive(String);

impl Sensitive {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_secret(&self) -> SecretString {
        SecretString::new(self.0.clone().into())
    }
}

impl fmt::Debug for Sensitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// User-facing settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub imap_port: u16,
    pub smtp_port: u16,
    pub imap_ssl: bool,
    pub smtp_ssl: bool,
    /// Root of the on-disk mailbox stores
    pub data_dir: PathBuf,
    pub proxy_allowed: bool,
    pub auto_update: bool,
    pub update_channel: UpdateChannel,
    /// Version that last ran against this vault
    pub last_version: String,
    pub telemetry_disabled: bool,
    /// UTC day the last heartbeat was delivered
    pub last_heartbeat: Option<NaiveDate>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            imap_port: DEFAULT_IMAP_PORT,
            smtp_port: DEFAULT_SMTP_PORT,
            imap_ssl: false,
            smtp_ssl: false,
            data_dir: PathBuf::from("stores"),
            proxy_allowed: false,
            auto_update: true,
            update_channel: UpdateChannel::Stable,
            last_version: String::new(),
            telemetry_disabled: false,
            last_heartbeat: None,
        }
    }
}

/// Progress of the initial/full synchronisation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncStatus {
    pub has_labels: bool,
    pub has_messages: bool,
    /// Messages written to the stores by the full sync
    pub message_count: u64,
    /// Last message ID written during a paged sync (resume point)
    pub last_message_id: Option<String>,
    pub failed_message_ids: BTreeSet<String>,
}

impl SyncStatus {
    pub fn is_complete(&self) -> bool {
        self.has_labels && self.has_messages
    }
}

/// Outstanding bad-event marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadEventMarker {
    pub event_id: String,
    pub error: String,
}

/// Persisted account record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserRecord {
    pub user_id: String,
    pub username: String,
    pub primary_email: String,
    pub address_mode: AddressMode,
    pub auth_uid: String,
    pub auth_ref: Sensitive,
    pub key_pass: Sensitive,
    /// Local password IMAP/SMTP clients use to log in
    pub bridge_pass: Sensitive,
    /// Store ID per binding (address ID)
    pub store_ids: BTreeMap<String, String>,
    pub sync_status: SyncStatus,
    pub event_id: String,
    pub bad_event: Option<BadEventMarker>,
}

impl UserRecord {
    /// Whether the record still holds remote authorization
    pub fn has_auth(&self) -> bool {
        !self.auth_uid.is_empty() && !self.auth_ref.is_empty()
    }

    pub fn clear_auth(&mut self) {
        self.auth_uid.clear();
        self.auth_ref = Sensitive::default();
        self.key_pass = Sensitive::default();
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct VaultData {
    settings: Settings,
    /// Insertion order is the account order shown to users
    users: Vec<UserRecord>,
}

/// Persistent vault
#[derive(Debug)]
pub struct Vault {
    path: PathBuf,
    data: Mutex<VaultData>,
}

impl Vault {
    /// Open the vault at `path`, creating it when absent
    ///
    /// A relative `data_dir` in a fresh vault is resolved against the
    /// vault's directory.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read or created and `Config` if it
    /// contains malformed JSON.
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let data = if path.exists() {
            let raw = fs::read(&path)?;
            serde_json::from_slice::<VaultData>(&raw).map_err(|e| {
                AppError::Config(format!("vault {} is malformed: {e}", path.display()))
            })?
        } else {
            let mut data = VaultData::default();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
                data.settings.data_dir = parent.join(&data.settings.data_dir);
            }
            write_atomic(&path, &data)?;
            info!(path = %path.display(), "created new vault");
            data
        };

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, VaultData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `update` to a copy of the data and persist it
    ///
    /// The in-memory state only changes when the write succeeds.
    fn modify<T>(&self, update: impl FnOnce(&mut VaultData) -> AppResult<T>) -> AppResult<T> {
        let mut data = self.lock();
        let mut next = data.clone();
        let out = update(&mut next)?;
        write_atomic(&self.path, &next)?;
        *data = next;
        Ok(out)
    }

    pub fn settings(&self) -> Settings {
        self.lock().settings.clone()
    }

    /// Mutate settings and persist
    pub fn update_settings(&self, update: impl FnOnce(&mut Settings)) -> AppResult<()> {
        self.modify(|data| {
            update(&mut data.settings);
            Ok(())
        })
    }

    pub fn set_imap_port(&self, port: u16) -> AppResult<()> {
        self.update_settings(|s| s.imap_port = port)
    }

    pub fn set_smtp_port(&self, port: u16) -> AppResult<()> {
        self.update_settings(|s| s.smtp_port = port)
    }

    pub fn set_imap_ssl(&self, enabled: bool) -> AppResult<()> {
        self.update_settings(|s| s.imap_ssl = enabled)
    }

    pub fn set_smtp_ssl(&self, enabled: bool) -> AppResult<()> {
        self.update_settings(|s| s.smtp_ssl = enabled)
    }

    pub fn set_data_dir(&self, dir: &Path) -> AppResult<()> {
        self.update_settings(|s| s.data_dir = dir.to_path_buf())
    }

    /// Account IDs in insertion order
    pub fn get_user_ids(&self) -> Vec<String> {
        self.lock().users.iter().map(|u| u.user_id.clone()).collect()
    }

    /// # Errors
    ///
    /// Returns `NotFound` if the account is not in the vault.
    pub fn get_user(&self, user_id: &str) -> AppResult<UserRecord> {
        self.lock()
            .users
            .iter()
            .find(|u| u.user_id == user_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("user '{user_id}' is not in the vault")))
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.lock().users.iter().any(|u| u.user_id == user_id)
    }

    /// Append a new account record
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the account ID already exists.
    pub fn add_user(&self, record: UserRecord) -> AppResult<()> {
        self.modify(|data| {
            if data.users.iter().any(|u| u.user_id == record.user_id) {
                return Err(AppError::Conflict(format!(
                    "user '{}' already exists in the vault",
                    record.user_id
                )));
            }
            debug!(user_id = %record.user_id, "adding vault user");
            data.users.push(record);
            Ok(())
        })
    }

    /// Mutate one account record and persist
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account is not in the vault.
    pub fn update_user<T>(
        &self,
        user_id: &str,
        update: impl FnOnce(&mut UserRecord) -> T,
    ) -> AppResult<T> {
        self.modify(|data| {
            let record = data
                .users
                .iter_mut()
                .find(|u| u.user_id == user_id)
                .ok_or_else(|| {
                    AppError::NotFound(format!("user '{user_id}' is not in the vault"))
                })?;
            Ok(update(record))
        })
    }

    /// [`Vault::update_user`] with the file write on the blocking pool
    ///
    /// For checkpoints taken from async tasks.
    pub async fn update_user_async<T: Send + 'static>(
        self: &Arc<Self>,
        user_id: &str,
        update: impl FnOnce(&mut UserRecord) -> T + Send + 'static,
    ) -> AppResult<T> {
        let vault = Arc::clone(self);
        let user_id = user_id.to_owned();
        tokio::task::spawn_blocking(move || vault.update_user(&user_id, update))
            .await
            .map_err(|e| AppError::Internal(format!("vault write task failed: {e}")))?
    }

    /// Remove an account record
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account is not in the vault.
    pub fn delete_user(&self, user_id: &str) -> AppResult<()> {
        self.modify(|data| {
            let before = data.users.len();
            data.users.retain(|u| u.user_id != user_id);
            if data.users.len() == before {
                return Err(AppError::NotFound(format!(
                    "user '{user_id}' is not in the vault"
                )));
            }
            Ok(())
        })
    }
}

/// Write JSON next to `path` and rename it into place
fn write_atomic(path: &Path, data: &VaultData) -> AppResult<()> {
    let encoded = serde_json::to_vec_pretty(data)
        .map_err(|e| AppError::Internal(format!("vault serialization failure: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, encoded)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
