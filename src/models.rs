//! Serialisable views handed to front-ends
//!
//! Internal state is never exposed directly; these DTOs are the shapes the
//! facade returns and the CLI prints.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::user::UserState;
use crate::vault::{AddressMode, UpdateChannel};

/// Account summary for front-ends
#[derive(Debug, Clone, Serialize)]
pub struct UserInfo {
    pub user_id: String,
    pub username: String,
    pub addresses: Vec<String>,
    pub address_mode: AddressMode,
    pub state: UserState,
    /// Password IMAP/SMTP clients use to log in locally
    pub bridge_password: String,
    pub used_space: u64,
    pub max_space: u64,
    /// Set while a bad event awaits feedback
    pub bad_event: Option<String>,
}

/// Consistency of one account's local stores against the remote
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConsistency {
    pub user_id: String,
    pub remote_count: usize,
    pub local_count: usize,
    /// Remote messages absent from every local store
    pub missing: Vec<String>,
    /// Local messages the remote no longer has
    pub unexpected: Vec<String>,
    /// Messages whose read/starred state differs
    pub flag_mismatches: Vec<String>,
}

impl UserConsistency {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.flag_mismatches.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// RFC 3339 UTC timestamp of the check
    pub checked_at: String,
    pub users: Vec<UserConsistency>,
}

impl ConsistencyReport {
    pub fn new(users: Vec<UserConsistency>) -> Self {
        Self {
            checked_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            users,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.users.iter().all(UserConsistency::is_consistent)
    }
}

/// Daily anonymous usage summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub version: String,
    pub users: usize,
    pub connected_users: usize,
    pub split_mode_users: usize,
    pub custom_imap_port: bool,
    pub custom_smtp_port: bool,
    pub imap_ssl: bool,
    pub smtp_ssl: bool,
    pub auto_update: bool,
    pub update_channel: UpdateChannel,
}
