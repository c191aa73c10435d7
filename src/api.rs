//! Remote mail API collaborator interface
//!
//! The bridge core never speaks the remote wire format itself. It depends on
//! an [`ApiManager`] that produces authorized [`ApiClient`]s, and on the
//! sequential per-account event stream those clients expose. Message bodies
//! arrive already decrypted.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::errors::AppResult;

/// How the account's key material is protected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordMode {
    /// The login password also unlocks the keys
    One,
    /// A separate mailbox password unlocks the keys
    Two,
}

/// Authorization returned by a successful login or refresh
#[derive(Debug, Clone)]
pub struct Auth {
    pub uid: String,
    pub user_id: String,
    pub refresh_token: SecretString,
    pub two_factor_required: bool,
    pub password_mode: PasswordMode,
}

/// Result of a fresh login
pub struct LoginSession {
    pub client: Arc<dyn ApiClient>,
    pub auth: Auth,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiUser {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub used_space: u64,
    pub max_space: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiAddress {
    pub id: String,
    pub email: String,
    pub enabled: bool,
    /// Display order; the lowest enabled address is the primary one
    pub order: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    System,
    Folder,
    Label,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiLabel {
    pub id: String,
    pub name: String,
    pub kind: LabelKind,
}

/// Message metadata without the body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub id: String,
    pub address_id: String,
    pub label_ids: Vec<String>,
    pub subject: String,
    pub unread: bool,
    pub starred: bool,
}

/// Decrypted message ready for a local store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullMessage {
    pub metadata: MessageMetadata,
    /// RFC 5322 literal
    pub literal: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressEvent {
    Created(ApiAddress),
    Updated(ApiAddress),
    Deleted { id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelEvent {
    Created(ApiLabel),
    Updated(ApiLabel),
    Deleted { id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEvent {
    Created(MessageMetadata),
    Updated(MessageMetadata),
    Deleted { id: String },
}

/// One entry of an account's event stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiEvent {
    pub event_id: String,
    /// The server asks for a full resynchronisation
    pub refresh: bool,
    pub user: Option<ApiUser>,
    pub addresses: Vec<AddressEvent>,
    pub labels: Vec<LabelEvent>,
    pub messages: Vec<MessageEvent>,
    pub used_space: Option<u64>,
}

impl fmt::Display for ApiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "event {} (refresh={}, user={}, addresses={}, labels={}, messages={})",
            self.event_id,
            self.refresh,
            self.user.is_some(),
            self.addresses.len(),
            self.labels.len(),
            self.messages.len()
        )
    }
}

/// Entry point to the remote API
#[async_trait]
pub trait ApiManager: Send + Sync {
    /// Authenticate with username and password
    async fn login(&self, username: &str, password: &SecretString) -> AppResult<LoginSession>;

    /// Rebuild an authorized client from persisted auth
    async fn resume(
        &self,
        auth_uid: &str,
        refresh_token: &SecretString,
    ) -> AppResult<(Arc<dyn ApiClient>, Auth)>;

    /// Lightweight reachability check
    async fn ping(&self) -> AppResult<()>;
}

/// Authorized per-account client
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn auth_2fa(&self, code: &str) -> AppResult<()>;

    /// Derive the key passphrase from the mailbox password
    async fn derive_key_pass(&self, mailbox_password: &SecretString) -> AppResult<SecretString>;

    /// Unlock the account keys with a derived passphrase
    async fn unlock(&self, key_pass: &SecretString) -> AppResult<()>;

    async fn get_user(&self) -> AppResult<ApiUser>;

    async fn get_addresses(&self) -> AppResult<Vec<ApiAddress>>;

    async fn get_labels(&self) -> AppResult<Vec<ApiLabel>>;

    async fn get_latest_event_id(&self) -> AppResult<String>;

    /// Every event after `since`, oldest first
    async fn get_events(&self, since: &str) -> AppResult<Vec<ApiEvent>>;

    async fn get_message_count(&self) -> AppResult<u64>;

    /// One page of metadata ordered by ID, starting after `after`
    async fn get_message_metadata(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> AppResult<Vec<MessageMetadata>>;

    async fn get_full_message(&self, message_id: &str) -> AppResult<FullMessage>;

    /// Revoke this client's authorization on the server
    async fn revoke(&self) -> AppResult<()>;
}

/// Enabled addresses sorted by display order
pub fn enabled_addresses(addresses: &[ApiAddress]) -> Vec<ApiAddress> {
    let mut enabled: Vec<ApiAddress> = addresses.iter().filter(|a| a.enabled).cloned().collect();
    enabled.sort_by_key(|a| a.order);
    enabled
}
