//! In-memory fakes for the remote API, the protocol engines and the outer
//! services, plus a harness wiring them together.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{
    AddressEvent, ApiAddress, ApiClient, ApiEvent, ApiLabel, ApiManager, ApiUser, Auth,
    FullMessage, LabelKind, LoginSession, MessageEvent, MessageMetadata, PasswordMode,
};
use crate::bridge::{Bridge, BridgeDeps, LoginPrompt};
use crate::bus::{EventBus, Subscription};
use crate::config::BridgeConfig;
use crate::engine::{
    Connector, ConnectorUpdate, ImapEngine, ImapEngineFactory, LocalListener, LocalStream,
    SmtpAccounts, SmtpEngine, SmtpEngineFactory, StoreStats,
};
use crate::errors::{AppError, AppResult};
use crate::events::{Event, EventKind};
use crate::heartbeat::TelemetrySink;
use crate::imap::INTERNAL_ID_HEADER;
use crate::models::HeartbeatReport;
use crate::monitor::ConnectionMonitor;
use crate::server_manager::ManagerDeps;
use crate::updates::{Updater, VersionInfo};
use crate::vault::{UpdateChannel, Vault};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn secret(value: &str) -> SecretString {
    SecretString::new(value.to_owned().into())
}

pub const INBOX: &str = "0";
pub const ALL_MAIL_LABEL: &str = "5";

#[derive(Clone)]
struct Account {
    user_id: String,
    username: String,
    password: String,
    mailbox_password: Option<String>,
    two_factor: Option<String>,
    addresses: Vec<ApiAddress>,
    labels: Vec<ApiLabel>,
    messages: BTreeMap<String, MessageMetadata>,
    events: Vec<ApiEvent>,
    used_space: u64,
}

impl Account {
    fn latest_event_id(&self) -> String {
        format!("ev-{}", self.events.len())
    }
}

struct RemoteSession {
    user_id: String,
    token: String,
    revoked: bool,
}

#[derive(Default)]
struct ApiState {
    unreachable: bool,
    pings: usize,
    accounts: BTreeMap<String, Account>,
    sessions: HashMap<String, RemoteSession>,
    next_session: u64,
    /// Message ID to (remaining failures, status)
    message_failures: HashMap<String, (u32, u16)>,
    revoke_fails: bool,
    unlock_fails: bool,
    /// Label listings left to fail with a server error
    label_failures: u32,
    revokes: usize,
}

impl ApiState {
    fn reachable(&self) -> AppResult<()> {
        if self.unreachable {
            return Err(AppError::Network("remote API unreachable".to_owned()));
        }
        Ok(())
    }

    fn open_session(&mut self, user_id: &str) -> (String, String) {
        self.next_session += 1;
        let uid = format!("uid-{}", self.next_session);
        let token = format!("token-{}", self.next_session);
        self.sessions.insert(
            uid.clone(),
            RemoteSession {
                user_id: user_id.to_owned(),
                token: token.clone(),
                revoked: false,
            },
        );
        (uid, token)
    }

    fn account_mut(&mut self, user_id: &str) -> &mut Account {
        self.accounts
            .get_mut(user_id)
            .unwrap_or_else(|| panic!("unknown fake account {user_id}"))
    }
}

/// Scriptable remote API
pub struct FakeApi {
    state: Arc<Mutex<ApiState>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(ApiState::default())),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).unreachable = !reachable;
    }

    pub fn ping_count(&self) -> usize {
        lock(&self.state).pings
    }

    /// Register an account with one address and returns its ID
    pub fn add_account(&self, username: &str, password: &str) -> String {
        let user_id = format!("user-{username}");
        let account = Account {
            user_id: user_id.clone(),
            username: username.to_owned(),
            password: password.to_owned(),
            mailbox_password: None,
            two_factor: None,
            addresses: vec![ApiAddress {
                id: format!("addr-{username}-1"),
                email: format!("{username}@example.com"),
                enabled: true,
                order: 1,
            }],
            labels: vec![
                ApiLabel {
                    id: INBOX.to_owned(),
                    name: "Inbox".to_owned(),
                    kind: LabelKind::System,
                },
                ApiLabel {
                    id: ALL_MAIL_LABEL.to_owned(),
                    name: "All Mail".to_owned(),
                    kind: LabelKind::System,
                },
            ],
            messages: BTreeMap::new(),
            events: Vec::new(),
            used_space: 0,
        };
        lock(&self.state).accounts.insert(user_id.clone(), account);
        user_id
    }

    pub fn require_two_factor(&self, user_id: &str, code: &str) {
        lock(&self.state).account_mut(user_id).two_factor = Some(code.to_owned());
    }

    pub fn set_mailbox_password(&self, user_id: &str, password: &str) {
        lock(&self.state).account_mut(user_id).mailbox_password = Some(password.to_owned());
    }

    /// Add an address without an event (before login)
    pub fn add_address(&self, user_id: &str, address_id: &str, email: &str) {
        let mut state = lock(&self.state);
        let account = state.account_mut(user_id);
        let order = account.addresses.len() as u32 + 1;
        account.addresses.push(ApiAddress {
            id: address_id.to_owned(),
            email: email.to_owned(),
            enabled: true,
            order,
        });
    }

    fn metadata(address_id: &str, message_id: &str) -> MessageMetadata {
        MessageMetadata {
            id: message_id.to_owned(),
            address_id: address_id.to_owned(),
            label_ids: vec![INBOX.to_owned(), ALL_MAIL_LABEL.to_owned()],
            subject: format!("subject {message_id}"),
            unread: true,
            starred: false,
        }
    }

    /// Add a message without an event (before login)
    pub fn add_message(&self, user_id: &str, address_id: &str, message_id: &str) {
        lock(&self.state)
            .account_mut(user_id)
            .messages
            .insert(message_id.to_owned(), Self::metadata(address_id, message_id));
    }

    /// Append an event to the account's stream, returning its ID
    pub fn push_event(&self, user_id: &str, mut event: ApiEvent) -> String {
        let mut state = lock(&self.state);
        let account = state.account_mut(user_id);
        for message in &event.messages {
            match message {
                MessageEvent::Created(m) | MessageEvent::Updated(m) => {
                    account.messages.insert(m.id.clone(), m.clone());
                }
                MessageEvent::Deleted { id } => {
                    account.messages.remove(id);
                }
            }
        }
        for address in &event.addresses {
            match address {
                AddressEvent::Created(a) | AddressEvent::Updated(a) => {
                    account.addresses.retain(|existing| existing.id != a.id);
                    account.addresses.push(a.clone());
                }
                AddressEvent::Deleted { id } => account.addresses.retain(|a| &a.id != id),
            }
        }
        event.event_id = format!("ev-{}", account.events.len() + 1);
        account.events.push(event.clone());
        event.event_id
    }

    /// Deliver a new message through the event stream
    pub fn push_message(&self, user_id: &str, address_id: &str, message_id: &str) -> String {
        self.push_event(
            user_id,
            ApiEvent {
                messages: vec![MessageEvent::Created(Self::metadata(address_id, message_id))],
                ..ApiEvent::default()
            },
        )
    }

    pub fn push_address(&self, user_id: &str, address_id: &str, email: &str) -> String {
        let order = lock(&self.state).account_mut(user_id).addresses.len() as u32 + 1;
        self.push_event(
            user_id,
            ApiEvent {
                addresses: vec![AddressEvent::Created(ApiAddress {
                    id: address_id.to_owned(),
                    email: email.to_owned(),
                    enabled: true,
                    order,
                })],
                ..ApiEvent::default()
            },
        )
    }

    /// Make the next `times` body fetches of `message_id` fail with `status`
    pub fn fail_full_message(&self, message_id: &str, times: u32, status: u16) {
        lock(&self.state)
            .message_failures
            .insert(message_id.to_owned(), (times, status));
    }

    pub fn set_revoke_fails(&self, fails: bool) {
        lock(&self.state).revoke_fails = fails;
    }

    pub fn set_unlock_fails(&self, fails: bool) {
        lock(&self.state).unlock_fails = fails;
    }

    /// Fail the next `count` label listings with a 500
    pub fn fail_labels(&self, count: u32) {
        lock(&self.state).label_failures = count;
    }

    /// Invalidate every session of the account server-side
    pub fn revoke_sessions(&self, user_id: &str) {
        for session in lock(&self.state).sessions.values_mut() {
            if session.user_id == user_id {
                session.revoked = true;
            }
        }
    }

    /// Successful client-initiated revocations
    pub fn revoke_count(&self) -> usize {
        lock(&self.state).revokes
    }

    pub fn remote_message_ids(&self, user_id: &str) -> BTreeSet<String> {
        lock(&self.state)
            .account_mut(user_id)
            .messages
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ApiManager for FakeApi {
    async fn login(&self, username: &str, password: &SecretString) -> AppResult<LoginSession> {
        let mut state = lock(&self.state);
        state.reachable()?;
        let account = state
            .accounts
            .values()
            .find(|a| a.username == username && a.password == password.expose_secret())
            .cloned()
            .ok_or_else(|| AppError::AuthFailed("invalid username or password".to_owned()))?;
        let (uid, token) = state.open_session(&account.user_id);
        let client = Arc::new(FakeClient {
            state: Arc::clone(&self.state),
            uid: uid.clone(),
        });
        Ok(LoginSession {
            client,
            auth: Auth {
                uid,
                user_id: account.user_id,
                refresh_token: secret(&token),
                two_factor_required: account.two_factor.is_some(),
                password_mode: if account.mailbox_password.is_some() {
                    PasswordMode::Two
                } else {
                    PasswordMode::One
                },
            },
        })
    }

    async fn resume(
        &self,
        auth_uid: &str,
        refresh_token: &SecretString,
    ) -> AppResult<(Arc<dyn ApiClient>, Auth)> {
        let state = lock(&self.state);
        state.reachable()?;
        let session = state
            .sessions
            .get(auth_uid)
            .filter(|s| !s.revoked && s.token == refresh_token.expose_secret())
            .ok_or_else(|| AppError::api(401, "invalid refresh token"))?;
        let client: Arc<dyn ApiClient> = Arc::new(FakeClient {
            state: Arc::clone(&self.state),
            uid: auth_uid.to_owned(),
        });
        let auth = Auth {
            uid: auth_uid.to_owned(),
            user_id: session.user_id.clone(),
            refresh_token: secret(&session.token),
            two_factor_required: false,
            password_mode: PasswordMode::One,
        };
        Ok((client, auth))
    }

    async fn ping(&self) -> AppResult<()> {
        let mut state = lock(&self.state);
        state.pings += 1;
        state.reachable()
    }
}

struct FakeClient {
    state: Arc<Mutex<ApiState>>,
    uid: String,
}

impl FakeClient {
    /// Run `f` against the session's account after the usual checks
    fn call<T>(&self, f: impl FnOnce(&mut ApiState, &str) -> AppResult<T>) -> AppResult<T> {
        let mut state = lock(&self.state);
        state.reachable()?;
        let user_id = match state.sessions.get(&self.uid) {
            Some(session) if !session.revoked => session.user_id.clone(),
            _ => return Err(AppError::api(401, "session revoked")),
        };
        f(&mut state, &user_id)
    }
}

#[async_trait]
impl ApiClient for FakeClient {
    async fn auth_2fa(&self, code: &str) -> AppResult<()> {
        self.call(|state, user_id| match &state.account_mut(user_id).two_factor {
            Some(expected) if expected != code => {
                Err(AppError::AuthFailed("wrong second factor".to_owned()))
            }
            _ => Ok(()),
        })
    }

    async fn derive_key_pass(&self, mailbox_password: &SecretString) -> AppResult<SecretString> {
        self.call(|_, _| Ok(secret(&format!("key:{}", mailbox_password.expose_secret()))))
    }

    async fn unlock(&self, key_pass: &SecretString) -> AppResult<()> {
        self.call(|state, user_id| {
            if state.unlock_fails {
                return Err(AppError::AuthFailed("keys cannot be unlocked".to_owned()));
            }
            let account = state.account_mut(user_id);
            let mailbox = account
                .mailbox_password
                .clone()
                .unwrap_or_else(|| account.password.clone());
            if key_pass.expose_secret() == format!("key:{mailbox}") {
                Ok(())
            } else {
                Err(AppError::AuthFailed("wrong mailbox password".to_owned()))
            }
        })
    }

    async fn get_user(&self) -> AppResult<ApiUser> {
        self.call(|state, user_id| {
            let account = state.account_mut(user_id);
            Ok(ApiUser {
                id: account.user_id.clone(),
                name: account.username.clone(),
                display_name: account.username.clone(),
                used_space: account.used_space,
                max_space: 1 << 30,
            })
        })
    }

    async fn get_addresses(&self) -> AppResult<Vec<ApiAddress>> {
        self.call(|state, user_id| Ok(state.account_mut(user_id).addresses.clone()))
    }

    async fn get_labels(&self) -> AppResult<Vec<ApiLabel>> {
        self.call(|state, user_id| {
            if state.label_failures > 0 {
                state.label_failures -= 1;
                return Err(AppError::api(500, "labels unavailable"));
            }
            Ok(state.account_mut(user_id).labels.clone())
        })
    }

    async fn get_latest_event_id(&self) -> AppResult<String> {
        self.call(|state, user_id| Ok(state.account_mut(user_id).latest_event_id()))
    }

    async fn get_events(&self, since: &str) -> AppResult<Vec<ApiEvent>> {
        self.call(|state, user_id| {
            let events = &state.account_mut(user_id).events;
            let seen = since
                .strip_prefix("ev-")
                .and_then(|n| n.parse::<usize>().ok())
                .unwrap_or(0)
                .min(events.len());
            Ok(events[seen..].to_vec())
        })
    }

    async fn get_message_count(&self) -> AppResult<u64> {
        self.call(|state, user_id| Ok(state.account_mut(user_id).messages.len() as u64))
    }

    async fn get_message_metadata(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> AppResult<Vec<MessageMetadata>> {
        self.call(|state, user_id| {
            Ok(state
                .account_mut(user_id)
                .messages
                .values()
                .filter(|m| after.is_none_or(|a| m.id.as_str() > a))
                .take(limit)
                .cloned()
                .collect())
        })
    }

    async fn get_full_message(&self, message_id: &str) -> AppResult<FullMessage> {
        self.call(|state, user_id| {
            if let Some((remaining, status)) = state.message_failures.get_mut(message_id)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(AppError::api(*status, "message cannot be decrypted"));
            }
            let metadata = state
                .account_mut(user_id)
                .messages
                .get(message_id)
                .cloned()
                .ok_or_else(|| AppError::api(422, format!("message {message_id} is gone")))?;
            let literal = format!(
                "{INTERNAL_ID_HEADER}: {}\r\nSubject: {}\r\n\r\nbody\r\n",
                metadata.id, metadata.subject
            );
            Ok(FullMessage {
                metadata,
                literal: literal.into_bytes(),
            })
        })
    }

    async fn revoke(&self) -> AppResult<()> {
        let mut state = lock(&self.state);
        state.reachable()?;
        if state.revoke_fails {
            return Err(AppError::Network("revoke request failed".to_owned()));
        }
        if let Some(session) = state.sessions.get_mut(&self.uid) {
            session.revoked = true;
        }
        state.revokes += 1;
        Ok(())
    }
}

/// One store held by the fake IMAP engine
#[derive(Debug, Clone, Default)]
pub struct FakeStore {
    pub user_id: String,
    pub binding_id: String,
    pub addresses: Vec<String>,
    pub mailboxes: BTreeSet<String>,
    pub messages: BTreeMap<String, MessageMetadata>,
    pub attached: bool,
}

impl FakeStore {
    fn apply(&mut self, update: ConnectorUpdate) {
        match update {
            ConnectorUpdate::MailboxCreated(label) | ConnectorUpdate::MailboxUpdated(label) => {
                self.mailboxes.insert(label.id);
            }
            ConnectorUpdate::MailboxDeleted { id } => {
                self.mailboxes.remove(&id);
            }
            ConnectorUpdate::MessagesCreated(messages) => {
                for message in messages {
                    self.messages
                        .insert(message.metadata.id.clone(), message.metadata);
                }
            }
            ConnectorUpdate::MessageUpdated(metadata) => {
                if let Some(existing) = self.messages.get_mut(&metadata.id) {
                    *existing = metadata;
                }
            }
            ConnectorUpdate::MessageDeleted { id } => {
                self.messages.remove(&id);
            }
            ConnectorUpdate::AddressesChanged(addresses) => self.addresses = addresses,
        }
    }
}

#[derive(Default)]
struct ImapState {
    next_store: u64,
    created: usize,
    stores: BTreeMap<String, FakeStore>,
    data_dirs: Vec<PathBuf>,
    /// Builds left to fail before they succeed again
    failing_builds: usize,
}

/// IMAP engine factory whose stores outlive engine rebuilds
#[derive(Default)]
pub struct FakeImap {
    state: Arc<Mutex<ImapState>>,
}

impl FakeImap {
    pub fn created_count(&self) -> usize {
        lock(&self.state).created
    }

    pub fn store_exists(&self, store_id: &str) -> bool {
        lock(&self.state).stores.contains_key(store_id)
    }

    pub fn data_dirs(&self) -> Vec<PathBuf> {
        lock(&self.state).data_dirs.clone()
    }

    /// Drop a message from every local store behind the sync's back
    pub fn forget_message(&self, message_id: &str) {
        for store in lock(&self.state).stores.values_mut() {
            store.messages.remove(message_id);
        }
    }

    /// Change a message's local metadata behind the sync's back
    pub fn edit_message(&self, message_id: &str, edit: impl Fn(&mut MessageMetadata)) {
        for store in lock(&self.state).stores.values_mut() {
            if let Some(message) = store.messages.get_mut(message_id) {
                edit(message);
            }
        }
    }

    /// Make the next `count` engine builds fail
    pub fn fail_builds(&self, count: usize) {
        lock(&self.state).failing_builds = count;
    }

    pub fn store(&self, store_id: &str) -> Option<FakeStore> {
        lock(&self.state).stores.get(store_id).cloned()
    }

    /// Message IDs per binding across the account's existing stores
    pub fn messages_by_binding(&self, user_id: &str) -> BTreeMap<String, BTreeSet<String>> {
        lock(&self.state)
            .stores
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| (s.binding_id.clone(), s.messages.keys().cloned().collect()))
            .collect()
    }

    pub fn message_ids(&self, user_id: &str) -> BTreeSet<String> {
        self.messages_by_binding(user_id)
            .into_values()
            .flatten()
            .collect()
    }
}

impl ImapEngineFactory for FakeImap {
    fn build(&self, data_dir: &Path) -> AppResult<Arc<dyn ImapEngine>> {
        {
            let mut state = lock(&self.state);
            if state.failing_builds > 0 {
                state.failing_builds -= 1;
                return Err(AppError::Store(format!(
                    "cannot open {}",
                    data_dir.display()
                )));
            }
            state.data_dirs.push(data_dir.to_path_buf());
        }
        Ok(Arc::new(FakeImapEngine {
            state: Arc::clone(&self.state),
            drains: Mutex::new(HashMap::new()),
        }))
    }
}

struct FakeImapEngine {
    state: Arc<Mutex<ImapState>>,
    /// Store ID to the task copying connector updates into it
    drains: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl FakeImapEngine {
    fn drain(&self, store_id: &str, connector: &Connector) {
        let mut rx = connector.subscribe();
        let state = Arc::clone(&self.state);
        let id = store_id.to_owned();
        let task = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let mut state = lock(&state);
                let Some(store) = state.stores.get_mut(&id) else {
                    break;
                };
                store.apply(update);
            }
        });
        if let Some(previous) = lock(&self.drains).insert(store_id.to_owned(), task) {
            previous.abort();
        }
    }

    fn stop_drain(&self, store_id: &str) {
        if let Some(task) = lock(&self.drains).remove(store_id) {
            task.abort();
        }
    }
}

/// Accept and drop connections until the listener is shut down
fn accept_and_drop(listener: LocalListener) {
    tokio::spawn(async move { while listener.accept().await.is_some() {} });
}

/// Answer IMAP clients from the fake stores until the listener is shut down
fn serve_imap(listener: LocalListener, state: Arc<Mutex<ImapState>>) {
    tokio::spawn(async move {
        while let Some(accepted) = listener.accept().await {
            let Ok((stream, _peer)) = accepted else {
                continue;
            };
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                if let Err(e) = imap_session(stream, &state).await {
                    tracing::debug!(error = %e, "fake IMAP session failed");
                }
            });
        }
    });
}

/// Messages of every attached store serving `address`, in ID order
fn served_messages(state: &Mutex<ImapState>, address: &str) -> Vec<MessageMetadata> {
    let state = lock(state);
    let mut messages: Vec<MessageMetadata> = state
        .stores
        .values()
        .filter(|s| s.attached && s.addresses.iter().any(|a| a.eq_ignore_ascii_case(address)))
        .flat_map(|s| s.messages.values().cloned())
        .collect();
    messages.sort_by(|a, b| a.id.cmp(&b.id));
    messages
}

async fn send(conn: &mut BufReader<LocalStream>, text: &str) -> std::io::Result<()> {
    conn.get_mut().write_all(text.as_bytes()).await?;
    conn.get_mut().flush().await
}

/// One IMAP connection: greeting, LOGIN, EXAMINE, UID FETCH and LOGOUT
///
/// Any credentials are accepted; the login name selects the stores. UIDs
/// are positions in ID order.
async fn imap_session(stream: LocalStream, state: &Mutex<ImapState>) -> std::io::Result<()> {
    let mut conn = BufReader::new(stream);
    send(&mut conn, "* OK IMAP4rev1 fake store ready\r\n").await?;

    let mut login: Option<String> = None;
    let mut selected: Vec<MessageMetadata> = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        if conn.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let Some((tag, command)) = line.trim_end().split_once(' ') else {
            continue;
        };
        let mut words = command.split_whitespace();
        let verb = words.next().unwrap_or_default().to_ascii_uppercase();
        match verb.as_str() {
            "LOGIN" => {
                login = words.next().map(|user| user.trim_matches('"').to_owned());
                send(&mut conn, &format!("{tag} OK LOGIN completed\r\n")).await?;
            }
            "EXAMINE" if command.contains("\"All Mail\"") => {
                selected = login
                    .as_deref()
                    .map(|address| served_messages(state, address))
                    .unwrap_or_default();
                let response = format!(
                    "* {} EXISTS\r\n* OK [UIDVALIDITY 1] UIDs valid\r\n{tag} OK [READ-ONLY] EXAMINE completed\r\n",
                    selected.len()
                );
                send(&mut conn, &response).await?;
            }
            "EXAMINE" => {
                send(&mut conn, &format!("{tag} NO no such mailbox\r\n")).await?;
            }
            "UID" => {
                for (index, message) in selected.iter().enumerate() {
                    let uid = index + 1;
                    let mut flags = Vec::new();
                    if !message.unread {
                        flags.push("\\Seen");
                    }
                    if message.starred {
                        flags.push("\\Flagged");
                    }
                    let header = format!("{INTERNAL_ID_HEADER}: {}\r\n\r\n", message.id);
                    let response = format!(
                        "* {uid} FETCH (UID {uid} FLAGS ({}) BODY[HEADER.FIELDS ({INTERNAL_ID_HEADER})] {{{}}}\r\n{header})\r\n",
                        flags.join(" "),
                        header.len()
                    );
                    send(&mut conn, &response).await?;
                }
                send(&mut conn, &format!("{tag} OK UID FETCH completed\r\n")).await?;
            }
            "LOGOUT" => {
                send(&mut conn, &format!("* BYE logging out\r\n{tag} OK LOGOUT completed\r\n")).await?;
                return Ok(());
            }
            _ => {
                send(&mut conn, &format!("{tag} BAD unsupported command\r\n")).await?;
            }
        }
    }
}

#[async_trait]
impl ImapEngine for FakeImapEngine {
    async fn serve(&self, listener: LocalListener) -> AppResult<()> {
        serve_imap(listener, Arc::clone(&self.state));
        Ok(())
    }

    async fn add_user(
        &self,
        connector: Arc<Connector>,
        _passphrase: &SecretString,
    ) -> AppResult<String> {
        let store_id = {
            let mut state = lock(&self.state);
            state.next_store += 1;
            state.created += 1;
            let store_id = format!("store-{}", state.next_store);
            state.stores.insert(
                store_id.clone(),
                FakeStore {
                    user_id: connector.user_id().to_owned(),
                    binding_id: connector.binding_id().to_owned(),
                    addresses: connector.addresses(),
                    attached: true,
                    ..FakeStore::default()
                },
            );
            store_id
        };
        self.drain(&store_id, &connector);
        Ok(store_id)
    }

    async fn load_user(
        &self,
        connector: Arc<Connector>,
        store_id: &str,
        _passphrase: &SecretString,
    ) -> AppResult<StoreStats> {
        let stats = {
            let mut state = lock(&self.state);
            let store = state
                .stores
                .get_mut(store_id)
                .ok_or_else(|| AppError::Store(format!("store {store_id} does not exist")))?;
            store.attached = true;
            StoreStats {
                message_count: store.messages.len() as u64,
            }
        };
        self.drain(store_id, &connector);
        Ok(stats)
    }

    async fn remove_user(&self, store_id: &str, with_data: bool) -> AppResult<()> {
        self.stop_drain(store_id);
        let mut state = lock(&self.state);
        if with_data {
            state.stores.remove(store_id);
        } else if let Some(store) = state.stores.get_mut(store_id) {
            store.attached = false;
        }
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        let drains: Vec<(String, JoinHandle<()>)> = lock(&self.drains).drain().collect();
        let mut state = lock(&self.state);
        for (store_id, task) in drains {
            task.abort();
            if let Some(store) = state.stores.get_mut(&store_id) {
                store.attached = false;
            }
        }
        Ok(())
    }
}

/// SMTP engine factory remembering the account table it was handed
#[derive(Default)]
pub struct FakeSmtp {
    builds: AtomicUsize,
    accounts: Mutex<Option<SmtpAccounts>>,
}

impl FakeSmtp {
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn accounts(&self) -> SmtpAccounts {
        lock(&self.accounts).clone().unwrap_or_default()
    }
}

impl SmtpEngineFactory for FakeSmtp {
    fn build(&self, accounts: SmtpAccounts) -> AppResult<Arc<dyn SmtpEngine>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        *lock(&self.accounts) = Some(accounts);
        Ok(Arc::new(FakeSmtpEngine))
    }
}

struct FakeSmtpEngine;

#[async_trait]
impl SmtpEngine for FakeSmtpEngine {
    async fn serve(&self, listener: LocalListener) -> AppResult<()> {
        accept_and_drop(listener);
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingTelemetry {
    sent: Mutex<Vec<HeartbeatReport>>,
}

impl RecordingTelemetry {
    pub fn sent(&self) -> Vec<HeartbeatReport> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl TelemetrySink for RecordingTelemetry {
    async fn send_heartbeat(&self, report: &HeartbeatReport) -> AppResult<()> {
        lock(&self.sent).push(report.clone());
        Ok(())
    }
}

pub struct FakeUpdater {
    release: Mutex<VersionInfo>,
    installed: Mutex<Vec<String>>,
    fail_install: AtomicBool,
    channels: Mutex<Vec<UpdateChannel>>,
}

impl FakeUpdater {
    pub fn new(release: VersionInfo) -> Arc<Self> {
        Arc::new(Self {
            release: Mutex::new(release),
            installed: Mutex::new(Vec::new()),
            fail_install: AtomicBool::new(false),
            channels: Mutex::new(Vec::new()),
        })
    }

    pub fn installed(&self) -> Vec<String> {
        lock(&self.installed).clone()
    }

    pub fn fail_install(&self) {
        self.fail_install.store(true, Ordering::SeqCst);
    }

    /// Channels queried so far
    pub fn channels(&self) -> Vec<UpdateChannel> {
        lock(&self.channels).clone()
    }
}

#[async_trait]
impl Updater for FakeUpdater {
    async fn latest(&self, channel: UpdateChannel) -> AppResult<VersionInfo> {
        lock(&self.channels).push(channel);
        Ok(lock(&self.release).clone())
    }

    async fn install(&self, info: &VersionInfo) -> AppResult<()> {
        if self.fail_install.load(Ordering::SeqCst) {
            return Err(AppError::Internal("installer crashed".to_owned()));
        }
        lock(&self.installed).push(info.version.clone());
        Ok(())
    }
}

/// Answers login prompts from fixed values
#[derive(Debug, Clone, Default)]
pub struct StaticPrompt {
    pub code: Option<String>,
    pub mailbox_password: Option<String>,
}

#[async_trait]
impl LoginPrompt for StaticPrompt {
    async fn two_factor_code(&self) -> AppResult<String> {
        self.code
            .clone()
            .ok_or_else(|| AppError::invalid("no second factor available"))
    }

    async fn mailbox_password(&self) -> AppResult<SecretString> {
        self.mailbox_password
            .as_deref()
            .map(secret)
            .ok_or_else(|| AppError::invalid("no mailbox password available"))
    }
}

/// Configuration with loop timings short enough for tests
pub fn fast_config(settings_dir: PathBuf) -> BridgeConfig {
    BridgeConfig {
        settings_dir,
        event_poll_ms: 20,
        recheck_initial_ms: 10,
        recheck_max_ms: 50,
        bad_event_retries: 5,
        bad_event_backoff_ms: 5,
        bus_capacity: 1024,
        heartbeat_interval_seconds: 3_600,
        update_interval_seconds: 3_600,
        sync_page_size: 2,
        imap_timeout_ms: 2_000,
    }
}

/// Fakes plus a standalone vault/bus/monitor for manager-level tests
///
/// Bridges built by [`Harness::bridge`] use their own vault under
/// `bridge/`, separate from [`Harness::vault`] under `manager/`.
pub struct Harness {
    pub dir: TempDir,
    pub config: BridgeConfig,
    pub vault: Arc<Vault>,
    pub bus: EventBus,
    pub monitor: Arc<ConnectionMonitor>,
    pub api: Arc<FakeApi>,
    pub imap: Arc<FakeImap>,
    pub smtp: Arc<FakeSmtp>,
    pub telemetry: Arc<RecordingTelemetry>,
    pub updater: Arc<FakeUpdater>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = fast_config(dir.path().join("bridge"));
        let vault = Arc::new(Vault::open(dir.path().join("manager").join("vault.json")).expect("vault"));
        vault
            .update_settings(|s| {
                s.imap_port = 0;
                s.smtp_port = 0;
            })
            .expect("ephemeral ports");
        let bus = EventBus::new(config.bus_capacity);
        let api = FakeApi::new();
        let monitor = ConnectionMonitor::new(
            &config,
            bus.clone(),
            api.clone(),
            CancellationToken::new(),
        );
        Self {
            dir,
            config,
            vault,
            bus,
            monitor,
            api,
            imap: Arc::new(FakeImap::default()),
            smtp: Arc::new(FakeSmtp::default()),
            telemetry: Arc::new(RecordingTelemetry::default()),
            updater: FakeUpdater::new(VersionInfo {
                version: "0.0.1".to_owned(),
                min_auto: "0.0.1".to_owned(),
                release_notes: String::new(),
            }),
        }
    }

    pub fn manager_deps(&self) -> ManagerDeps {
        ManagerDeps {
            settings_dir: self.dir.path().join("manager"),
            vault: Arc::clone(&self.vault),
            bus: self.bus.clone(),
            monitor: Arc::clone(&self.monitor),
            imap_factory: self.imap.clone(),
            smtp_factory: self.smtp.clone(),
        }
    }

    pub fn bridge_deps(&self) -> BridgeDeps {
        BridgeDeps {
            api: self.api.clone(),
            imap_factory: self.imap.clone(),
            smtp_factory: self.smtp.clone(),
            telemetry: self.telemetry.clone(),
            updater: self.updater.clone(),
        }
    }

    /// Start a bridge on ephemeral ports
    pub async fn bridge(&self) -> Bridge {
        let vault = Vault::open(self.config.vault_path()).expect("bridge vault");
        vault
            .update_settings(|s| {
                s.imap_port = 0;
                s.smtp_port = 0;
            })
            .expect("ephemeral ports");
        drop(vault);
        Bridge::new(self.config.clone(), self.bridge_deps())
            .await
            .expect("start bridge")
    }

    pub fn prompt(&self) -> StaticPrompt {
        StaticPrompt::default()
    }
}

/// Next event of `kind`, skipping others; panics after ten seconds
pub async fn wait_for_event(events: &mut Subscription, kind: EventKind) -> Event {
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            if event.kind() == kind {
                return Some(event);
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(event)) => event,
        Ok(None) => panic!("bus closed while waiting for {kind:?}"),
        Err(_) => panic!("timed out waiting for {kind:?}"),
    }
}

/// Poll `condition` until it holds; panics after ten seconds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never held: {what}");
}
