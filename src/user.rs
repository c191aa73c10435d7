//! Per-account session
//!
//! A [`User`] exists for every account in the vault, connected or not. It
//! owns the authorized API client (only while `Locked` or `Connected`), the
//! connectors binding its addresses to local stores, and the background
//! event loop that runs while connected.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiAddress, ApiClient, ApiManager, ApiUser, enabled_addresses};
use crate::bus::EventBus;
use crate::config::BridgeConfig;
use crate::engine::{Connector, SmtpAccount};
use crate::errors::{AppError, AppResult};
use crate::events::Event;
use crate::monitor::ConnectionMonitor;
use crate::server_manager::{ImapUser, ServerManager};
use crate::vault::{AddressMode, Sensitive, UserRecord, Vault};

/// Public view of a session's connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserState {
    SignedOut,
    Locked,
    Connected,
}

/// Connection state with the client it requires
///
/// `SignedOut` cannot hold a client and `Connected` cannot lack one.
enum Session {
    SignedOut,
    Locked(Arc<dyn ApiClient>),
    Connected(Arc<dyn ApiClient>),
}

impl Session {
    fn state(&self) -> UserState {
        match self {
            Self::SignedOut => UserState::SignedOut,
            Self::Locked(_) => UserState::Locked,
            Self::Connected(_) => UserState::Connected,
        }
    }
}

/// Requests a session cannot serve from inside its own event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UserCommand {
    /// The remote side revoked authorization
    Deauth { user_id: String },
}

/// Feedback delivered to a paused event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Feedback {
    Resync,
}

/// Shared collaborators every session talks to
pub(crate) struct UserContext {
    pub config: BridgeConfig,
    pub bus: EventBus,
    pub vault: Arc<Vault>,
    pub manager: ServerManager,
    pub monitor: Arc<ConnectionMonitor>,
    pub api: Arc<dyn ApiManager>,
    pub commands: mpsc::UnboundedSender<UserCommand>,
}

#[derive(Debug, Clone, Default)]
struct Identity {
    username: String,
    display_name: String,
    primary_email: String,
    addresses: Vec<ApiAddress>,
    mode: AddressMode,
}

impl Identity {
    fn emails(&self) -> Vec<String> {
        let enabled = enabled_addresses(&self.addresses);
        if enabled.is_empty() && !self.primary_email.is_empty() {
            return vec![self.primary_email.clone()];
        }
        enabled.into_iter().map(|a| a.email).collect()
    }
}

struct Runner {
    cancel: CancellationToken,
    feedback: mpsc::Sender<Feedback>,
    task: JoinHandle<()>,
}

pub struct User {
    id: String,
    ctx: Arc<UserContext>,
    identity: RwLock<Identity>,
    session: RwLock<Session>,
    /// Serializes login, resume and logout transitions
    lifecycle: tokio::sync::Mutex<()>,
    /// Set once the account is being deleted; no transition may connect it
    retired: AtomicBool,
    /// Binding ID to connector
    connectors: RwLock<BTreeMap<String, Arc<Connector>>>,
    used_space: AtomicU64,
    max_space: AtomicU64,
    /// Held while remote changes are written into the connectors
    pub(crate) event_lock: tokio::sync::Mutex<()>,
    runner: Mutex<Option<Runner>>,
    /// Bumped whenever stores are rebuilt; an older sync pass must stop
    pub(crate) sync_generation: AtomicU64,
    pub(crate) poll: Notify,
}

/// Bindings for a set of addresses: binding ID plus the emails it serves
pub(crate) fn derive_bindings(
    mode: AddressMode,
    addresses: &[ApiAddress],
) -> Vec<(String, Vec<String>)> {
    let enabled = enabled_addresses(addresses);
    match mode {
        AddressMode::Combined => match enabled.first() {
            Some(primary) => vec![(
                primary.id.clone(),
                enabled.iter().map(|a| a.email.clone()).collect(),
            )],
            None => Vec::new(),
        },
        AddressMode::Split => enabled
            .into_iter()
            .map(|a| (a.id, vec![a.email]))
            .collect(),
    }
}

/// Record the outcome of one cleanup step without aborting the sequence
fn cleanup_step(user_id: &str, step: &str, result: AppResult<()>, failures: &mut Vec<String>) {
    if let Err(e) = result {
        warn!(user_id = %user_id, step, error = %e, "cleanup step failed");
        failures.push(format!("{step}: {e}"));
    }
}

impl User {
    /// Build a signed-out session from its persisted record
    pub(crate) fn new_signed_out(record: &UserRecord, ctx: Arc<UserContext>) -> Arc<Self> {
        Arc::new(Self {
            id: record.user_id.clone(),
            ctx,
            identity: RwLock::new(Identity {
                username: record.username.clone(),
                display_name: record.username.clone(),
                primary_email: record.primary_email.clone(),
                addresses: Vec::new(),
                mode: record.address_mode,
            }),
            session: RwLock::new(Session::SignedOut),
            lifecycle: tokio::sync::Mutex::new(()),
            retired: AtomicBool::new(false),
            connectors: RwLock::new(BTreeMap::new()),
            used_space: AtomicU64::new(0),
            max_space: AtomicU64::new(0),
            event_lock: tokio::sync::Mutex::new(()),
            runner: Mutex::new(None),
            sync_generation: AtomicU64::new(0),
            poll: Notify::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> UserState {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == UserState::Connected
    }

    pub fn username(&self) -> String {
        self.identity().username
    }

    pub fn display_name(&self) -> String {
        self.identity().display_name
    }

    pub fn emails(&self) -> Vec<String> {
        self.identity().emails()
    }

    pub fn address_mode(&self) -> AddressMode {
        self.identity().mode
    }

    pub fn used_space(&self) -> u64 {
        self.used_space.load(Ordering::Relaxed)
    }

    pub fn max_space(&self) -> u64 {
        self.max_space.load(Ordering::Relaxed)
    }

    pub(crate) fn ctx(&self) -> &UserContext {
        &self.ctx
    }

    fn identity(&self) -> Identity {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether `query` names this account, ignoring case
    pub fn matches(&self, query: &str) -> bool {
        let identity = self.identity();
        self.id.eq_ignore_ascii_case(query)
            || identity.username.eq_ignore_ascii_case(query)
            || identity.display_name.eq_ignore_ascii_case(query)
            || identity.primary_email.eq_ignore_ascii_case(query)
            || identity
                .addresses
                .iter()
                .any(|a| a.email.eq_ignore_ascii_case(query))
    }

    fn set_session(&self, session: Session) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = session;
    }

    fn take_session(&self) -> Session {
        std::mem::replace(
            &mut *self.session.write().unwrap_or_else(PoisonError::into_inner),
            Session::SignedOut,
        )
    }

    /// Client of a connected session
    ///
    /// # Errors
    ///
    /// Returns `Locked` or `InvalidInput` when the session is not connected.
    pub(crate) fn client(&self) -> AppResult<Arc<dyn ApiClient>> {
        match &*self.session.read().unwrap_or_else(PoisonError::into_inner) {
            Session::Connected(client) => Ok(Arc::clone(client)),
            Session::Locked(_) => Err(AppError::Locked(self.id.clone())),
            Session::SignedOut => Err(AppError::invalid(format!(
                "user '{}' is signed out",
                self.id
            ))),
        }
    }

    pub(crate) fn connectors(&self) -> Vec<Arc<Connector>> {
        self.connectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Binding IDs currently derived for this account
    pub fn binding_ids(&self) -> Vec<String> {
        self.connectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Connector that stores messages of `address_id`
    pub(crate) fn connector_for(&self, address_id: &str) -> Option<Arc<Connector>> {
        let connectors = self.connectors.read().unwrap_or_else(PoisonError::into_inner);
        match self.address_mode() {
            AddressMode::Combined => connectors.values().next().cloned(),
            AddressMode::Split => connectors.get(address_id).cloned(),
        }
    }

    fn bridge_pass(&self) -> AppResult<SecretString> {
        Ok(self.ctx.vault.get_user(&self.id)?.bridge_pass.to_secret())
    }

    /// Rebuild connectors from the current addresses and mode
    ///
    /// Connectors whose binding survives keep their queued updates.
    pub(crate) fn rebuild_connectors(&self) -> AppResult<()> {
        let identity = self.identity();
        let bindings = derive_bindings(identity.mode, &identity.addresses);
        let bridge_pass = self.bridge_pass()?;
        let mut connectors = self.connectors.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = BTreeMap::new();
        for (binding_id, emails) in bindings {
            let connector = match connectors.remove(&binding_id) {
                Some(existing) => {
                    if existing.addresses() != emails {
                        existing.set_addresses(emails);
                    }
                    existing
                }
                None => Connector::new(&self.id, &binding_id, emails, bridge_pass.clone()),
            };
            next.insert(binding_id, connector);
        }
        *connectors = next;
        Ok(())
    }

    pub(crate) fn imap_user(&self) -> AppResult<ImapUser> {
        let record = self.ctx.vault.get_user(&self.id)?;
        Ok(ImapUser {
            user_id: self.id.clone(),
            connectors: self.connectors(),
            passphrase: record.key_pass.to_secret(),
        })
    }

    fn smtp_account(&self, client: Arc<dyn ApiClient>) -> AppResult<SmtpAccount> {
        Ok(SmtpAccount {
            user_id: self.id.clone(),
            addresses: self.emails(),
            bridge_pass: self.bridge_pass()?,
            client,
        })
    }

    pub(crate) fn apply_user_info(&self, user: &ApiUser) {
        {
            let mut identity = self.identity.write().unwrap_or_else(PoisonError::into_inner);
            identity.username = user.name.clone();
            identity.display_name = user.display_name.clone();
        }
        self.used_space.store(user.used_space, Ordering::Relaxed);
        self.max_space.store(user.max_space, Ordering::Relaxed);
    }

    pub(crate) fn set_used_space(&self, used_space: u64) {
        self.used_space.store(used_space, Ordering::Relaxed);
    }

    pub(crate) fn addresses(&self) -> Vec<ApiAddress> {
        self.identity().addresses
    }

    pub(crate) fn set_addresses(&self, addresses: Vec<ApiAddress>) {
        let mut identity = self.identity.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(primary) = enabled_addresses(&addresses).first() {
            identity.primary_email = primary.email.clone();
        }
        identity.addresses = addresses;
    }

    /// Re-derive bindings after an address change and reattach them
    pub(crate) async fn reconfigure_bindings(&self) -> AppResult<()> {
        let before = self.binding_ids();
        self.rebuild_connectors()?;
        let after = self.binding_ids();

        let client = self.client()?;
        if before != after {
            info!(user_id = %self.id, ?before, ?after, "address bindings changed");
            self.ctx.manager.add_imap_user(self.imap_user()?).await?;
        }
        self.ctx
            .manager
            .add_smtp_account(self.smtp_account(client)?)
            .await?;
        let emails = self.emails();
        self.ctx.vault.update_user(&self.id, |r| {
            if let Some(primary) = emails.first() {
                r.primary_email = primary.clone();
            }
        })?;
        Ok(())
    }

    /// Bring an unlocked client to `Connected`
    ///
    /// Loads the account's identity, attaches its stores to the IMAP server
    /// and its addresses to the SMTP backend, then starts the event loop.
    pub(crate) async fn activate(self: &Arc<Self>, client: Arc<dyn ApiClient>) -> AppResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.activate_locked(client).await
    }

    async fn activate_locked(self: &Arc<Self>, client: Arc<dyn ApiClient>) -> AppResult<()> {
        self.ensure_not_retired()?;
        if self.is_connected() {
            return Err(AppError::AlreadyLoggedIn(self.id.clone()));
        }

        let api_user = client.get_user().await?;
        let addresses = client.get_addresses().await?;
        self.apply_user_info(&api_user);
        self.set_addresses(addresses);

        let record = self.ctx.vault.get_user(&self.id)?;
        if record.event_id.is_empty() {
            let latest = client.get_latest_event_id().await?;
            self.ctx
                .vault
                .update_user(&self.id, |r| r.event_id = latest)?;
        }
        {
            let primary = self.identity().primary_email;
            let username = api_user.name.clone();
            self.ctx.vault.update_user(&self.id, |r| {
                r.username = username;
                r.primary_email = primary;
            })?;
        }
        self.rebuild_connectors()?;

        self.set_session(Session::Connected(Arc::clone(&client)));
        let attached = async {
            self.ctx.manager.add_imap_user(self.imap_user()?).await?;
            self.ctx
                .manager
                .add_smtp_account(self.smtp_account(Arc::clone(&client))?)
                .await
        }
        .await;
        if let Err(e) = attached {
            warn!(user_id = %self.id, error = %e, "failed to attach user to local servers");
            if let Err(detach) = self.ctx.manager.remove_imap_user(&self.id, false).await {
                warn!(user_id = %self.id, error = %detach, "failed to detach after error");
            }
            self.set_session(Session::Locked(client));
            return Err(e);
        }

        self.start_event_loop();
        info!(user_id = %self.id, "user connected");
        self.ctx.bus.publish(Event::UserLoggedIn {
            user_id: self.id.clone(),
        });
        Ok(())
    }

    /// Reconnect from persisted authorization
    ///
    /// Leaves the session `Locked` when the keys cannot be unlocked and
    /// `SignedOut` when the authorization is gone.
    pub(crate) async fn resume(self: &Arc<Self>) -> AppResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.ensure_not_retired()?;
        let existing = match &*self.session.read().unwrap_or_else(PoisonError::into_inner) {
            Session::Connected(_) => return Ok(()),
            Session::Locked(client) => Some(Arc::clone(client)),
            Session::SignedOut => None,
        };

        let record = self.ctx.vault.get_user(&self.id)?;
        if !record.has_auth() {
            return Err(AppError::AuthFailed(format!(
                "user '{}' has no stored authorization",
                self.id
            )));
        }

        let client = match existing {
            Some(client) => client,
            None => {
                let resumed = self
                    .ctx
                    .api
                    .resume(&record.auth_uid, &record.auth_ref.to_secret())
                    .await;
                let (client, auth) = match resumed {
                    Ok(pair) => pair,
                    Err(e) => return Err(self.classify_remote_failure(e)),
                };
                self.ctx.monitor.report_up();
                let token = auth.refresh_token.expose_secret().to_owned();
                self.ctx.vault.update_user(&self.id, |r| {
                    r.auth_uid = auth.uid.clone();
                    r.auth_ref = Sensitive::new(token);
                })?;
                client
            }
        };

        if let Err(e) = client.unlock(&record.key_pass.to_secret()).await {
            if e.is_network() {
                self.ctx.monitor.report_down();
                self.set_session(Session::Locked(client));
                return Err(e);
            }
            warn!(user_id = %self.id, error = %e, "cannot unlock keys, user is locked");
            self.set_session(Session::Locked(client));
            return Err(AppError::Locked(e.to_string()));
        }

        self.activate_locked(client)
            .await
            .map_err(|e| self.classify_remote_failure(e))
    }

    /// Report network failures and drop rejected authorization
    fn classify_remote_failure(&self, e: AppError) -> AppError {
        if e.is_network() {
            self.ctx.monitor.report_down();
        } else if e.is_auth() {
            warn!(user_id = %self.id, error = %e, "stored authorization rejected");
            if let Err(clear) = self.ctx.vault.update_user(&self.id, UserRecord::clear_auth) {
                warn!(user_id = %self.id, error = %clear, "failed to clear rejected authorization");
            }
        }
        e
    }

    /// Sign out, keeping local data
    ///
    /// Every cleanup step runs even when an earlier one fails. Signing out
    /// an already signed-out session does nothing.
    pub async fn logout(&self) -> AppResult<()> {
        self.sign_out(true).await;
        Ok(())
    }

    /// Sign out for good before the account is deleted
    ///
    /// Any resume or login still in flight is signed out again once it
    /// completes, and later ones are refused.
    pub(crate) async fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.sign_out(true).await;
    }

    fn ensure_not_retired(&self) -> AppResult<()> {
        if self.retired.load(Ordering::SeqCst) {
            return Err(AppError::NotFound(format!("user '{}' was deleted", self.id)));
        }
        Ok(())
    }

    /// Sign out after the remote side revoked authorization
    pub(crate) async fn deauth(&self) {
        if self.sign_out(false).await {
            self.ctx.bus.publish(Event::UserDeauth {
                user_id: self.id.clone(),
            });
        }
    }

    /// Returns whether the session was signed in
    async fn sign_out(&self, revoke: bool) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        let client = match self.take_session() {
            Session::SignedOut => {
                debug!(user_id = %self.id, "logout on signed-out user");
                return false;
            }
            Session::Locked(client) | Session::Connected(client) => client,
        };

        let mut failures = Vec::new();
        self.stop_event_loop().await;
        cleanup_step(
            &self.id,
            "detach IMAP",
            self.ctx.manager.remove_imap_user(&self.id, false).await,
            &mut failures,
        );
        cleanup_step(
            &self.id,
            "detach SMTP",
            self.ctx.manager.remove_smtp_account(&self.id).await,
            &mut failures,
        );
        if revoke {
            cleanup_step(&self.id, "revoke", client.revoke().await, &mut failures);
        }
        cleanup_step(
            &self.id,
            "clear credentials",
            self.ctx.vault.update_user(&self.id, UserRecord::clear_auth),
            &mut failures,
        );

        info!(user_id = %self.id, failed_steps = failures.len(), "user signed out");
        self.ctx.bus.publish(Event::UserLoggedOut {
            user_id: self.id.clone(),
        });
        true
    }

    /// Answer an outstanding bad event
    ///
    /// `resync` wipes local stores and resynchronises; otherwise the marker
    /// is cleared and the user is signed out.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when no bad event is outstanding.
    pub async fn send_bad_event_feedback(&self, resync: bool) -> AppResult<()> {
        let record = self.ctx.vault.get_user(&self.id)?;
        if record.bad_event.is_none() {
            return Err(AppError::invalid(format!(
                "user '{}' has no outstanding bad event",
                self.id
            )));
        }

        if resync {
            let feedback = self
                .runner
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .map(|r| r.feedback.clone())
                .ok_or_else(|| {
                    AppError::invalid(format!("user '{}' is not connected", self.id))
                })?;
            return feedback
                .send(Feedback::Resync)
                .await
                .map_err(|_| AppError::Invariant("event loop stopped".to_owned()));
        }

        self.ctx.vault.update_user(&self.id, |r| r.bad_event = None)?;
        self.logout().await?;
        self.ctx.bus.publish(Event::UserBadEventFeedback {
            user_id: self.id.clone(),
            resync: false,
        });
        Ok(())
    }

    /// Switch between one shared store and one store per address
    ///
    /// Existing stores are deleted and rebuilt for the new mode; the event
    /// loop then resynchronises them.
    pub(crate) async fn set_address_mode(&self, mode: AddressMode) -> AppResult<()> {
        let _events = self.event_lock.lock().await;
        if self.address_mode() == mode {
            return Ok(());
        }
        self.sync_generation.fetch_add(1, Ordering::SeqCst);

        self.ctx.manager.remove_imap_user(&self.id, true).await?;
        self.ctx
            .vault
            .update_user(&self.id, |r| r.address_mode = mode)?;
        self.identity
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .mode = mode;
        self.rebuild_connectors()?;
        if self.is_connected() {
            self.ctx.manager.add_imap_user(self.imap_user()?).await?;
        }

        info!(user_id = %self.id, ?mode, "address mode changed");
        self.ctx.bus.publish(Event::UserAddressModeChanged {
            user_id: self.id.clone(),
            mode,
        });
        self.poll.notify_one();
        Ok(())
    }

    fn start_event_loop(self: &Arc<Self>) {
        let mut runner = self.runner.lock().unwrap_or_else(PoisonError::into_inner);
        if runner.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let (feedback, feedback_rx) = mpsc::channel(1);
        let task = tokio::spawn(Arc::clone(self).run_event_loop(cancel.clone(), feedback_rx));
        *runner = Some(Runner {
            cancel,
            feedback,
            task,
        });
    }

    /// Cancel the event loop and wait for it to finish
    pub(crate) async fn stop_event_loop(&self) {
        let runner = self
            .runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runner) = runner {
            runner.cancel.cancel();
            if let Err(e) = runner.task.await {
                warn!(user_id = %self.id, error = %e, "event loop task failed");
            }
        }
    }

    /// Ask the loop to poll now instead of waiting for the interval
    pub fn poll_now(&self) {
        self.poll.notify_one();
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("bindings", &self.binding_ids())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::derive_bindings;
    use crate::api::ApiAddress;
    use crate::vault::AddressMode;

    fn address(id: &str, order: u32, enabled: bool) -> ApiAddress {
        ApiAddress {
            id: id.to_owned(),
            email: format!("{id}@example.com"),
            enabled,
            order,
        }
    }

    #[test]
    fn combined_mode_binds_all_enabled_addresses_to_primary() {
        let addresses = vec![
            address("second", 2, true),
            address("primary", 1, true),
            address("off", 0, false),
        ];
        let bindings = derive_bindings(AddressMode::Combined, &addresses);
        assert_eq!(
            bindings,
            vec![(
                "primary".to_owned(),
                vec![
                    "primary@example.com".to_owned(),
                    "second@example.com".to_owned()
                ]
            )]
        );
    }

    #[test]
    fn split_mode_binds_each_enabled_address() {
        let addresses = vec![address("a", 1, true), address("b", 2, true), address("c", 3, false)];
        let ids: Vec<String> = derive_bindings(AddressMode::Split, &addresses)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn no_enabled_address_means_no_binding() {
        assert!(derive_bindings(AddressMode::Combined, &[address("x", 0, false)]).is_empty());
    }
}
