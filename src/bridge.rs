//! Bridge facade
//!
//! Wires the bus, connection monitor, server manager, session directory and
//! background loops together, and exposes the operations front-ends use.
//! Settings that affect the local servers are applied through the server
//! manager, never directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{ApiClient, ApiManager, Auth, LoginSession, PasswordMode};
use crate::bus::{EventBus, Subscription};
use crate::config::BridgeConfig;
use crate::diagnostics::{self, LocalEndpoint};
use crate::directory::SessionDirectory;
use crate::engine::{ImapEngineFactory, SmtpEngineFactory};
use crate::errors::{AppError, AppResult};
use crate::events::{Event, EventKind};
use crate::heartbeat::{Heartbeat, TelemetrySink};
use crate::models::{ConsistencyReport, UserInfo};
use crate::monitor::{ConnStatus, ConnectionMonitor};
use crate::server_manager::{ManagerDeps, ServerManager, ServerStatus};
use crate::tls;
use crate::updates::{UpdateChecker, Updater, VersionInfo};
use crate::user::{User, UserContext};
use crate::vault::{AddressMode, Sensitive, Settings, UpdateChannel, UserRecord, Vault};

/// Interactive steps a login may need
#[async_trait]
pub trait LoginPrompt: Send + Sync {
    /// Second factor for accounts that require one
    async fn two_factor_code(&self) -> AppResult<String>;

    /// Separate mailbox password for two-password accounts
    async fn mailbox_password(&self) -> AppResult<SecretString>;
}

/// External collaborators
pub struct BridgeDeps {
    pub api: Arc<dyn ApiManager>,
    pub imap_factory: Arc<dyn ImapEngineFactory>,
    pub smtp_factory: Arc<dyn SmtpEngineFactory>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub updater: Arc<dyn Updater>,
}

pub struct Bridge {
    config: BridgeConfig,
    vault: Arc<Vault>,
    bus: EventBus,
    api: Arc<dyn ApiManager>,
    monitor: Arc<ConnectionMonitor>,
    manager: ServerManager,
    directory: Arc<SessionDirectory>,
    heartbeat: Arc<Heartbeat>,
    updates: Arc<UpdateChecker>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Local password handed to IMAP/SMTP clients
fn generate_bridge_password() -> Sensitive {
    Sensitive::new(Uuid::new_v4().simple().to_string())
}

impl Bridge {
    /// Open the vault, start every background task and resume known users
    ///
    /// # Errors
    ///
    /// Returns `Io`/`Config` if the settings directory or vault cannot be
    /// opened, or the engine factories' error if the servers cannot be
    /// built.
    pub async fn new(config: BridgeConfig, deps: BridgeDeps) -> AppResult<Self> {
        tokio::fs::create_dir_all(&config.settings_dir).await?;
        let vault = Arc::new(Vault::open(config.vault_path())?);
        let current_version = env!("CARGO_PKG_VERSION");
        let previous_version = vault.settings().last_version;
        if previous_version != current_version {
            info!(previous = %previous_version, current = current_version, "bridge version changed");
            vault.update_settings(|s| s.last_version = current_version.to_owned())?;
        }

        let bus = EventBus::new(config.bus_capacity);
        let cancel = CancellationToken::new();
        let monitor = ConnectionMonitor::new(
            &config,
            bus.clone(),
            Arc::clone(&deps.api),
            cancel.child_token(),
        );
        let manager = ServerManager::spawn(ManagerDeps {
            settings_dir: config.settings_dir.clone(),
            vault: Arc::clone(&vault),
            bus: bus.clone(),
            monitor: Arc::clone(&monitor),
            imap_factory: deps.imap_factory,
            smtp_factory: deps.smtp_factory,
        })?;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(UserContext {
            config: config.clone(),
            bus: bus.clone(),
            vault: Arc::clone(&vault),
            manager: manager.clone(),
            monitor: Arc::clone(&monitor),
            api: Arc::clone(&deps.api),
            commands,
        });
        let directory = SessionDirectory::new(ctx);
        let heartbeat = Heartbeat::new(Arc::clone(&vault), Arc::clone(&directory), deps.telemetry);
        let updates = UpdateChecker::new(
            Arc::clone(&vault),
            bus.clone(),
            deps.updater,
            current_version,
        )?;

        let tasks = vec![
            directory.spawn_watcher(commands_rx, cancel.child_token()),
            heartbeat.spawn(
                Duration::from_secs(config.heartbeat_interval_seconds),
                cancel.child_token(),
            ),
            updates.spawn(
                Duration::from_secs(config.update_interval_seconds),
                cancel.child_token(),
            ),
        ];

        let bridge = Self {
            config,
            vault,
            bus,
            api: deps.api,
            monitor,
            manager,
            directory,
            heartbeat,
            updates,
            cancel,
            tasks: Mutex::new(tasks),
        };
        bridge.directory.load_all().await;
        info!(users = bridge.vault.get_user_ids().len(), "bridge started");
        Ok(bridge)
    }

    /// Receive bus events of the given kinds (all kinds when empty)
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.bus.subscribe(kinds)
    }

    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    pub fn heartbeat(&self) -> &Arc<Heartbeat> {
        &self.heartbeat
    }

    pub fn connection_status(&self) -> ConnStatus {
        self.monitor.status()
    }

    pub async fn server_status(&self) -> AppResult<ServerStatus> {
        self.manager.status().await
    }

    /// Log in an account, returning its ID
    ///
    /// Asks `prompt` for a second factor and for the mailbox password when
    /// the account needs them.
    ///
    /// # Errors
    ///
    /// - `AlreadyLoggedIn` if the account is connected already
    /// - `AuthFailed` for rejected credentials
    /// - `Network` if the remote API is unreachable
    pub async fn login(
        &self,
        username: &str,
        password: &SecretString,
        prompt: &dyn LoginPrompt,
    ) -> AppResult<String> {
        let LoginSession { client, auth } = match self.api.login(username, password).await {
            Ok(session) => {
                self.monitor.report_up();
                session
            }
            Err(e) => {
                if e.is_network() {
                    self.monitor.report_down();
                }
                return Err(e);
            }
        };

        let user_id = auth.user_id.clone();
        if let Ok(existing) = self.directory.get(&user_id).await
            && existing.is_connected()
        {
            if let Err(e) = client.revoke().await {
                warn!(user_id = %user_id, error = %e, "failed to revoke duplicate login");
            }
            return Err(AppError::AlreadyLoggedIn(user_id));
        }

        match self
            .finish_login(username, Arc::clone(&client), auth, password, prompt)
            .await
        {
            Ok(()) => {
                info!(user_id = %user_id, "login complete");
                Ok(user_id)
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "login failed");
                if let Err(revoke) = client.revoke().await {
                    warn!(user_id = %user_id, error = %revoke, "failed to revoke failed login");
                }
                Err(e)
            }
        }
    }

    async fn finish_login(
        &self,
        username: &str,
        client: Arc<dyn ApiClient>,
        auth: Auth,
        password: &SecretString,
        prompt: &dyn LoginPrompt,
    ) -> AppResult<()> {
        if auth.two_factor_required {
            let code = prompt.two_factor_code().await?;
            client.auth_2fa(&code).await?;
        }
        let mailbox_password = match auth.password_mode {
            PasswordMode::One => password.clone(),
            PasswordMode::Two => prompt.mailbox_password().await?,
        };
        let key_pass = client.derive_key_pass(&mailbox_password).await?;
        client
            .unlock(&key_pass)
            .await
            .map_err(|e| AppError::AuthFailed(format!("cannot unlock keys: {e}")))?;

        let user_id = auth.user_id.clone();
        let token = Sensitive::new(auth.refresh_token.expose_secret());
        let key_pass = Sensitive::new(key_pass.expose_secret());
        if self.vault.has_user(&user_id) {
            self.vault.update_user(&user_id, |r| {
                r.auth_uid = auth.uid.clone();
                r.auth_ref = token;
                r.key_pass = key_pass;
                if r.bridge_pass.is_empty() {
                    r.bridge_pass = generate_bridge_password();
                }
            })?;
        } else {
            self.vault.add_user(UserRecord {
                user_id: user_id.clone(),
                username: username.to_owned(),
                auth_uid: auth.uid.clone(),
                auth_ref: token,
                key_pass,
                bridge_pass: generate_bridge_password(),
                ..UserRecord::default()
            })?;
        }

        let record = self.vault.get_user(&user_id)?;
        let ctx = Arc::clone(self.directory.ctx());
        let user = self
            .directory
            .get_or_insert_with(&user_id, || User::new_signed_out(&record, ctx))
            .await;
        match user.activate(client).await {
            Ok(()) => Ok(()),
            Err(e @ AppError::AlreadyLoggedIn(_)) => Err(e),
            Err(e) => {
                // A half-attached session must not linger as Locked.
                user.logout().await?;
                if let Err(clear) = self.vault.update_user(&user_id, UserRecord::clear_auth) {
                    warn!(user_id = %user_id, error = %clear, "failed to clear credentials after failed login");
                }
                Err(e)
            }
        }
    }

    pub async fn logout_user(&self, user_id: &str) -> AppResult<()> {
        self.directory.get(user_id).await?.logout().await
    }

    /// Remove an account entirely
    ///
    /// Forgets the session first, signs it out for good, optionally deletes
    /// local stores, then drops the vault record.
    /// Every step is attempted even when an earlier one fails.
    pub async fn delete_user(&self, user_id: &str, with_data: bool) -> AppResult<()> {
        let user = self
            .directory
            .remove(user_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("user '{user_id}'")))?;

        user.retire().await;
        if with_data
            && let Err(e) = self.manager.remove_imap_user(user_id, true).await
        {
            warn!(user_id = %user_id, error = %e, "failed to delete local stores");
        }
        if let Err(e) = self.vault.delete_user(user_id) {
            warn!(user_id = %user_id, error = %e, "failed to delete vault record");
        }

        info!(user_id = %user_id, with_data, "user deleted");
        self.bus.publish(Event::UserDeleted {
            user_id: user_id.to_owned(),
        });
        Ok(())
    }

    /// Account IDs in vault order
    pub async fn get_user_ids(&self) -> Vec<String> {
        self.directory
            .list()
            .await
            .iter()
            .map(|u| u.id().to_owned())
            .collect()
    }

    fn user_info(&self, user: &User) -> AppResult<UserInfo> {
        let record = self.vault.get_user(user.id())?;
        Ok(UserInfo {
            user_id: user.id().to_owned(),
            username: user.username(),
            addresses: user.emails(),
            address_mode: user.address_mode(),
            state: user.state(),
            bridge_password: record.bridge_pass.to_secret().expose_secret().to_owned(),
            used_space: user.used_space(),
            max_space: user.max_space(),
            bad_event: record.bad_event.map(|m| m.error),
        })
    }

    pub async fn get_user_info(&self, user_id: &str) -> AppResult<UserInfo> {
        let user = self.directory.get(user_id).await?;
        self.user_info(&user)
    }

    /// Look up an account by ID, name or address
    pub async fn find_user(&self, query: &str) -> AppResult<UserInfo> {
        let user = self.directory.find(query).await?;
        self.user_info(&user)
    }

    pub async fn set_address_mode(&self, user_id: &str, mode: AddressMode) -> AppResult<()> {
        self.directory.set_address_mode(user_id, mode).await
    }

    pub async fn send_bad_event_user_feedback(&self, user_id: &str, resync: bool) -> AppResult<()> {
        self.directory
            .get(user_id)
            .await?
            .send_bad_event_feedback(resync)
            .await
    }

    pub fn settings(&self) -> Settings {
        self.vault.settings()
    }

    /// # Errors
    ///
    /// Returns `Config` if the port is taken; the previous port stays.
    pub async fn set_imap_port(&self, port: u16) -> AppResult<()> {
        self.manager.set_imap_port(port).await
    }

    /// # Errors
    ///
    /// Returns `Config` if the port is taken; the previous port stays.
    pub async fn set_smtp_port(&self, port: u16) -> AppResult<()> {
        self.manager.set_smtp_port(port).await
    }

    /// # Errors
    ///
    /// Returns `Config` if the server cannot run with the new mode; the
    /// previous mode stays.
    pub async fn set_imap_ssl(&self, enabled: bool) -> AppResult<()> {
        self.manager.set_imap_tls(enabled).await
    }

    pub async fn set_smtp_ssl(&self, enabled: bool) -> AppResult<()> {
        self.manager.set_smtp_tls(enabled).await
    }

    /// Move local stores to another directory
    pub async fn set_data_dir(&self, path: PathBuf) -> AppResult<()> {
        self.manager.set_data_dir(path).await
    }

    pub fn set_proxy_allowed(&self, allowed: bool) -> AppResult<()> {
        self.vault.update_settings(|s| s.proxy_allowed = allowed)
    }

    pub fn set_auto_update(&self, enabled: bool) -> AppResult<()> {
        self.vault.update_settings(|s| s.auto_update = enabled)
    }

    /// Switch release channel and check it right away
    pub fn set_update_channel(&self, channel: UpdateChannel) -> AppResult<()> {
        self.vault.update_settings(|s| s.update_channel = channel)?;
        self.updates.trigger();
        Ok(())
    }

    pub fn set_telemetry_disabled(&self, disabled: bool) -> AppResult<()> {
        self.vault
            .update_settings(|s| s.telemetry_disabled = disabled)
    }

    /// Credential helper selection is not supported
    pub fn set_keychain(&self, helper: &str) -> AppResult<()> {
        Err(AppError::NotImplemented(format!(
            "selecting keychain helper '{helper}'"
        )))
    }

    pub async fn check_updates(&self) -> AppResult<Option<VersionInfo>> {
        self.updates.check(true).await
    }

    /// Compare every connected account's local stores with the remote
    ///
    /// # Errors
    ///
    /// Returns `Config` when the IMAP listener is not running.
    pub async fn check_consistency(&self) -> AppResult<ConsistencyReport> {
        let port = self
            .manager
            .status()
            .await?
            .imap_port
            .ok_or_else(|| AppError::Config("IMAP server is not running".to_owned()))?;
        let tls = if self.vault.settings().imap_ssl {
            Some(tls::local_connector(&self.config.settings_dir)?)
        } else {
            None
        };
        let endpoint = LocalEndpoint {
            port,
            tls,
            timeout: self.config.imap_timeout(),
        };

        let mut reports = Vec::new();
        for user in self.directory.list().await {
            if !user.is_connected() {
                continue;
            }
            reports.push(diagnostics::check_user(&user, &endpoint).await?);
        }
        Ok(ConsistencyReport::new(reports))
    }

    /// Stop every loop and both servers
    ///
    /// Returns once the server manager has finished closing.
    pub async fn close(&self) -> AppResult<()> {
        info!("closing bridge");
        self.cancel.cancel();
        self.directory.shutdown().await;
        let result = self.manager.close().await;
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        }
        result
    }
}
