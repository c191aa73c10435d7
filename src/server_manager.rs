//! Single-writer owner of the local IMAP and SMTP servers
//!
//! Every mutation of listener/engine state goes through a command channel
//! consumed by one task. The task also watches connectivity on the bus and
//! keeps the listeners bound exactly while at least one user is loaded and
//! the remote API is reachable.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Subscription};
use crate::engine::{
    Connector, ImapEngine, ImapEngineFactory, LocalListener, SmtpAccount, SmtpAccounts,
    SmtpEngine, SmtpEngineFactory,
};
use crate::errors::{AppError, AppResult};
use crate::events::{Event, EventKind};
use crate::monitor::ConnectionMonitor;
use crate::tls;
use crate::vault::{Settings, SyncStatus, Vault};

/// Queue depth for manager commands
const COMMAND_BUFFER: usize = 64;

/// Bind attempts before a port is reported as unavailable
const BIND_ATTEMPTS: u32 = 5;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(20);

type Reply<T> = oneshot::Sender<AppResult<T>>;

/// What the IMAP server needs to attach one account
#[derive(Clone)]
pub struct ImapUser {
    pub user_id: String,
    pub connectors: Vec<Arc<Connector>>,
    /// Passphrase protecting the account's local stores
    pub passphrase: SecretString,
}

impl std::fmt::Debug for ImapUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapUser")
            .field("user_id", &self.user_id)
            .field("connectors", &self.connectors)
            .finish_non_exhaustive()
    }
}

/// Snapshot of the manager's state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStatus {
    /// Bound IMAP port, if listening
    pub imap_port: Option<u16>,
    /// Bound SMTP port, if listening
    pub smtp_port: Option<u16>,
    pub loaded_users: usize,
    pub loaded_stores: usize,
    pub smtp_accounts: usize,
}

enum Command {
    Close {
        reply: Reply<()>,
    },
    RestartImap {
        reply: Reply<()>,
    },
    RestartSmtp {
        reply: Reply<()>,
    },
    SetListener {
        protocol: Protocol,
        setting: ListenerSetting,
        reply: Reply<()>,
    },
    AddImapUser {
        user: ImapUser,
        reply: Reply<()>,
    },
    RemoveImapUser {
        user_id: String,
        with_data: bool,
        reply: Reply<()>,
    },
    SetDataDir {
        path: PathBuf,
        reply: Reply<()>,
    },
    AddOpaqueUser {
        connector: Arc<Connector>,
        passphrase: SecretString,
        reply: Reply<String>,
    },
    RemoveOpaqueUser {
        store_id: String,
        with_data: bool,
        reply: Reply<()>,
    },
    AddSmtpAccount {
        account: SmtpAccount,
        reply: Reply<()>,
    },
    RemoveSmtpAccount {
        user_id: String,
        reply: Reply<()>,
    },
    Status {
        reply: Reply<ServerStatus>,
    },
}

/// Collaborators the manager is built from
pub struct ManagerDeps {
    pub settings_dir: PathBuf,
    pub vault: Arc<Vault>,
    pub bus: EventBus,
    pub monitor: Arc<ConnectionMonitor>,
    pub imap_factory: Arc<dyn ImapEngineFactory>,
    pub smtp_factory: Arc<dyn SmtpEngineFactory>,
}

/// Handle to the manager task (cheap to clone)
#[derive(Clone)]
pub struct ServerManager {
    tx: mpsc::Sender<Command>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ServerManager {
    /// Build the engines and start the manager task
    ///
    /// # Errors
    ///
    /// Returns whatever the engine factories return when they cannot build
    /// the initial servers.
    pub fn spawn(deps: ManagerDeps) -> AppResult<Self> {
        // Subscribe before sampling the monitor so no transition is missed.
        let conn = deps
            .bus
            .subscribe(&[EventKind::ConnStatusUp, EventKind::ConnStatusDown]);
        let net_up = deps.monitor.is_up();

        let data_dir = deps.vault.settings().data_dir;
        let imap = deps.imap_factory.build(&data_dir)?;
        let smtp_accounts = SmtpAccounts::default();
        let smtp = deps.smtp_factory.build(smtp_accounts.clone())?;

        let actor = Actor {
            settings_dir: deps.settings_dir,
            vault: deps.vault,
            bus: deps.bus,
            imap_factory: deps.imap_factory,
            smtp_factory: deps.smtp_factory,
            imap: Some(imap),
            smtp,
            smtp_accounts,
            imap_listener: None,
            smtp_listener: None,
            loaded: HashMap::new(),
            parked: Vec::new(),
            net_up,
        };

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(actor.run(rx, conn));
        Ok(Self {
            tx,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> AppResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| AppError::Invariant("server manager is not running".to_owned()))?;
        rx.await.map_err(|_| {
            AppError::Invariant("server manager dropped a request without replying".to_owned())
        })?
    }

    /// Stop both servers and wait for the manager task to exit
    ///
    /// Calling it again after the task exited is a no-op.
    pub async fn close(&self) -> AppResult<()> {
        let result = match self.request(|reply| Command::Close { reply }).await {
            Err(AppError::Invariant(_)) => Ok(()),
            other => other,
        };
        if let Some(task) = self.task.lock().await.take()
            && let Err(e) = task.await
        {
            error!(error = %e, "server manager task failed");
        }
        result
    }

    pub async fn restart_imap(&self) -> AppResult<()> {
        self.request(|reply| Command::RestartImap { reply }).await
    }

    pub async fn restart_smtp(&self) -> AppResult<()> {
        self.request(|reply| Command::RestartSmtp { reply }).await
    }

    /// Listen for IMAP on `port` from now on
    ///
    /// # Errors
    ///
    /// Returns `Config` if the port is taken or the server cannot be
    /// restarted on it; the previous port stays in effect.
    pub async fn set_imap_port(&self, port: u16) -> AppResult<()> {
        self.set_listener(Protocol::Imap, ListenerSetting::Port(port))
            .await
    }

    /// Listen for SMTP on `port` from now on
    ///
    /// # Errors
    ///
    /// Same as [`ServerManager::set_imap_port`].
    pub async fn set_smtp_port(&self, port: u16) -> AppResult<()> {
        self.set_listener(Protocol::Smtp, ListenerSetting::Port(port))
            .await
    }

    pub async fn set_imap_tls(&self, enabled: bool) -> AppResult<()> {
        self.set_listener(Protocol::Imap, ListenerSetting::Tls(enabled))
            .await
    }

    pub async fn set_smtp_tls(&self, enabled: bool) -> AppResult<()> {
        self.set_listener(Protocol::Smtp, ListenerSetting::Tls(enabled))
            .await
    }

    async fn set_listener(&self, protocol: Protocol, setting: ListenerSetting) -> AppResult<()> {
        self.request(|reply| Command::SetListener {
            protocol,
            setting,
            reply,
        })
        .await
    }

    /// Attach every binding of an account to the IMAP server
    ///
    /// Bindings that are already loaded are left alone; loaded bindings the
    /// account no longer has are removed with their data.
    pub async fn add_imap_user(&self, user: ImapUser) -> AppResult<()> {
        self.request(|reply| Command::AddImapUser { user, reply })
            .await
    }

    /// Detach an account; `with_data` also deletes its stores
    pub async fn remove_imap_user(&self, user_id: &str, with_data: bool) -> AppResult<()> {
        let user_id = user_id.to_owned();
        self.request(|reply| Command::RemoveImapUser {
            user_id,
            with_data,
            reply,
        })
        .await
    }

    /// Move the mailbox stores to `path`
    ///
    /// # Errors
    ///
    /// Returns `Config` if the data cannot be moved; the previous directory
    /// stays in effect.
    pub async fn set_data_dir(&self, path: PathBuf) -> AppResult<()> {
        self.request(|reply| Command::SetDataDir { path, reply })
            .await
    }

    /// Create a store that no tracked account owns
    pub async fn add_opaque_user(
        &self,
        connector: Arc<Connector>,
        passphrase: SecretString,
    ) -> AppResult<String> {
        self.request(|reply| Command::AddOpaqueUser {
            connector,
            passphrase,
            reply,
        })
        .await
    }

    pub async fn remove_opaque_user(&self, store_id: &str, with_data: bool) -> AppResult<()> {
        let store_id = store_id.to_owned();
        self.request(|reply| Command::RemoveOpaqueUser {
            store_id,
            with_data,
            reply,
        })
        .await
    }

    pub async fn add_smtp_account(&self, account: SmtpAccount) -> AppResult<()> {
        self.request(|reply| Command::AddSmtpAccount { account, reply })
            .await
    }

    pub async fn remove_smtp_account(&self, user_id: &str) -> AppResult<()> {
        let user_id = user_id.to_owned();
        self.request(|reply| Command::RemoveSmtpAccount { user_id, reply })
            .await
    }

    pub async fn status(&self) -> AppResult<ServerStatus> {
        self.request(|reply| Command::Status { reply }).await
    }
}

struct RunningListener {
    port: u16,
    shutdown: CancellationToken,
}

struct LoadedUser {
    user: ImapUser,
    /// Store ID per binding
    stores: HashMap<String, String>,
}

#[derive(Clone, Copy, Debug)]
enum Protocol {
    Imap,
    Smtp,
}

impl Protocol {
    fn ready(self, port: u16) -> Event {
        match self {
            Self::Imap => Event::ImapServerReady { port },
            Self::Smtp => Event::SmtpServerReady { port },
        }
    }

    fn stopped(self) -> Event {
        match self {
            Self::Imap => Event::ImapServerStopped,
            Self::Smtp => Event::SmtpServerStopped,
        }
    }

    fn error(self, error: String) -> Event {
        match self {
            Self::Imap => Event::ImapServerError { error },
            Self::Smtp => Event::SmtpServerError { error },
        }
    }
}

/// Persisted listener setting changed through the manager
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ListenerSetting {
    Port(u16),
    Tls(bool),
}

impl ListenerSetting {
    /// The persisted value of the same setting
    fn current(self, protocol: Protocol, settings: &Settings) -> Self {
        match (self, protocol) {
            (Self::Port(_), Protocol::Imap) => Self::Port(settings.imap_port),
            (Self::Port(_), Protocol::Smtp) => Self::Port(settings.smtp_port),
            (Self::Tls(_), Protocol::Imap) => Self::Tls(settings.imap_ssl),
            (Self::Tls(_), Protocol::Smtp) => Self::Tls(settings.smtp_ssl),
        }
    }

    fn persist(self, protocol: Protocol, vault: &Vault) -> AppResult<()> {
        match (self, protocol) {
            (Self::Port(port), Protocol::Imap) => vault.set_imap_port(port),
            (Self::Port(port), Protocol::Smtp) => vault.set_smtp_port(port),
            (Self::Tls(enabled), Protocol::Imap) => vault.set_imap_ssl(enabled),
            (Self::Tls(enabled), Protocol::Smtp) => vault.set_smtp_ssl(enabled),
        }
    }
}

struct Actor {
    settings_dir: PathBuf,
    vault: Arc<Vault>,
    bus: EventBus,
    imap_factory: Arc<dyn ImapEngineFactory>,
    smtp_factory: Arc<dyn SmtpEngineFactory>,
    /// `None` only after a data directory change left no buildable engine
    imap: Option<Arc<dyn ImapEngine>>,
    smtp: Arc<dyn SmtpEngine>,
    smtp_accounts: SmtpAccounts,
    imap_listener: Option<RunningListener>,
    smtp_listener: Option<RunningListener>,
    loaded: HashMap<String, LoadedUser>,
    /// Accounts waiting for an IMAP engine to attach to
    parked: Vec<ImapUser>,
    net_up: bool,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, mut conn: Subscription) {
        info!(net_up = self.net_up, "server manager started");
        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else {
                        // Every handle is gone.
                        if let Err(e) = self.shutdown().await {
                            warn!(error = %e, "server manager shutdown failed");
                        }
                        break;
                    };
                    if let Command::Close { reply } = command {
                        let result = self.shutdown().await;
                        let _ = reply.send(result);
                        break;
                    }
                    self.handle(command).await;
                }
                Some(event) = conn.recv() => {
                    self.net_up = match event {
                        Event::ConnStatusUp => true,
                        Event::ConnStatusDown => false,
                        _ => continue,
                    };
                    debug!(net_up = self.net_up, "server manager observed connectivity change");
                    self.apply_predicate().await;
                }
            }
        }
        info!("server manager stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Close { .. } => {}
            Command::RestartImap { reply } => {
                let result = self.restart_imap().await;
                self.apply_predicate().await;
                let _ = reply.send(result);
            }
            Command::RestartSmtp { reply } => {
                let result = self.restart_smtp().await;
                self.apply_predicate().await;
                let _ = reply.send(result);
            }
            Command::SetListener {
                protocol,
                setting,
                reply,
            } => {
                let result = self.change_listener(protocol, setting).await;
                self.apply_predicate().await;
                let _ = reply.send(result);
            }
            Command::AddImapUser { user, reply } => {
                let result = self.add_imap_user(user).await;
                self.apply_predicate().await;
                let _ = reply.send(result);
            }
            Command::RemoveImapUser {
                user_id,
                with_data,
                reply,
            } => {
                let result = self.remove_imap_user(&user_id, with_data).await;
                self.apply_predicate().await;
                let _ = reply.send(result);
            }
            Command::SetDataDir { path, reply } => {
                let result = self.set_data_dir(path).await;
                self.apply_predicate().await;
                let _ = reply.send(result);
            }
            Command::AddOpaqueUser {
                connector,
                passphrase,
                reply,
            } => {
                let _ = reply.send(self.add_opaque_user(connector, &passphrase).await);
            }
            Command::RemoveOpaqueUser {
                store_id,
                with_data,
                reply,
            } => {
                let _ = reply.send(self.remove_opaque_user(&store_id, with_data).await);
            }
            Command::AddSmtpAccount { account, reply } => {
                debug!(user_id = %account.user_id, "adding SMTP account");
                self.smtp_accounts.insert(account);
                let _ = reply.send(Ok(()));
            }
            Command::RemoveSmtpAccount { user_id, reply } => {
                if !self.smtp_accounts.remove(&user_id) {
                    debug!(user_id = %user_id, "SMTP account was not registered");
                }
                let _ = reply.send(Ok(()));
            }
            Command::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
            }
        }
    }

    fn status(&self) -> ServerStatus {
        ServerStatus {
            imap_port: self.imap_listener.as_ref().map(|l| l.port),
            smtp_port: self.smtp_listener.as_ref().map(|l| l.port),
            loaded_users: self.loaded.len(),
            loaded_stores: self.loaded.values().map(|l| l.stores.len()).sum(),
            smtp_accounts: self.smtp_accounts.len(),
        }
    }

    fn imap(&self) -> AppResult<Arc<dyn ImapEngine>> {
        self.imap
            .clone()
            .ok_or_else(|| AppError::Invariant("IMAP engine is not available".to_owned()))
    }

    fn should_run(&self) -> bool {
        !self.loaded.is_empty() && self.net_up
    }

    /// Bind or release the listeners so they match the run predicate
    async fn apply_predicate(&mut self) {
        let should_run = self.should_run();
        for protocol in [Protocol::Imap, Protocol::Smtp] {
            let running = self.listener_slot(protocol).is_some();
            if should_run && !running {
                if let Err(e) = self.start_listener(protocol).await {
                    debug!(?protocol, error = %e, "listener stays down");
                }
            } else if !should_run && running {
                self.stop_listener(protocol);
            }
        }
    }

    fn listener_slot(&mut self, protocol: Protocol) -> &mut Option<RunningListener> {
        match protocol {
            Protocol::Imap => &mut self.imap_listener,
            Protocol::Smtp => &mut self.smtp_listener,
        }
    }

    fn tls_acceptor(&self) -> AppResult<TlsAcceptor> {
        tls::ensure_certificate(&self.settings_dir)?;
        tls::load_acceptor(&self.settings_dir)
    }

    /// Bind and serve one protocol with its persisted settings
    ///
    /// Failures are published as events before they are returned.
    async fn start_listener(&mut self, protocol: Protocol) -> AppResult<()> {
        let settings = self.vault.settings();
        let (port, use_tls) = match protocol {
            Protocol::Imap => (settings.imap_port, settings.imap_ssl),
            Protocol::Smtp => (settings.smtp_port, settings.smtp_ssl),
        };

        let acceptor = if use_tls {
            match self.tls_acceptor() {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    error!(?protocol, error = %e, "cannot load bridge TLS certificate");
                    self.bus.publish(Event::TlsIssue {
                        error: e.to_string(),
                    });
                    self.bus.publish(protocol.error(e.to_string()));
                    return Err(e);
                }
            }
        } else {
            None
        };

        let listener = match bind_local(port, acceptor).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(?protocol, port, error = %e, "cannot start local server");
                self.bus.publish(protocol.error(e.to_string()));
                return Err(e);
            }
        };

        let port = listener.port();
        let shutdown = listener.shutdown_token();
        let served = match protocol {
            Protocol::Imap => match self.imap() {
                Ok(imap) => imap.serve(listener).await,
                Err(e) => Err(e),
            },
            Protocol::Smtp => self.smtp.serve(listener).await,
        };
        if let Err(e) = served {
            shutdown.cancel();
            error!(?protocol, port, error = %e, "local server refused to serve");
            self.bus.publish(protocol.error(e.to_string()));
            return Err(e);
        }

        info!(?protocol, port, tls = use_tls, "local server listening");
        *self.listener_slot(protocol) = Some(RunningListener { port, shutdown });
        self.bus.publish(protocol.ready(port));
        Ok(())
    }

    fn stop_listener(&mut self, protocol: Protocol) {
        if let Some(listener) = self.listener_slot(protocol).take() {
            listener.shutdown.cancel();
            info!(?protocol, port = listener.port, "local server stopped");
            self.bus.publish(protocol.stopped());
        }
    }

    /// Persist a listener setting and restart the server with it
    ///
    /// A setting the server cannot run with is reverted and the server is
    /// restarted with the previous value.
    async fn change_listener(&mut self, protocol: Protocol, setting: ListenerSetting) -> AppResult<()> {
        let previous = setting.current(protocol, &self.vault.settings());
        if previous == setting {
            return Ok(());
        }
        if let ListenerSetting::Port(port) = setting {
            ensure_port_free(port).await?;
        }

        setting.persist(protocol, &self.vault)?;
        info!(?protocol, ?setting, "applying listener setting");
        let Err(e) = self.rebind(protocol).await else {
            return Ok(());
        };

        warn!(?protocol, ?setting, error = %e, "listener setting rejected, reverting");
        if let Err(revert) = previous.persist(protocol, &self.vault) {
            error!(?protocol, error = %revert, "failed to revert listener setting");
        }
        if let Err(restart) = self.rebind(protocol).await {
            error!(?protocol, error = %restart, "server did not come back with the previous setting");
        }
        Err(AppError::Config(format!(
            "cannot apply {setting:?} to the {protocol:?} server: {e}"
        )))
    }

    /// Restart one server and bind it right away if it should be listening
    async fn rebind(&mut self, protocol: Protocol) -> AppResult<()> {
        match protocol {
            Protocol::Imap => self.restart_imap().await?,
            Protocol::Smtp => self.restart_smtp().await?,
        }
        if self.should_run() && self.listener_slot(protocol).is_none() {
            self.start_listener(protocol).await?;
        }
        Ok(())
    }

    async fn add_imap_user(&mut self, user: ImapUser) -> AppResult<()> {
        let user_id = user.user_id.clone();
        let imap = match self.imap() {
            Ok(imap) => imap,
            Err(e) => {
                warn!(user_id = %user_id, "no IMAP engine, parking user until the next restart");
                self.parked.retain(|u| u.user_id != user_id);
                self.parked.push(user);
                return Err(e);
            }
        };
        let mut stores = self
            .loaded
            .remove(&user_id)
            .map(|loaded| loaded.stores)
            .unwrap_or_default();

        let mut attached_now = Vec::new();
        for connector in &user.connectors {
            let binding = connector.binding_id().to_owned();
            if stores.contains_key(&binding) {
                debug!(user_id = %user_id, binding_id = %binding, "binding already loaded");
                continue;
            }
            match self.attach_binding(&imap, &user, connector).await {
                Ok(store_id) => {
                    attached_now.push(store_id.clone());
                    stores.insert(binding, store_id);
                }
                Err(e) => {
                    warn!(user_id = %user_id, binding_id = %binding, error = %e, "failed to attach binding, rolling back");
                    for store_id in &attached_now {
                        if let Err(e) = imap.remove_user(store_id, false).await {
                            warn!(store_id = %store_id, error = %e, "rollback detach failed");
                        }
                    }
                    stores.retain(|_, id| !attached_now.contains(id));
                    if !stores.is_empty() {
                        self.loaded.insert(
                            user_id,
                            LoadedUser {
                                user: user.clone(),
                                stores,
                            },
                        );
                    }
                    return Err(e);
                }
            }
        }

        let wanted: HashSet<&str> = user.connectors.iter().map(|c| c.binding_id()).collect();
        let stale: Vec<String> = stores
            .keys()
            .filter(|binding| !wanted.contains(binding.as_str()))
            .cloned()
            .collect();
        for binding in stale {
            if let Some(store_id) = stores.remove(&binding) {
                info!(user_id = %user_id, binding_id = %binding, "removing stale binding");
                if let Err(e) = imap.remove_user(&store_id, true).await {
                    warn!(store_id = %store_id, error = %e, "failed to remove stale store");
                }
                self.vault.update_user(&user_id, |r| {
                    r.store_ids.remove(&binding);
                })?;
            }
        }

        info!(user_id = %user_id, stores = stores.len(), "user attached to IMAP server");
        self.loaded.insert(user_id, LoadedUser { user, stores });
        Ok(())
    }

    /// Load, heal or create the store behind one binding
    async fn attach_binding(
        &self,
        imap: &Arc<dyn ImapEngine>,
        user: &ImapUser,
        connector: &Arc<Connector>,
    ) -> AppResult<String> {
        let record = self.vault.get_user(&user.user_id)?;
        let binding = connector.binding_id();
        let Some(store_id) = record.store_ids.get(binding).cloned() else {
            return self.create_store(imap, user, connector).await;
        };

        if !record.sync_status.has_labels {
            warn!(user_id = %user.user_id, store_id = %store_id, "store has no mailbox structure, recreating");
            self.discard_store(imap, &user.user_id, &store_id).await?;
            return self.create_store(imap, user, connector).await;
        }

        match imap
            .load_user(Arc::clone(connector), &store_id, &user.passphrase)
            .await
        {
            Ok(stats) if stats.message_count == 0 && record.sync_status.message_count > 0 => {
                warn!(user_id = %user.user_id, store_id = %store_id, synced = record.sync_status.message_count, "store is unexpectedly empty, recreating");
                if let Err(e) = imap.remove_user(&store_id, false).await {
                    warn!(store_id = %store_id, error = %e, "failed to detach empty store");
                }
                self.discard_store(imap, &user.user_id, &store_id).await?;
                self.create_store(imap, user, connector).await
            }
            Ok(stats) => {
                debug!(user_id = %user.user_id, store_id = %store_id, messages = stats.message_count, "store loaded");
                Ok(store_id)
            }
            Err(AppError::Store(reason)) => {
                warn!(user_id = %user.user_id, store_id = %store_id, reason = %reason, "store is corrupted, recreating");
                self.discard_store(imap, &user.user_id, &store_id).await?;
                self.create_store(imap, user, connector).await
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a store's data and force a full resync of its account
    async fn discard_store(
        &self,
        imap: &Arc<dyn ImapEngine>,
        user_id: &str,
        store_id: &str,
    ) -> AppResult<()> {
        if let Err(e) = imap.remove_user(store_id, true).await {
            warn!(store_id = %store_id, error = %e, "failed to delete store data");
        }
        self.vault.update_user(user_id, |r| {
            r.store_ids.retain(|_, id| id != store_id);
            r.sync_status = SyncStatus::default();
        })
    }

    async fn create_store(
        &self,
        imap: &Arc<dyn ImapEngine>,
        user: &ImapUser,
        connector: &Arc<Connector>,
    ) -> AppResult<String> {
        let store_id = imap
            .add_user(Arc::clone(connector), &user.passphrase)
            .await?;
        let binding = connector.binding_id().to_owned();
        let persisted = self.vault.update_user(&user.user_id, |r| {
            r.store_ids.insert(binding, store_id.clone());
            // A new store starts empty.
            r.sync_status = SyncStatus::default();
        });
        if let Err(e) = persisted {
            if let Err(remove_err) = imap.remove_user(&store_id, true).await {
                warn!(store_id = %store_id, error = %remove_err, "failed to drop unpersisted store");
            }
            return Err(e);
        }
        info!(user_id = %user.user_id, store_id = %store_id, "created local store");
        Ok(store_id)
    }

    async fn remove_imap_user(&mut self, user_id: &str, with_data: bool) -> AppResult<()> {
        self.parked.retain(|u| u.user_id != user_id);
        let store_ids: Vec<String> = match self.loaded.remove(user_id) {
            Some(loaded) => loaded.stores.into_values().collect(),
            // Signed-out accounts keep their stores on disk without being loaded.
            None if with_data => match self.vault.get_user(user_id) {
                Ok(record) => record.store_ids.into_values().collect(),
                Err(_) => Vec::new(),
            },
            None => {
                debug!(user_id = %user_id, "user was not attached to IMAP server");
                return Ok(());
            }
        };

        let mut first_error = None;
        if !store_ids.is_empty() {
            let imap = self.imap()?;
            for store_id in &store_ids {
                if let Err(e) = imap.remove_user(store_id, with_data).await {
                    warn!(user_id = %user_id, store_id = %store_id, error = %e, "failed to detach store");
                    first_error.get_or_insert(e);
                }
            }
        }
        if with_data {
            let cleared = self.vault.update_user(user_id, |r| {
                r.store_ids.clear();
                r.sync_status = SyncStatus::default();
            });
            match cleared {
                Ok(()) | Err(AppError::NotFound(_)) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        info!(user_id = %user_id, with_data, "user detached from IMAP server");
        first_error.map_or(Ok(()), Err)
    }

    async fn add_opaque_user(
        &self,
        connector: Arc<Connector>,
        passphrase: &SecretString,
    ) -> AppResult<String> {
        self.imap()?.add_user(connector, passphrase).await
    }

    async fn remove_opaque_user(&self, store_id: &str, with_data: bool) -> AppResult<()> {
        self.imap()?.remove_user(store_id, with_data).await
    }

    /// Re-attach accounts after the IMAP engine was replaced
    async fn reattach(&mut self, users: Vec<ImapUser>) {
        for user in users {
            let user_id = user.user_id.clone();
            if let Err(e) = self.add_imap_user(user).await {
                error!(user_id = %user_id, error = %e, "failed to reattach user");
            }
        }
    }

    /// Every loaded or parked account, leaving none attached
    fn detach_all(&mut self) -> Vec<ImapUser> {
        let mut users: Vec<ImapUser> = self.loaded.drain().map(|(_, loaded)| loaded.user).collect();
        users.append(&mut self.parked);
        users
    }

    async fn close_imap_engine(&mut self) {
        self.stop_listener(Protocol::Imap);
        if let Some(imap) = self.imap.take()
            && let Err(e) = imap.close().await
        {
            warn!(error = %e, "IMAP engine close failed");
        }
    }

    /// Close the current IMAP engine and move every account onto `engine`
    async fn replace_imap_engine(&mut self, engine: Option<Arc<dyn ImapEngine>>) {
        self.close_imap_engine().await;
        let users = self.detach_all();
        self.imap = engine;
        self.reattach(users).await;
    }

    fn build_imap(&self, data_dir: &Path) -> Option<Arc<dyn ImapEngine>> {
        match self.imap_factory.build(data_dir) {
            Ok(engine) => Some(engine),
            Err(e) => {
                error!(data_dir = %data_dir.display(), error = %e, "cannot build IMAP engine");
                None
            }
        }
    }

    /// Rebuild the IMAP engine and reattach every account
    ///
    /// The running engine and its accounts are left untouched when the new
    /// engine cannot be built.
    async fn restart_imap(&mut self) -> AppResult<()> {
        info!("restarting IMAP server");
        let data_dir = self.vault.settings().data_dir;
        let rebuilt = self.imap_factory.build(&data_dir)?;
        self.replace_imap_engine(Some(rebuilt)).await;
        Ok(())
    }

    async fn restart_smtp(&mut self) -> AppResult<()> {
        info!("restarting SMTP server");
        let rebuilt = self.smtp_factory.build(self.smtp_accounts.clone())?;
        self.stop_listener(Protocol::Smtp);
        if let Err(e) = self.smtp.close().await {
            warn!(error = %e, "SMTP engine close failed");
        }
        self.smtp = rebuilt;
        Ok(())
    }

    async fn set_data_dir(&mut self, new_dir: PathBuf) -> AppResult<()> {
        let old_dir = self.vault.settings().data_dir;
        if old_dir == new_dir {
            return Ok(());
        }
        if new_dir.starts_with(&old_dir) {
            return Err(AppError::Config(format!(
                "{} is inside the current data directory",
                new_dir.display()
            )));
        }

        info!(from = %old_dir.display(), to = %new_dir.display(), "moving mailbox data");
        // The stores must be released before their files move.
        self.close_imap_engine().await;
        let users = self.detach_all();

        let moved = match self.vault.set_data_dir(&new_dir) {
            Ok(()) => move_dir(&old_dir, &new_dir).await,
            Err(e) => Err(e),
        };
        let (engine, result) = match moved {
            Ok(()) => match self.imap_factory.build(&new_dir) {
                Ok(engine) => (Some(engine), Ok(())),
                Err(e) => {
                    error!(error = %e, "cannot open moved mailbox data, moving it back");
                    if let Err(back) = move_dir(&new_dir, &old_dir).await {
                        error!(error = %back, "failed to move mailbox data back");
                    }
                    self.revert_data_dir(&old_dir);
                    (
                        self.build_imap(&self.vault.settings().data_dir),
                        Err(AppError::Config(format!(
                            "cannot open mailbox data in {}: {e}",
                            new_dir.display()
                        ))),
                    )
                }
            },
            Err(e) => {
                error!(error = %e, "moving mailbox data failed, keeping previous directory");
                self.revert_data_dir(&old_dir);
                (
                    self.build_imap(&old_dir),
                    Err(AppError::Config(format!(
                        "cannot move mailbox data to {}: {e}",
                        new_dir.display()
                    ))),
                )
            }
        };

        self.imap = engine;
        self.reattach(users).await;
        result
    }

    fn revert_data_dir(&self, old_dir: &Path) {
        if let Err(e) = self.vault.set_data_dir(old_dir) {
            error!(error = %e, "failed to revert data directory setting");
        }
    }

    async fn shutdown(&mut self) -> AppResult<()> {
        self.stop_listener(Protocol::Imap);
        self.stop_listener(Protocol::Smtp);
        self.loaded.clear();
        self.parked.clear();
        let imap = match self.imap.take() {
            Some(imap) => imap.close().await,
            None => Ok(()),
        };
        let smtp = self.smtp.close().await;
        imap.and(smtp)
    }
}

/// Bind a local listener, retrying while a just-stopped one releases the port
async fn bind_local(port: u16, acceptor: Option<TlsAcceptor>) -> AppResult<LocalListener> {
    let mut attempt = 1;
    loop {
        match LocalListener::bind(port, acceptor.clone()).await {
            Ok(listener) => return Ok(listener),
            Err(e) if port != 0 && attempt < BIND_ATTEMPTS => {
                debug!(port, attempt, error = %e, "bind failed, retrying");
                attempt += 1;
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Fail with `Config` when something already listens on `port`
async fn ensure_port_free(port: u16) -> AppResult<()> {
    if port == 0 {
        return Ok(());
    }
    TcpListener::bind(("127.0.0.1", port))
        .await
        .map(drop)
        .map_err(|e| AppError::Config(format!("port {port} is not available: {e}")))
}

/// Move a directory tree, copying when a rename is not possible
async fn move_dir(from: &Path, to: &Path) -> AppResult<()> {
    if tokio::fs::try_exists(to).await? {
        let mut entries = tokio::fs::read_dir(to).await?;
        if entries.next_entry().await?.is_some() {
            return Err(AppError::Config(format!("{} is not empty", to.display())));
        }
        tokio::fs::remove_dir(to).await?;
    }
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if !tokio::fs::try_exists(from).await? {
        tokio::fs::create_dir_all(to).await?;
        return Ok(());
    }
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }

    let (from, to) = (from.to_path_buf(), to.to_path_buf());
    tokio::task::spawn_blocking(move || -> AppResult<()> {
        if let Err(e) = copy_dir_all(&from, &to) {
            let _ = std::fs::remove_dir_all(&to);
            return Err(e);
        }
        std::fs::remove_dir_all(&from)?;
        Ok(())
    })
    .await
    .map_err(|e| AppError::Internal(format!("data move task failed: {e}")))?
}

fn copy_dir_all(from: &Path, to: &Path) -> AppResult<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use secrecy::SecretString;

    use super::{ImapUser, ServerManager};
    use crate::engine::Connector;
    use crate::errors::AppError;
    use crate::tls;
    use crate::events::{Event, EventKind};
    use crate::test_support::{Harness, wait_for_event};
    use crate::vault::{Sensitive, UserRecord};

    fn imap_user(user_id: &str, bindings: &[&str]) -> ImapUser {
        ImapUser {
            user_id: user_id.to_owned(),
            connectors: bindings
                .iter()
                .map(|b| {
                    Connector::new(
                        user_id,
                        *b,
                        vec![format!("{b}@example.com")],
                        SecretString::new("bridge".into()),
                    )
                })
                .collect(),
            passphrase: SecretString::new("keys".into()),
        }
    }

    fn seed(harness: &Harness, user_id: &str) {
        harness
            .vault
            .add_user(UserRecord {
                user_id: user_id.to_owned(),
                auth_uid: "uid".to_owned(),
                auth_ref: Sensitive::new("token"),
                ..UserRecord::default()
            })
            .expect("seed user");
    }

    async fn manager(harness: &Harness) -> ServerManager {
        ServerManager::spawn(harness.manager_deps()).expect("spawn manager")
    }

    #[tokio::test]
    async fn listeners_follow_loaded_users() {
        let harness = Harness::new();
        seed(&harness, "u1");
        let mut events = harness.bus.subscribe(&[
            EventKind::ImapServerReady,
            EventKind::ImapServerStopped,
            EventKind::SmtpServerReady,
        ]);
        let manager = manager(&harness).await;
        assert_eq!(manager.status().await.expect("status").imap_port, None);

        manager
            .add_imap_user(imap_user("u1", &["a1"]))
            .await
            .expect("add user");
        let status = manager.status().await.expect("status");
        assert!(status.imap_port.is_some());
        assert!(status.smtp_port.is_some());
        assert!(matches!(
            wait_for_event(&mut events, EventKind::ImapServerReady).await,
            Event::ImapServerReady { .. }
        ));

        manager.remove_imap_user("u1", false).await.expect("remove");
        wait_for_event(&mut events, EventKind::ImapServerStopped).await;
        let status = manager.status().await.expect("status");
        assert_eq!(status.imap_port, None);
        assert_eq!(status.smtp_port, None);

        manager.close().await.expect("close");
        manager.close().await.expect("second close is a no-op");
    }

    #[tokio::test]
    async fn adding_same_user_twice_counts_once() {
        let harness = Harness::new();
        seed(&harness, "u1");
        let manager = manager(&harness).await;
        let user = imap_user("u1", &["a1"]);

        manager.add_imap_user(user.clone()).await.expect("first add");
        manager.add_imap_user(user).await.expect("second add");

        let status = manager.status().await.expect("status");
        assert_eq!(status.loaded_users, 1);
        assert_eq!(status.loaded_stores, 1);
        assert_eq!(harness.imap.created_count(), 1);
        manager.close().await.expect("close");
    }

    #[tokio::test]
    async fn concurrent_adds_count_each_user_once() {
        let harness = Harness::new();
        seed(&harness, "u1");
        seed(&harness, "u2");
        let manager = manager(&harness).await;

        let (a, b) = tokio::join!(
            manager.add_imap_user(imap_user("u1", &["a1"])),
            manager.add_imap_user(imap_user("u2", &["b1", "b2"])),
        );
        a.expect("u1");
        b.expect("u2");

        let status = manager.status().await.expect("status");
        assert_eq!(status.loaded_users, 2);
        assert_eq!(status.loaded_stores, 3);
        manager.close().await.expect("close");
    }

    #[tokio::test]
    async fn store_without_labels_is_recreated() {
        let harness = Harness::new();
        seed(&harness, "u1");
        let manager = manager(&harness).await;
        let user = imap_user("u1", &["a1"]);

        manager.add_imap_user(user.clone()).await.expect("add");
        let first = harness.vault.get_user("u1").expect("u1").store_ids["a1"].clone();
        manager.remove_imap_user("u1", false).await.expect("detach");

        // Labels were never synced into the store.
        manager.add_imap_user(user).await.expect("re-add");
        let second = harness.vault.get_user("u1").expect("u1").store_ids["a1"].clone();
        assert_ne!(first, second);
        assert!(!harness.imap.store_exists(&first));
        manager.close().await.expect("close");
    }

    #[tokio::test]
    async fn empty_store_with_synced_messages_is_treated_as_corrupted() {
        let harness = Harness::new();
        seed(&harness, "u1");
        let manager = manager(&harness).await;
        let user = imap_user("u1", &["a1"]);

        manager.add_imap_user(user.clone()).await.expect("add");
        manager.remove_imap_user("u1", false).await.expect("detach");
        harness
            .vault
            .update_user("u1", |r| {
                r.sync_status.has_labels = true;
                r.sync_status.has_messages = true;
                r.sync_status.message_count = 3;
            })
            .expect("mark synced");

        manager.add_imap_user(user).await.expect("re-add");
        let record = harness.vault.get_user("u1").expect("u1");
        assert!(!record.sync_status.has_messages);
        assert_eq!(harness.imap.created_count(), 2);
        manager.close().await.expect("close");
    }

    #[tokio::test]
    async fn synced_empty_mailbox_is_reloaded() {
        let harness = Harness::new();
        seed(&harness, "u1");
        let manager = manager(&harness).await;
        let user = imap_user("u1", &["a1"]);

        manager.add_imap_user(user.clone()).await.expect("add");
        let store_id = harness.vault.get_user("u1").expect("u1").store_ids["a1"].clone();
        manager.remove_imap_user("u1", false).await.expect("detach");
        harness
            .vault
            .update_user("u1", |r| {
                r.sync_status.has_labels = true;
                r.sync_status.has_messages = true;
            })
            .expect("mark synced");

        manager.add_imap_user(user).await.expect("re-add");
        let record = harness.vault.get_user("u1").expect("u1");
        assert!(record.sync_status.is_complete());
        assert_eq!(record.store_ids["a1"], store_id);
        assert_eq!(harness.imap.created_count(), 1);
        manager.close().await.expect("close");
    }

    #[tokio::test]
    async fn failed_imap_rebuild_keeps_users_and_listeners() {
        let harness = Harness::new();
        seed(&harness, "u1");
        let manager = manager(&harness).await;
        manager
            .add_imap_user(imap_user("u1", &["a1"]))
            .await
            .expect("add");
        let before = manager.status().await.expect("status");
        assert!(before.imap_port.is_some());

        harness.imap.fail_builds(1);
        let err = manager.restart_imap().await.expect_err("build fails");
        assert!(matches!(err, AppError::Store(_)));

        let after = manager.status().await.expect("status");
        assert_eq!(after, before);
        let store_id = harness.vault.get_user("u1").expect("u1").store_ids["a1"].clone();
        assert!(harness.imap.store(&store_id).expect("store").attached);

        manager.restart_imap().await.expect("second restart");
        let status = manager.status().await.expect("status");
        assert_eq!(status.loaded_users, 1);
        assert!(status.imap_port.is_some());
        manager.close().await.expect("close");
    }

    #[tokio::test]
    async fn unopenable_data_dir_is_moved_back() {
        let harness = Harness::new();
        seed(&harness, "u1");
        let manager = manager(&harness).await;
        manager
            .add_imap_user(imap_user("u1", &["a1"]))
            .await
            .expect("add");
        let old_dir = harness.vault.settings().data_dir;
        std::fs::create_dir_all(&old_dir).expect("data dir");
        std::fs::write(old_dir.join("store.db"), b"data").expect("write store");
        let new_dir = harness.dir.path().join("moved");

        harness.imap.fail_builds(1);
        let err = manager.set_data_dir(new_dir.clone()).await.expect_err("open fails");
        assert!(matches!(err, AppError::Config(_)));
        assert_eq!(harness.vault.settings().data_dir, old_dir);
        assert!(old_dir.join("store.db").is_file());
        assert!(!new_dir.join("store.db").exists());
        assert_eq!(harness.imap.data_dirs().last(), Some(&old_dir));

        let status = manager.status().await.expect("status");
        assert_eq!(status.loaded_users, 1);
        assert!(status.imap_port.is_some());
        assert!(status.smtp_port.is_some());
        manager.close().await.expect("close");
    }

    #[tokio::test]
    async fn users_without_engine_wait_for_the_next_restart() {
        let harness = Harness::new();
        seed(&harness, "u1");
        let manager = manager(&harness).await;
        manager
            .add_imap_user(imap_user("u1", &["a1"]))
            .await
            .expect("add");
        let occupied = harness.dir.path().join("occupied");
        std::fs::create_dir_all(&occupied).expect("mkdir");
        std::fs::write(occupied.join("other"), b"x").expect("write");

        // The move fails and the previous directory cannot be reopened.
        harness.imap.fail_builds(1);
        manager.set_data_dir(occupied).await.expect_err("move fails");
        let status = manager.status().await.expect("status");
        assert_eq!(status.loaded_users, 0);
        assert_eq!(status.imap_port, None);
        assert_eq!(status.smtp_port, None);
        let connector = Connector::new("import", "import", vec![], SecretString::new("x".into()));
        assert!(matches!(
            manager
                .add_opaque_user(connector, SecretString::new("pass".into()))
                .await,
            Err(AppError::Invariant(_))
        ));

        manager.restart_imap().await.expect("engine back");
        let status = manager.status().await.expect("status");
        assert_eq!(status.loaded_users, 1);
        assert!(status.imap_port.is_some());
        manager.close().await.expect("close");
    }

    #[tokio::test]
    async fn bind_failure_is_reported_without_losing_users() {
        let harness = Harness::new();
        seed(&harness, "u1");
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind blocker");
        let port = blocker.local_addr().expect("addr").port();
        harness.vault.set_imap_port(port).expect("set port");

        let mut events = harness.bus.subscribe(&[EventKind::ImapServerError]);
        let manager = manager(&harness).await;
        manager
            .add_imap_user(imap_user("u1", &["a1"]))
            .await
            .expect("add");

        wait_for_event(&mut events, EventKind::ImapServerError).await;
        let status = manager.status().await.expect("status");
        assert_eq!(status.imap_port, None);
        assert_eq!(status.loaded_users, 1);

        drop(blocker);
        manager.restart_imap().await.expect("restart");
        assert_eq!(manager.status().await.expect("status").imap_port, Some(port));
        manager.close().await.expect("close");
    }

    #[tokio::test]
    async fn taken_port_is_rejected_and_listener_kept() {
        let harness = Harness::new();
        seed(&harness, "u1");
        let manager = manager(&harness).await;
        manager
            .add_imap_user(imap_user("u1", &["a1"]))
            .await
            .expect("add");
        let before = manager.status().await.expect("status").imap_port;
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind blocker");
        let taken = blocker.local_addr().expect("addr").port();

        let err = manager.set_imap_port(taken).await.expect_err("taken");
        assert!(matches!(err, AppError::Config(_)));
        assert_eq!(harness.vault.settings().imap_port, 0);
        assert_eq!(manager.status().await.expect("status").imap_port, before);
        manager.close().await.expect("close");
    }

    #[tokio::test]
    async fn port_change_rebinds_the_listener() {
        let harness = Harness::new();
        seed(&harness, "u1");
        let manager = manager(&harness).await;
        manager
            .add_imap_user(imap_user("u1", &["a1"]))
            .await
            .expect("add");
        let port = {
            let free = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind");
            free.local_addr().expect("addr").port()
        };

        manager.set_smtp_port(port).await.expect("set port");
        assert_eq!(harness.vault.settings().smtp_port, port);
        let status = manager.status().await.expect("status");
        assert_eq!(status.smtp_port, Some(port));
        assert_eq!(status.loaded_users, 1);
        manager.close().await.expect("close");
    }

    #[tokio::test]
    async fn unusable_certificate_reverts_tls_setting() {
        let harness = Harness::new();
        seed(&harness, "u1");
        let paths = tls::CertPaths::in_dir(&harness.manager_deps().settings_dir);
        std::fs::create_dir_all(paths.cert.parent().expect("parent")).expect("mkdir");
        std::fs::write(&paths.cert, "not a pem").expect("write cert");
        std::fs::write(&paths.key, "not a pem").expect("write key");
        let mut events = harness.bus.subscribe(&[EventKind::TlsIssue]);
        let manager = manager(&harness).await;
        manager
            .add_imap_user(imap_user("u1", &["a1"]))
            .await
            .expect("add");

        let err = manager.set_imap_tls(true).await.expect_err("bad certificate");
        assert!(matches!(err, AppError::Config(_)));
        wait_for_event(&mut events, EventKind::TlsIssue).await;
        assert!(!harness.vault.settings().imap_ssl);
        let status = manager.status().await.expect("status");
        assert!(status.imap_port.is_some());
        assert_eq!(status.loaded_users, 1);
        manager.close().await.expect("close");
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_servers() {
        let harness = Harness::new();
        seed(&harness, "u1");
        let mut events = harness.bus.subscribe(&[
            EventKind::ImapServerReady,
            EventKind::ImapServerStopped,
        ]);
        let manager = manager(&harness).await;
        manager
            .add_imap_user(imap_user("u1", &["a1"]))
            .await
            .expect("add");
        wait_for_event(&mut events, EventKind::ImapServerReady).await;

        drop(manager);
        wait_for_event(&mut events, EventKind::ImapServerStopped).await;
    }

    #[tokio::test]
    async fn set_data_dir_moves_stores_and_reattaches() {
        let harness = Harness::new();
        seed(&harness, "u1");
        let manager = manager(&harness).await;
        manager
            .add_imap_user(imap_user("u1", &["a1"]))
            .await
            .expect("add");

        let old_dir = harness.vault.settings().data_dir;
        std::fs::create_dir_all(&old_dir).expect("data dir");
        std::fs::write(old_dir.join("store.db"), b"data").expect("write store");
        let new_dir = harness.dir.path().join("moved");

        manager.set_data_dir(new_dir.clone()).await.expect("move");
        assert_eq!(harness.vault.settings().data_dir, new_dir);
        assert!(new_dir.join("store.db").is_file());
        assert!(!old_dir.exists());
        assert_eq!(harness.imap.data_dirs().last(), Some(&new_dir));
        assert_eq!(manager.status().await.expect("status").loaded_users, 1);
        manager.close().await.expect("close");
    }

    #[tokio::test]
    async fn failed_data_dir_move_keeps_previous_directory() {
        let harness = Harness::new();
        seed(&harness, "u1");
        let manager = manager(&harness).await;
        let old_dir = harness.vault.settings().data_dir;

        let occupied = harness.dir.path().join("occupied");
        std::fs::create_dir_all(&occupied).expect("mkdir");
        std::fs::write(occupied.join("other"), b"x").expect("write");

        let err = manager.set_data_dir(occupied).await.expect_err("must fail");
        assert!(err.to_string().contains("cannot move mailbox data"));
        assert_eq!(harness.vault.settings().data_dir, old_dir);
        manager.close().await.expect("close");
    }

    #[tokio::test]
    async fn opaque_stores_do_not_count_as_users() {
        let harness = Harness::new();
        let manager = manager(&harness).await;
        let connector = Connector::new(
            "import",
            "import",
            vec![],
            SecretString::new("x".into()),
        );
        let store_id = manager
            .add_opaque_user(Arc::clone(&connector), SecretString::new("pass".into()))
            .await
            .expect("opaque add");
        assert_eq!(manager.status().await.expect("status").loaded_users, 0);
        manager
            .remove_opaque_user(&store_id, true)
            .await
            .expect("opaque remove");
        assert!(!harness.imap.store_exists(&store_id));
        manager.close().await.expect("close");
    }

    #[tokio::test]
    async fn requests_after_close_are_invariant_errors() {
        let harness = Harness::new();
        let manager = manager(&harness).await;
        manager.close().await.expect("close");
        let err = manager.status().await.expect_err("closed");
        assert!(err.to_string().contains("not running"));
    }
}
