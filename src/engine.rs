//! Local IMAP/SMTP engine boundary
//!
//! The protocol engines are external. This module defines what the server
//! manager hands them: loopback listeners (optionally TLS-wrapped),
//! per-binding [`Connector`]s carrying mailbox mutations, and the SMTP
//! backend's account table.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::task::{Context, Poll};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{ApiClient, ApiLabel, FullMessage, MessageMetadata};
use crate::errors::{AppError, AppResult};

/// Bound loopback listener handed to an engine's `serve`
pub struct LocalListener {
    tcp: TcpListener,
    tls: Option<TlsAcceptor>,
    port: u16,
    shutdown: CancellationToken,
}

impl LocalListener {
    /// Bind `127.0.0.1:port`
    ///
    /// Port `0` asks the OS for a free port; [`LocalListener::port`] reports
    /// the one actually bound.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the port cannot be bound (typically already in use).
    pub async fn bind(port: u16, tls: Option<TlsAcceptor>) -> AppResult<Self> {
        let tcp = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|e| AppError::Config(format!("cannot bind 127.0.0.1:{port}: {e}")))?;
        let port = tcp.local_addr()?.port();
        Ok(Self {
            tcp,
            tls,
            port,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Token cancelled when the manager stops this listener
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept the next connection, completing the TLS handshake if enabled
    ///
    /// Returns `None` once the listener has been shut down.
    pub async fn accept(&self) -> Option<AppResult<(LocalStream, SocketAddr)>> {
        let accepted = tokio::select! {
            _ = self.shutdown.cancelled() => return None,
            accepted = self.tcp.accept() => accepted,
        };
        let (tcp, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => return Some(Err(AppError::Io(e))),
        };
        let stream = match &self.tls {
            None => LocalStream::Plain(tcp),
            Some(acceptor) => match acceptor.accept(tcp).await {
                Ok(tls) => LocalStream::Tls(Box::new(tls)),
                Err(e) => {
                    return Some(Err(AppError::Internal(format!(
                        "TLS handshake with {peer} failed: {e}"
                    ))));
                }
            },
        };
        Some(Ok((stream, peer)))
    }
}

/// Accepted client connection, plaintext or TLS
pub enum LocalStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for LocalStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LocalStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Mailbox mutation pushed from the bridge to a local store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorUpdate {
    MailboxCreated(ApiLabel),
    MailboxUpdated(ApiLabel),
    MailboxDeleted { id: String },
    MessagesCreated(Vec<FullMessage>),
    MessageUpdated(MessageMetadata),
    MessageDeleted { id: String },
    /// The set of addresses allowed to log in to this store changed
    AddressesChanged(Vec<String>),
}

#[derive(Default)]
struct UpdateQueue {
    tx: Option<mpsc::UnboundedSender<ConnectorUpdate>>,
    /// Updates published while no engine was attached
    pending: Vec<ConnectorUpdate>,
}

/// Binding between one address (or one combined account) and a local store
///
/// Updates published while the binding is detached are queued and replayed
/// to the next engine that calls [`Connector::subscribe`].
pub struct Connector {
    user_id: String,
    binding_id: String,
    addresses: RwLock<Vec<String>>,
    bridge_pass: SecretString,
    queue: Mutex<UpdateQueue>,
}

impl Connector {
    pub fn new(
        user_id: impl Into<String>,
        binding_id: impl Into<String>,
        addresses: Vec<String>,
        bridge_pass: SecretString,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id: user_id.into(),
            binding_id: binding_id.into(),
            addresses: RwLock::new(addresses),
            bridge_pass,
            queue: Mutex::new(UpdateQueue::default()),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn binding_id(&self) -> &str {
        &self.binding_id
    }

    pub fn addresses(&self) -> Vec<String> {
        self.addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the login addresses and notify the engine
    pub fn set_addresses(&self, addresses: Vec<String>) {
        *self
            .addresses
            .write()
            .unwrap_or_else(PoisonError::into_inner) = addresses.clone();
        self.publish(ConnectorUpdate::AddressesChanged(addresses));
    }

    /// Check IMAP/SMTP client credentials against this binding
    pub fn authorize(&self, username: &str, password: &str) -> bool {
        let known = self
            .addresses()
            .iter()
            .any(|a| a.eq_ignore_ascii_case(username));
        known && self.bridge_pass.expose_secret() == password
    }

    fn lock_queue(&self) -> MutexGuard<'_, UpdateQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push an update to the attached engine, or queue it
    pub fn publish(&self, update: ConnectorUpdate) {
        let mut queue = self.lock_queue();
        let undelivered = match &queue.tx {
            Some(tx) => tx.send(update).err().map(|e| e.0),
            None => Some(update),
        };
        if let Some(update) = undelivered {
            queue.tx = None;
            queue.pending.push(update);
        }
    }

    /// Attach an engine; replaces any previous subscriber
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectorUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut queue = self.lock_queue();
        let pending = std::mem::take(&mut queue.pending);
        if !pending.is_empty() {
            debug!(
                user_id = %self.user_id,
                binding_id = %self.binding_id,
                count = pending.len(),
                "replaying queued connector updates"
            );
        }
        for update in pending {
            // The receiver is alive in this scope.
            let _ = tx.send(update);
        }
        queue.tx = Some(tx);
        rx
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("user_id", &self.user_id)
            .field("binding_id", &self.binding_id)
            .field("addresses", &self.addresses())
            .finish_non_exhaustive()
    }
}

/// What a loaded store reported about itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub message_count: u64,
}

/// External IMAP engine
#[async_trait]
pub trait ImapEngine: Send + Sync {
    /// Start serving on `listener` in the background and return
    ///
    /// Serving must stop once the listener's shutdown token is cancelled.
    async fn serve(&self, listener: LocalListener) -> AppResult<()>;

    /// Create a new store for the connector, returning its ID
    async fn add_user(&self, connector: Arc<Connector>, passphrase: &SecretString)
    -> AppResult<String>;

    /// Attach an existing store to the connector
    async fn load_user(
        &self,
        connector: Arc<Connector>,
        store_id: &str,
        passphrase: &SecretString,
    ) -> AppResult<StoreStats>;

    /// Detach a store, deleting its data when `with_data` is set
    async fn remove_user(&self, store_id: &str, with_data: bool) -> AppResult<()>;

    /// Stop serving and release every store
    async fn close(&self) -> AppResult<()>;
}

/// Builds IMAP engines rooted at a data directory
pub trait ImapEngineFactory: Send + Sync {
    fn build(&self, data_dir: &Path) -> AppResult<Arc<dyn ImapEngine>>;
}

/// External SMTP engine
#[async_trait]
pub trait SmtpEngine: Send + Sync {
    async fn serve(&self, listener: LocalListener) -> AppResult<()>;

    async fn close(&self) -> AppResult<()>;
}

/// Builds SMTP engines over the shared account table
pub trait SmtpEngineFactory: Send + Sync {
    fn build(&self, accounts: SmtpAccounts) -> AppResult<Arc<dyn SmtpEngine>>;
}

/// SMTP backend entry for one account
#[derive(Clone)]
pub struct SmtpAccount {
    pub user_id: String,
    pub addresses: Vec<String>,
    pub bridge_pass: SecretString,
    pub client: Arc<dyn ApiClient>,
}

impl fmt::Debug for SmtpAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpAccount")
            .field("user_id", &self.user_id)
            .field("addresses", &self.addresses)
            .finish_non_exhaustive()
    }
}

/// SMTP backend user table
///
/// Engines read it concurrently; only the server manager writes it.
#[derive(Clone, Default)]
pub struct SmtpAccounts {
    inner: Arc<RwLock<HashMap<String, SmtpAccount>>>,
}

impl SmtpAccounts {
    pub(crate) fn insert(&self, account: SmtpAccount) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account.user_id.clone(), account);
    }

    pub(crate) fn remove(&self, user_id: &str) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve SMTP AUTH credentials to an account
    pub fn authorize(&self, username: &str, password: &str) -> Option<SmtpAccount> {
        let accounts = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let found = accounts.values().find(|account| {
            account
                .addresses
                .iter()
                .any(|a| a.eq_ignore_ascii_case(username))
        })?;
        if found.bridge_pass.expose_secret() == password {
            Some(found.clone())
        } else {
            warn!(user_id = %found.user_id, "SMTP authentication rejected");
            None
        }
    }
}
