//! IMAP client for the bridge's own listener
//!
//! Timeout-bounded wrappers around `async-imap`, used by the consistency
//! check to read back what a local store actually serves. The connection
//! goes to loopback, through TLS when the listener is TLS-wrapped.

use std::io;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_imap::types::{Fetch, Flag};
use async_imap::{Client, Session};
use futures::TryStreamExt;
use mailparse::MailHeaderMap;
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::errors::{AppError, AppResult};

/// Header local stores stamp with the remote message ID
pub const INTERNAL_ID_HEADER: &str = "X-Bridge-Internal-Id";

/// Client side of a local connection
#[derive(Debug)]
pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ClientStream {
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

impl AsyncWrite for ClientStream {
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

/// Authenticated session against a local listener
pub type LocalSession = Session<ClientStream>;

/// One message as a local store serves it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMessage {
    pub uid: u32,
    /// Remote message ID from [`INTERNAL_ID_HEADER`]
    pub internal_id: Option<String>,
    pub seen: bool,
    pub flagged: bool,
}

/// Connect to `127.0.0.1:port` and log in
///
/// Each phase (TCP connect, TLS handshake, greeting, LOGIN) is bounded by
/// `limit`.
///
/// # Errors
///
/// - `Timeout` if any phase times out
/// - `AuthFailed` if the local server rejects the credentials
/// - `Internal` for TCP, TLS or greeting failures
pub async fn connect_local(
    port: u16,
    tls: Option<&TlsConnector>,
    username: &str,
    password: &SecretString,
    limit: Duration,
) -> AppResult<LocalSession> {
    let tcp = timeout(limit, TcpStream::connect((Ipv4Addr::LOCALHOST, port)))
        .await
        .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("tcp connect failed: {e}"))))?;

    let stream = match tls {
        None => ClientStream::Plain(tcp),
        Some(connector) => {
            let server_name = ServerName::IpAddress(Ipv4Addr::LOCALHOST.into());
            let tls_stream = timeout(limit, connector.connect(server_name, tcp))
                .await
                .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
                .and_then(|r| {
                    r.map_err(|e| AppError::Internal(format!("TLS handshake failed: {e}")))
                })?;
            ClientStream::Tls(Box::new(tls_stream))
        }
    };

    let mut client = Client::new(stream);
    let greeting = timeout(limit, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("IMAP greeting failed: {e}"))))?;
    if greeting.is_none() {
        return Err(AppError::Internal(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    timeout(limit, client.login(username, password.expose_secret()))
        .await
        .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
        .and_then(|r| r.map_err(|(e, _)| AppError::AuthFailed(e.to_string())))
}

/// Open a mailbox read-only, returning its message count
pub async fn examine(session: &mut LocalSession, mailbox: &str, limit: Duration) -> AppResult<u32> {
    let encoded = utf7_imap::encode_utf7_imap(mailbox.to_owned());
    let selected = timeout(limit, session.examine(encoded))
        .await
        .map_err(|_| AppError::Timeout("EXAMINE timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::NotFound(format!("mailbox '{mailbox}': {e}"))))?;
    Ok(selected.exists)
}

/// Fetch UID, flags and the internal ID header of every message
pub async fn fetch_all(session: &mut LocalSession, limit: Duration) -> AppResult<Vec<LocalMessage>> {
    let query = format!("(UID FLAGS BODY.PEEK[HEADER.FIELDS ({INTERNAL_ID_HEADER})])");
    let stream = timeout(limit, session.uid_fetch("1:*", &query))
        .await
        .map_err(|_| AppError::Timeout("UID FETCH timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("UID FETCH failed: {e}"))))?;
    let fetches: Vec<Fetch> = timeout(limit, stream.try_collect())
        .await
        .map_err(|_| AppError::Timeout("UID FETCH stream timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("UID FETCH failed: {e}"))))?;
    fetches.iter().map(local_message).collect()
}

fn local_message(fetch: &Fetch) -> AppResult<LocalMessage> {
    let uid = fetch
        .uid
        .ok_or_else(|| AppError::Internal("FETCH response without UID".to_owned()))?;
    let internal_id = match fetch.header().or_else(|| fetch.body()) {
        Some(bytes) => internal_id_from_headers(bytes)?,
        None => None,
    };
    let mut message = LocalMessage {
        uid,
        internal_id,
        seen: false,
        flagged: false,
    };
    for flag in fetch.flags() {
        match flag {
            Flag::Seen => message.seen = true,
            Flag::Flagged => message.flagged = true,
            _ => {}
        }
    }
    Ok(message)
}

/// Extract [`INTERNAL_ID_HEADER`] from a raw header block
pub fn internal_id_from_headers(raw: &[u8]) -> AppResult<Option<String>> {
    let (headers, _) = mailparse::parse_headers(raw)
        .map_err(|e| AppError::Internal(format!("header parse failed: {e}")))?;
    Ok(headers
        .get_first_value(INTERNAL_ID_HEADER)
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty()))
}

pub async fn logout(session: &mut LocalSession, limit: Duration) -> AppResult<()> {
    timeout(limit, session.logout())
        .await
        .map_err(|_| AppError::Timeout("LOGOUT timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Internal(format!("LOGOUT failed: {e}"))))
}
