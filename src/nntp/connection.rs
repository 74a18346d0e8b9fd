//! One NNTP session over a single TCP (optionally TLS) socket
//!
//! The connection is line-oriented: `request` sends a command and returns
//! the status line, `read_line` streams the article body one line at a
//! time. Every blocking operation races a [`CancellationToken`], so
//! `cancel()` from another task unblocks a pending read or connect
//! promptly; a cancelled connection is dead and never reused.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_native_tls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::pool::NewsServer;
use crate::error::NntpError;

type Result<T> = std::result::Result<T, NntpError>;

/// Read buffer size; article bodies stream through here line by line
const READ_BUFFER: usize = 256 * 1024;
/// How long a best-effort QUIT may take during disconnect
const QUIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No live socket
    Disconnected,
    /// Greeting read and authentication done; commands may be issued
    Connected,
    /// `cancel()` was called; the connection is not reusable
    Cancelled,
}

struct Session {
    reader: BufReader<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: Box<dyn AsyncWrite + Unpin + Send + Sync>,
    current_group: Option<String>,
}

/// A single NNTP session bound to one [`NewsServer`]
pub struct Connection {
    server: Arc<NewsServer>,
    session: Option<Session>,
    cancel: CancellationToken,
    auth_error: bool,
    suppress_errors: bool,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl Connection {
    /// New disconnected connection for a server
    pub fn new(server: Arc<NewsServer>, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            server,
            session: None,
            cancel: CancellationToken::new(),
            auth_error: false,
            suppress_errors: false,
            connect_timeout,
            read_timeout,
        }
    }

    /// The server this connection belongs to
    pub fn server(&self) -> &Arc<NewsServer> {
        &self.server
    }

    /// Current state; cancellation wins over everything else
    pub fn status(&self) -> ConnectionStatus {
        if self.cancel.is_cancelled() {
            ConnectionStatus::Cancelled
        } else if self.session.is_some() {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }

    /// The server rejected AUTHINFO on the last connect attempt
    pub fn auth_error(&self) -> bool {
        self.auth_error
    }

    /// Demote expected I/O errors to debug logging (used during shutdown)
    pub fn set_suppress_errors(&mut self, suppress: bool) {
        self.suppress_errors = suppress;
    }

    /// Token that unblocks this connection's pending I/O when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Unblock any pending call and mark the connection dead. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Establish the session: TCP connect, optional TLS handshake, server
    /// greeting, AUTHINFO when credentials are configured. A no-op when
    /// already connected (warm reuse).
    pub async fn connect(&mut self) -> Result<()> {
        match self.status() {
            ConnectionStatus::Cancelled => return Err(NntpError::Cancelled),
            ConnectionStatus::Connected => return Ok(()),
            ConnectionStatus::Disconnected => {}
        }
        self.auth_error = false;

        let addr = format!("{}:{}", self.server.host, self.server.port);
        let connect_secs = self.connect_timeout.as_secs();
        let tcp = self
            .race(timeout(self.connect_timeout, TcpStream::connect(&addr)))
            .await?
            .map_err(|_| NntpError::Timeout {
                seconds: connect_secs,
            })?
            .map_err(|e| NntpError::ConnectFailed {
                host: self.server.host.clone(),
                port: self.server.port,
                source: e,
            })?;
        tcp.set_nodelay(true).ok();

        let (reader, writer): (
            Box<dyn AsyncRead + Unpin + Send + Sync>,
            Box<dyn AsyncWrite + Unpin + Send + Sync>,
        ) = if self.server.tls {
            let connector = native_tls::TlsConnector::new()
                .map_err(|e| NntpError::Tls(e.to_string()))?;
            let connector = TlsConnector::from(connector);
            let tls = self
                .race(timeout(
                    self.connect_timeout,
                    connector.connect(&self.server.host, tcp),
                ))
                .await?
                .map_err(|_| NntpError::Timeout {
                    seconds: connect_secs,
                })?
                .map_err(|e| NntpError::Tls(e.to_string()))?;
            let (r, w) = tokio::io::split(tls);
            (Box::new(r), Box::new(w))
        } else {
            let (r, w) = tcp.into_split();
            (Box::new(r), Box::new(w))
        };

        self.session = Some(Session {
            reader: BufReader::with_capacity(READ_BUFFER, reader),
            writer,
            current_group: None,
        });

        let greeting = match self.read_response().await {
            Ok(greeting) => greeting,
            Err(e) => {
                self.session = None;
                return Err(e);
            }
        };
        if !greeting.starts_with("200") && !greeting.starts_with("201") {
            self.session = None;
            return Err(NntpError::Protocol(format!(
                "unexpected greeting: {greeting}"
            )));
        }

        if self.server.username.is_some() {
            if let Err(e) = self.authenticate().await {
                self.session = None;
                return Err(e);
            }
        }

        debug!(server = %self.server.id, host = %self.server.host, "connected");
        Ok(())
    }

    /// AUTHINFO USER / AUTHINFO PASS; sets `auth_error` on rejection
    async fn authenticate(&mut self) -> Result<()> {
        let user = self.server.username.clone().unwrap_or_default();
        let pass = self.server.password.clone().unwrap_or_default();

        let response = self.request(&format!("AUTHINFO USER {user}")).await?;
        if response.starts_with("381") {
            let response = self.request(&format!("AUTHINFO PASS {pass}")).await?;
            if !response.starts_with("281") {
                self.auth_error = true;
                return Err(NntpError::AuthFailed {
                    response: first_word(&response),
                });
            }
        } else if !response.starts_with("281") {
            self.auth_error = true;
            return Err(NntpError::AuthFailed {
                response: first_word(&response),
            });
        }
        Ok(())
    }

    /// Issue `GROUP <name>` and return the status line. Re-selecting the
    /// current group is answered locally.
    pub async fn join_group(&mut self, group: &str) -> Result<String> {
        if let Some(session) = &self.session {
            if session.current_group.as_deref() == Some(group) {
                return Ok("211 0 0 0 group already selected".to_string());
            }
        }
        let response = self.request(&format!("GROUP {group}")).await?;
        if response.starts_with('2') {
            if let Some(session) = &mut self.session {
                session.current_group = Some(group.to_string());
            }
        }
        Ok(response)
    }

    /// Send one command and return the status line
    pub async fn request(&mut self, command: &str) -> Result<String> {
        self.write_line(command).await?;
        self.read_response().await
    }

    /// Read exactly one line, including its CRLF/LF terminator, up to
    /// `max_len` bytes. Lines are never merged or split across calls.
    pub async fn read_line(&mut self, max_len: usize) -> Result<Vec<u8>> {
        if self.cancel.is_cancelled() {
            return Err(NntpError::Cancelled);
        }
        let read_secs = self.read_timeout.as_secs();
        let session = self.session.as_mut().ok_or(NntpError::BadState {
            state: "disconnected",
            operation: "read",
        })?;

        let mut line = Vec::with_capacity(256);
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(NntpError::Cancelled),
            r = timeout(self.read_timeout, async {
                let mut limited = (&mut session.reader).take(max_len as u64);
                limited.read_until(b'\n', &mut line).await
            }) => r,
        };
        let n = result
            .map_err(|_| NntpError::Timeout { seconds: read_secs })?
            .map_err(NntpError::Io)?;
        if n == 0 {
            return Err(NntpError::Protocol("connection closed mid-article".into()));
        }
        if !line.ends_with(b"\n") {
            return Err(NntpError::Protocol(format!(
                "line exceeds {max_len} bytes"
            )));
        }
        Ok(line)
    }

    /// Close the session. Sends a best-effort QUIT first; errors here are
    /// expected and logged according to `suppress_errors`.
    pub async fn disconnect(&mut self) {
        if self.cancel.is_cancelled() {
            // the socket is dead by contract; no point in a QUIT exchange
            self.session = None;
            return;
        }
        if let Some(mut session) = self.session.take() {
            let quit = async {
                session.writer.write_all(b"QUIT\r\n").await?;
                session.writer.flush().await?;
                let mut line = Vec::new();
                let mut limited = (&mut session.reader).take(512);
                limited.read_until(b'\n', &mut line).await?;
                Ok::<_, std::io::Error>(())
            };
            if let Err(e) = timeout(QUIT_TIMEOUT, quit).await.unwrap_or_else(|_| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "QUIT timed out",
                ))
            }) {
                if self.suppress_errors {
                    debug!(server = %self.server.id, error = %e, "QUIT failed during disconnect");
                } else {
                    warn!(server = %self.server.id, error = %e, "QUIT failed during disconnect");
                }
            }
        }
    }

    async fn write_line(&mut self, command: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(NntpError::Cancelled);
        }
        let session = self.session.as_mut().ok_or(NntpError::BadState {
            state: "disconnected",
            operation: "write",
        })?;
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(NntpError::Cancelled),
            r = async {
                session.writer.write_all(command.as_bytes()).await?;
                session.writer.write_all(b"\r\n").await?;
                session.writer.flush().await?;
                Ok::<_, std::io::Error>(())
            } => r.map_err(NntpError::Io),
        }
    }

    async fn read_response(&mut self) -> Result<String> {
        let line = self.read_line(4096).await?;
        let text = String::from_utf8_lossy(&line);
        Ok(text.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Race a future against this connection's cancellation token
    async fn race<T>(&self, fut: impl std::future::Future<Output = T>) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(NntpError::Cancelled),
            value = fut => Ok(value),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server.id)
            .field("status", &self.status())
            .field("auth_error", &self.auth_error)
            .finish()
    }
}

/// Leading token of a response line — safe to log, never echoes credentials
fn first_word(response: &str) -> String {
    response
        .split_whitespace()
        .next()
        .unwrap_or("unknown")
        .to_string()
}
