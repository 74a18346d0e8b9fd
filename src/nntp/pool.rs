//! News server pool: connection leasing with per-server budgets and
//! multi-level failover bookkeeping
//!
//! Workers lease one connection at a time. The pool prefers warm (still
//! connected) idle connections, never exceeds a server's connection
//! budget, and skips servers the caller has burned for the current
//! article — treating servers that share a non-zero `group` as
//! interchangeable failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connection::{Connection, ConnectionStatus};
use crate::config::{Config, ServerConfig};
use crate::types::ServerId;

/// Poll interval while waiting for a free connection
const WAIT_POLL: Duration = Duration::from_millis(5);

/// One news server known to the pool
#[derive(Clone, Debug)]
pub struct NewsServer {
    /// Stable id
    pub id: ServerId,
    /// Hostname
    pub host: String,
    /// Port
    pub port: u16,
    /// AUTHINFO username
    pub username: Option<String>,
    /// AUTHINFO password
    pub password: Option<String>,
    /// TLS capability flag
    pub tls: bool,
    /// Server requires GROUP before ARTICLE
    pub join_group: bool,
    /// Failover tier (0 = primary)
    pub level: u32,
    /// Interchangeability group (0 = none)
    pub group: u32,
    /// Connection budget
    pub max_connections: usize,
}

impl From<&ServerConfig> for NewsServer {
    fn from(config: &ServerConfig) -> Self {
        Self {
            id: config.id,
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            password: config.password.clone(),
            tls: config.tls,
            join_group: config.join_group,
            level: config.level,
            group: config.group,
            max_connections: config.max_connections,
        }
    }
}

/// A connection leased from the pool; return it with
/// [`ServerPool::free_connection`]
pub struct Leased {
    /// The leased connection; exclusively owned until freed
    pub conn: Connection,
    server: Arc<NewsServer>,
    lease_id: u64,
}

impl Leased {
    /// The server this lease is bound to
    pub fn server(&self) -> &Arc<NewsServer> {
        &self.server
    }
}

#[derive(Default)]
struct PoolState {
    /// Warm connections available for reuse, per server
    idle: HashMap<ServerId, Vec<Connection>>,
    /// Leases currently out, per server
    in_use: HashMap<ServerId, usize>,
    /// Cancellation handles of live leases, for shutdown
    lease_tokens: HashMap<u64, CancellationToken>,
    next_lease_id: u64,
}

/// The connection pool shared by all workers
pub struct ServerPool {
    servers: Vec<Arc<NewsServer>>,
    state: StdMutex<PoolState>,
    connect_timeout: Duration,
    read_timeout: Duration,
    max_level: u32,
}

impl ServerPool {
    /// Build the pool from the configured servers
    pub fn new(config: &Config) -> Self {
        let servers: Vec<Arc<NewsServer>> = config
            .servers
            .iter()
            .map(|s| Arc::new(NewsServer::from(s)))
            .collect();
        let max_level = servers.iter().map(|s| s.level).max().unwrap_or(0);
        Self {
            servers,
            state: StdMutex::new(PoolState::default()),
            connect_timeout: config.download.connection_timeout,
            read_timeout: config.download.read_timeout,
            max_level,
        }
    }

    /// Largest failover level across known servers
    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    /// Read-only server iteration
    pub fn servers(&self) -> &[Arc<NewsServer>] {
        &self.servers
    }

    /// Leases currently out for a server; never exceeds its budget
    pub fn leased_count(&self, id: ServerId) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_use.get(&id).copied().unwrap_or(0)
    }

    /// True when `server` is burned, either directly or through a peer in
    /// the same non-zero group
    pub fn server_failed(&self, server: &NewsServer, failed: &[ServerId]) -> bool {
        failed.iter().any(|&failed_id| {
            if failed_id == server.id {
                return true;
            }
            self.servers
                .iter()
                .find(|s| s.id == failed_id)
                .is_some_and(|s| s.group > 0 && s.group == server.group)
        })
    }

    /// True when every server at `level` is burned for this article
    pub fn level_exhausted(&self, level: u32, failed: &[ServerId]) -> bool {
        self.servers
            .iter()
            .filter(|s| s.level == level)
            .all(|s| self.server_failed(s, failed))
    }

    /// Lease a connection for a server at `level`, honoring `want_server`
    /// and skipping `failed` servers (by group equivalence). Blocks
    /// cooperatively, polling every 5 ms, until a connection frees up or
    /// `stop` is cancelled.
    pub async fn get_connection(
        &self,
        level: u32,
        want_server: Option<ServerId>,
        failed: &[ServerId],
        stop: &CancellationToken,
    ) -> Option<Leased> {
        loop {
            if let Some(leased) = self.try_get_connection(level, want_server, failed) {
                return Some(leased);
            }
            if stop.is_cancelled() {
                return None;
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    /// Non-blocking lease attempt
    pub fn try_get_connection(
        &self,
        level: u32,
        want_server: Option<ServerId>,
        failed: &[ServerId],
    ) -> Option<Leased> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let eligible = |server: &Arc<NewsServer>| -> bool {
            server.level == level
                && want_server.map_or(true, |want| server.id == want)
                && !self.server_failed(server, failed)
        };

        // Prefer a warm idle connection over opening a new socket
        let warm = self.servers.iter().find(|server| {
            eligible(server)
                && state
                    .idle
                    .get(&server.id)
                    .is_some_and(|idle| !idle.is_empty())
        });
        if let Some(server) = warm {
            if let Some(conn) = state.idle.get_mut(&server.id).and_then(Vec::pop) {
                return Some(Self::lease(&mut state, Arc::clone(server), conn));
            }
        }

        // Otherwise create a fresh connection on a server with headroom
        let server = self.servers.iter().find(|server| {
            if !eligible(server) {
                return false;
            }
            let busy = state.in_use.get(&server.id).copied().unwrap_or(0);
            let parked = state.idle.get(&server.id).map_or(0, Vec::len);
            busy + parked < server.max_connections
        })?;
        let conn = Connection::new(
            Arc::clone(server),
            self.connect_timeout,
            self.read_timeout,
        );
        Some(Self::lease(&mut state, Arc::clone(server), conn))
    }

    fn lease(state: &mut PoolState, server: Arc<NewsServer>, conn: Connection) -> Leased {
        state.next_lease_id += 1;
        let lease_id = state.next_lease_id;
        *state.in_use.entry(server.id).or_insert(0) += 1;
        state.lease_tokens.insert(lease_id, conn.cancel_token());
        Leased {
            conn,
            server,
            lease_id,
        }
    }

    /// Return a leased connection. Disconnects first unless the caller
    /// wants it kept warm and it was not cancelled.
    pub async fn free_connection(&self, mut leased: Leased, keep_connected: bool) {
        let cancelled = leased.conn.status() == ConnectionStatus::Cancelled;
        if !keep_connected || cancelled {
            leased.conn.disconnect().await;
        }
        let park = leased.conn.status() == ConnectionStatus::Connected;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.lease_tokens.remove(&leased.lease_id);
        if let Some(count) = state.in_use.get_mut(&leased.server.id) {
            *count = count.saturating_sub(1);
        }
        if park {
            state
                .idle
                .entry(leased.server.id)
                .or_default()
                .push(leased.conn);
        }
        debug!(server = %leased.server.id, kept = park, "connection returned to pool");
    }

    /// Cancel every live lease; pending reads and connects unblock promptly.
    /// Used on engine shutdown, after `suppress_errors` was raised.
    pub fn cancel_all(&self) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for token in state.lease_tokens.values() {
            token.cancel();
        }
    }

    /// Disconnect and drop all idle connections
    pub async fn close_idle(&self) {
        let idle: Vec<Connection> = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.idle.drain().flat_map(|(_, conns)| conns).collect()
        };
        for mut conn in idle {
            conn.set_suppress_errors(true);
            conn.disconnect().await;
        }
    }
}
