//! NNTP client layer: a cancellable line-oriented connection and the
//! server pool that leases connections with multi-level failover.

mod connection;
mod pool;

pub use connection::{Connection, ConnectionStatus};
pub use pool::{Leased, NewsServer, ServerPool};
