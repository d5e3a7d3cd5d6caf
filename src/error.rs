//! Error types for routing operations.

use std::net::IpAddr;

use ipnet::IpNet;
use thiserror::Error;

/// Errors that can occur in routing operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or tunable I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unsupported netlink message.
    #[error("codec error: {0}")]
    Codec(String),

    /// The routing socket has not been opened.
    #[error("routing socket not started")]
    NotStarted,

    /// A route targets a table other than the interface's own table.
    #[error("route table {table} does not match interface table {expected}")]
    InvalidTable { table: u32, expected: u32 },

    /// Interface indices start at 1.
    #[error("invalid interface index {index}")]
    InvalidInterface { index: i32 },

    /// The remote address is outside the local subnet.
    #[error("{remote} is not reachable from {local}")]
    Unreachable { local: IpNet, remote: IpAddr },

    /// Addresses of different families were mixed in one entry.
    #[error("address family mismatch")]
    FamilyMismatch,

    /// A route query was dropped because a later reply arrived first.
    #[error("route query {sequence} abandoned")]
    QueryAbandoned { sequence: u32 },

    /// Timeout waiting for the kernel.
    #[error("timeout")]
    Timeout,

    /// The routing service is closed.
    #[error("routing service closed")]
    Closed,
}

impl Error {
    /// Returns true if the kernel dropped notifications because the
    /// receive queue overflowed (`ENOBUFS`).
    pub fn is_overrun(&self) -> bool {
        matches!(self, Error::Io(e) if e.raw_os_error() == Some(libc::ENOBUFS))
    }
}
