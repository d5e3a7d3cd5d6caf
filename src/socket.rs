//! Kernel routing socket.
//!
//! [`RtnlSocket`] owns the single `NETLINK_ROUTE` socket of the process.
//! [`RtnlHandler`] sits on top of any [`Transport`], assigns sequence
//! numbers and encodes outgoing messages. Sends are never retried here; a
//! refused write (e.g. `ENOBUFS`) is returned to the caller.

use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use tokio::io::unix::AsyncFd;

use crate::wire::{split_messages, RtnlMessage};
use crate::{Error, Result};

/// Receive buffer size; large enough for a full dump datagram.
pub const RECEIVE_BUFFER_SIZE: usize = 32 * 1024;

/// Sends encoded messages to the kernel.
pub trait Transport: Send + Sync {
    /// Hands one encoded message to the kernel.
    fn send(&self, buf: &[u8]) -> Result<()>;
}

/// rtnetlink multicast groups (legacy bitmask, bit `n - 1` for group `n`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Groups(u32);

impl Groups {
    pub const LINK: Groups = Groups(0x1);
    pub const NEIGHBOR: Groups = Groups(0x4);
    pub const IPV4_ADDRESS: Groups = Groups(0x10);
    pub const IPV4_ROUTE: Groups = Groups(0x40);
    pub const IPV4_RULE: Groups = Groups(0x80);
    pub const IPV6_ADDRESS: Groups = Groups(0x100);
    pub const IPV6_ROUTE: Groups = Groups(0x400);
    pub const IPV6_RULE: Groups = Groups(1 << 18);

    /// Every group the routing core listens to.
    ///
    /// Rule groups are left out: rules are only read through dumps.
    pub fn routing() -> Self {
        Self::LINK
            | Self::NEIGHBOR
            | Self::IPV4_ADDRESS
            | Self::IPV6_ADDRESS
            | Self::IPV4_ROUTE
            | Self::IPV6_ROUTE
    }

    pub const fn empty() -> Self {
        Groups(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Groups) -> bool {
        self.0 & other.0 == other.0
    }

    /// Groups in `self` that are not in `other`.
    pub const fn difference(self, other: Groups) -> Groups {
        Groups(self.0 & !other.0)
    }

    /// Group numbers as used by `NETLINK_ADD_MEMBERSHIP`.
    fn group_ids(self) -> impl Iterator<Item = u32> {
        (0..32u32).filter(move |bit| self.0 & (1 << bit) != 0).map(|bit| bit + 1)
    }
}

impl BitOr for Groups {
    type Output = Groups;

    fn bitor(self, rhs: Groups) -> Groups {
        Groups(self.0 | rhs.0)
    }
}

impl BitOrAssign for Groups {
    fn bitor_assign(&mut self, rhs: Groups) {
        self.0 |= rhs.0;
    }
}

/// The process-wide `NETLINK_ROUTE` socket.
///
/// Registered with the tokio reactor, so [`Self::start`] must run inside a
/// runtime.
#[derive(Default)]
pub struct RtnlSocket {
    socket: Option<AsyncFd<Socket>>,
    groups: Groups,
}

impl RtnlSocket {
    /// Creates a socket handle; nothing is opened until [`Self::start`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens and binds the socket to `groups`.
    ///
    /// Calling again joins any groups not yet joined and is otherwise a
    /// no-op.
    pub fn start(&mut self, groups: Groups) -> Result<()> {
        let missing = groups.difference(self.groups);
        match self.socket.as_mut() {
            Some(socket) => {
                for group in missing.group_ids() {
                    socket.get_mut().add_membership(group)?;
                }
            }
            None => {
                let mut socket = Socket::new(NETLINK_ROUTE)?;
                socket.bind(&SocketAddr::new(0, groups.bits()))?;
                socket.connect(&SocketAddr::new(0, 0))?;
                socket.set_non_blocking(true)?;
                self.socket = Some(AsyncFd::new(socket)?);
                tracing::info!(groups = format_args!("{:#x}", groups.bits()), "routing socket started");
            }
        }
        self.groups |= missing;
        Ok(())
    }

    /// Returns true once the socket is open.
    pub fn is_started(&self) -> bool {
        self.socket.is_some()
    }

    /// Groups joined so far.
    pub fn groups(&self) -> Groups {
        self.groups
    }

    /// Waits for and reads one datagram.
    ///
    /// Readiness is only consumed once the socket reports it would block,
    /// so an error such as `ENOBUFS` leaves queued datagrams readable by
    /// the next call. Cancelling the returned future loses no data.
    pub async fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        let socket = self.socket.as_ref().ok_or(Error::NotStarted)?;
        loop {
            let mut guard = socket.readable().await?;
            match guard.try_io(|socket| socket.get_ref().recv(&mut &mut buf[..], 0)) {
                Ok(result) => return Ok(result?),
                Err(_would_block) => continue,
            }
        }
    }

    /// Waits at most `timeout` until `on_message` reports completion.
    ///
    /// Every message received meanwhile is passed to `on_message`, so
    /// unrelated notifications arriving during the wait are not lost. The
    /// rest of the datagram that completed the wait is still delivered.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        mut on_message: impl FnMut(RtnlMessage) -> bool,
    ) -> Result<()> {
        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        let wait = async {
            loop {
                let n = match self.receive(&mut buf).await {
                    Ok(n) => n,
                    Err(e) if e.is_overrun() => {
                        tracing::warn!("routing socket overrun while waiting");
                        continue;
                    }
                    Err(Error::Io(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                };

                let mut done = false;
                for msg in decode_datagram(&buf[..n]) {
                    done |= on_message(msg);
                }
                if done {
                    return Ok(());
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout)?
    }
}

impl Transport for RtnlSocket {
    fn send(&self, buf: &[u8]) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(Error::NotStarted)?;
        socket.get_ref().send(buf, 0)?;
        Ok(())
    }
}

/// Splits and decodes a datagram, dropping malformed messages.
pub fn decode_datagram(buf: &[u8]) -> impl Iterator<Item = RtnlMessage> + '_ {
    split_messages(buf).filter_map(|raw| match RtnlMessage::decode(raw) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::warn!(error = %e, len = raw.len(), "dropping malformed netlink message");
            None
        }
    })
}

/// Assigns sequence numbers and encodes messages onto a [`Transport`].
pub struct RtnlHandler {
    transport: Arc<dyn Transport>,
    sequence: AtomicU32,
}

impl RtnlHandler {
    /// Creates a handler starting at a random sequence number.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_initial_sequence(transport, rand::random())
    }

    /// Creates a handler with a fixed first sequence number.
    pub fn with_initial_sequence(transport: Arc<dyn Transport>, sequence: u32) -> Self {
        Self {
            transport,
            sequence: AtomicU32::new(sequence),
        }
    }

    fn next_sequence(&self) -> u32 {
        // 0 is reserved for kernel-originated notifications.
        loop {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                return seq;
            }
        }
    }

    /// Encodes and sends `msg`, returning the sequence number used.
    pub fn send_message(&self, mut msg: RtnlMessage) -> Result<u32> {
        let seq = self.next_sequence();
        msg.seq = seq;
        let buf = msg.encode()?;
        tracing::trace!(%msg, "sending netlink message");
        self.transport.send(&buf)?;
        Ok(seq)
    }
}
