//! Wire format handling for rtnetlink messages.
//!
//! Every message is a fixed netlink header, a fixed body whose layout
//! depends on the message family, and a list of type-length-value
//! attributes:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Message Length                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Message Type         |             Flags             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Port ID                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     ifinfomsg / ifaddrmsg / rtmsg / fib_rule_hdr / ndmsg      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      Attr Length              |          Attr Type            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Attr Value (padded to 4 bytes) ...                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Header and body integers are in host byte order. Addresses are raw
//! octets in network order.

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::types::{
    addr_octets, is_default_net, AddressEntry, FwMark, IpFamily, LinkEntry, NeighborEntry,
    RouteEntry, RouteProtocol, RouteScope, RouteType, RoutingPolicyEntry, UidRange,
};
use crate::{Error, Result};

/// Netlink header size in bytes.
pub const NLMSG_HDRLEN: usize = 16;

/// Attribute header size in bytes.
pub const NLA_HDRLEN: usize = 4;

/// Table value in fixed bodies meaning "see the 32-bit table attribute".
pub const RT_TABLE_COMPAT: u8 = 252;

// Control message types.
const NLMSG_NOOP: u16 = 1;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLMSG_OVERRUN: u16 = 4;

// rtnetlink message types.
const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_GETLINK: u16 = 18;
const RTM_NEWADDR: u16 = 20;
const RTM_DELADDR: u16 = 21;
const RTM_GETADDR: u16 = 22;
const RTM_NEWROUTE: u16 = 24;
const RTM_DELROUTE: u16 = 25;
const RTM_GETROUTE: u16 = 26;
const RTM_NEWNEIGH: u16 = 28;
const RTM_DELNEIGH: u16 = 29;
const RTM_GETNEIGH: u16 = 30;
const RTM_NEWRULE: u16 = 32;
const RTM_DELRULE: u16 = 33;
const RTM_GETRULE: u16 = 34;

// Header flags.
pub const NLM_F_REQUEST: u16 = 0x0001;
pub const NLM_F_MULTI: u16 = 0x0002;
pub const NLM_F_ACK: u16 = 0x0004;
pub const NLM_F_ROOT: u16 = 0x0100;
pub const NLM_F_MATCH: u16 = 0x0200;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;
pub const NLM_F_REPLACE: u16 = 0x0100;
pub const NLM_F_EXCL: u16 = 0x0200;
pub const NLM_F_CREATE: u16 = 0x0400;

// Body sizes.
const IFINFOMSG_LEN: usize = 16;
const IFADDRMSG_LEN: usize = 8;
const RTMSG_LEN: usize = 12;
const FIB_RULE_HDR_LEN: usize = 12;
const NDMSG_LEN: usize = 12;

// IFLA_* attributes.
const IFLA_ADDRESS: u16 = 1;
const IFLA_IFNAME: u16 = 3;
const IFLA_MTU: u16 = 4;
const IFLA_LINKINFO: u16 = 18;
const IFLA_INFO_KIND: u16 = 1;

// IFA_* attributes.
const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;
const IFA_FLAGS: u16 = 8;

// RTA_* attributes.
const RTA_DST: u16 = 1;
const RTA_SRC: u16 = 2;
const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;
const RTA_PRIORITY: u16 = 6;
const RTA_PREFSRC: u16 = 7;
const RTA_TABLE: u16 = 15;

// FRA_* attributes.
const FRA_DST: u16 = 1;
const FRA_SRC: u16 = 2;
const FRA_IIFNAME: u16 = 3;
const FRA_PRIORITY: u16 = 6;
const FRA_FWMARK: u16 = 10;
const FRA_TABLE: u16 = 15;
const FRA_FWMASK: u16 = 16;
const FRA_OIFNAME: u16 = 17;
const FRA_UID_RANGE: u16 = 20;

// NDA_* attributes.
const NDA_DST: u16 = 1;
const NDA_LLADDR: u16 = 2;

/// Rule action: look up a table.
pub const FR_ACT_TO_TBL: u8 = 1;

/// Rule flag: invert the match.
pub const FIB_RULE_INVERT: u32 = 0x2;

/// Masks out the nested and byte-order bits of an attribute type.
const NLA_TYPE_MASK: u16 = 0x3fff;

/// Kernel message operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Dump request (`RTM_GET*` with `NLM_F_DUMP`).
    Get,
    /// `RTM_NEW*`.
    Add,
    /// `RTM_DEL*`.
    Delete,
    /// Single-entry lookup (`RTM_GETROUTE` without dump).
    Query,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Get => write!(f, "GET"),
            Mode::Add => write!(f, "ADD"),
            Mode::Delete => write!(f, "DELETE"),
            Mode::Query => write!(f, "QUERY"),
        }
    }
}

/// Typed content of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtnlEntity {
    Link(LinkEntry),
    Address(AddressEntry),
    /// A route; `interface_index` is the output interface, 0 if none.
    Route {
        interface_index: i32,
        entry: RouteEntry,
    },
    /// A rule; `action` is the raw `FR_ACT_*` value.
    Rule {
        action: u8,
        entry: RoutingPolicyEntry,
    },
    Neighbor(NeighborEntry),
    /// Kernel acknowledgement (`errno == 0`) or failure report.
    Error { errno: i32 },
    /// End of a multipart dump.
    Done,
}

impl RtnlEntity {
    /// A route through `interface_index`.
    pub fn route(interface_index: i32, entry: RouteEntry) -> Self {
        RtnlEntity::Route {
            interface_index,
            entry,
        }
    }

    /// A table lookup rule.
    pub fn rule(entry: RoutingPolicyEntry) -> Self {
        RtnlEntity::Rule {
            action: FR_ACT_TO_TBL,
            entry,
        }
    }

    fn type_base(&self) -> Option<u16> {
        match self {
            RtnlEntity::Link(_) => Some(RTM_NEWLINK),
            RtnlEntity::Address(_) => Some(RTM_NEWADDR),
            RtnlEntity::Route { .. } => Some(RTM_NEWROUTE),
            RtnlEntity::Neighbor(_) => Some(RTM_NEWNEIGH),
            RtnlEntity::Rule { .. } => Some(RTM_NEWRULE),
            RtnlEntity::Error { .. } | RtnlEntity::Done => None,
        }
    }
}

impl fmt::Display for RtnlEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtnlEntity::Link(link) => write!(f, "{}", link),
            RtnlEntity::Address(addr) => write!(f, "{}", addr),
            RtnlEntity::Route {
                interface_index,
                entry,
            } => {
                write!(f, "route {}", entry)?;
                if *interface_index != 0 {
                    write!(f, " dev {}", interface_index)?;
                }
                Ok(())
            }
            RtnlEntity::Rule { action, entry } => {
                write!(f, "rule {}", entry)?;
                if *action != FR_ACT_TO_TBL {
                    write!(f, " action {}", action)?;
                }
                Ok(())
            }
            RtnlEntity::Neighbor(neigh) => write!(f, "{}", neigh),
            RtnlEntity::Error { errno: 0 } => write!(f, "ack"),
            RtnlEntity::Error { errno } => {
                write!(f, "error {}", std::io::Error::from_raw_os_error(*errno))
            }
            RtnlEntity::Done => write!(f, "done"),
        }
    }
}

/// An rtnetlink message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtnlMessage {
    pub mode: Mode,
    /// Extra header flags; `NLM_F_REQUEST` and `NLM_F_DUMP` are added on
    /// encode as the mode requires.
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
    pub entity: RtnlEntity,
}

impl RtnlMessage {
    /// Creates a message with no extra flags and sequence 0.
    pub fn new(mode: Mode, entity: RtnlEntity) -> Self {
        Self {
            mode,
            flags: 0,
            seq: 0,
            pid: 0,
            entity,
        }
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    /// Returns the `nlmsg_type` for this message.
    fn message_type(&self) -> Result<u16> {
        let base = self.entity.type_base().ok_or_else(|| {
            Error::Codec(format!("cannot encode {} messages", self.entity))
        })?;
        match self.mode {
            Mode::Add => Ok(base),
            Mode::Delete => Ok(base + 1),
            Mode::Get => Ok(base + 2),
            Mode::Query if base == RTM_NEWROUTE => Ok(RTM_GETROUTE),
            Mode::Query => Err(Error::Codec(format!(
                "query mode is only supported for routes, not {}",
                self.entity
            ))),
        }
    }

    /// Encodes the message to wire format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let msg_type = self.message_type()?;
        let mut flags = self.flags | NLM_F_REQUEST;
        if self.mode == Mode::Get {
            flags |= NLM_F_DUMP;
        }

        let mut buf = Vec::with_capacity(128);
        write_nlmsghdr(&mut buf, msg_type, flags, self.seq, self.pid);

        // Dump requests carry only the fixed body; attributes would be
        // taken as filters by strict-checking kernels.
        let with_attrs = self.mode != Mode::Get;
        match &self.entity {
            RtnlEntity::Link(link) => encode_link(&mut buf, link, with_attrs),
            RtnlEntity::Address(addr) => encode_address(&mut buf, addr, with_attrs),
            RtnlEntity::Route {
                interface_index,
                entry,
            } => encode_route(&mut buf, *interface_index, entry, with_attrs)?,
            RtnlEntity::Rule { action, entry } => encode_rule(&mut buf, *action, entry, with_attrs)?,
            RtnlEntity::Neighbor(neigh) => encode_neighbor(&mut buf, neigh, with_attrs),
            RtnlEntity::Error { .. } | RtnlEntity::Done => unreachable!("rejected by message_type"),
        }

        finalize(&mut buf)?;
        Ok(buf)
    }

    /// Decodes one message from the start of `buf`.
    ///
    /// The declared length must fit in `buf`; bytes past it are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < NLMSG_HDRLEN {
            return Err(Error::Codec(format!(
                "buffer of {} bytes is shorter than the netlink header",
                buf.len()
            )));
        }

        let len = read_u32(buf, 0) as usize;
        if len < NLMSG_HDRLEN {
            return Err(Error::Codec(format!("declared length {} is too small", len)));
        }
        if len > buf.len() {
            return Err(Error::Codec(format!(
                "declared length {} exceeds buffer of {} bytes",
                len,
                buf.len()
            )));
        }

        let msg_type = read_u16(buf, 4);
        let flags = read_u16(buf, 6);
        let seq = read_u32(buf, 8);
        let pid = read_u32(buf, 12);
        let payload = &buf[NLMSG_HDRLEN..len];

        let (mode, entity) = match msg_type {
            NLMSG_ERROR => {
                let code = body(payload, 4, "nlmsgerr")?;
                // The kernel reports negative errno values.
                let code = read_u32(code, 0) as i32;
                let errno = code
                    .checked_neg()
                    .ok_or_else(|| Error::Codec(format!("invalid error code {}", code)))?;
                (Mode::Add, RtnlEntity::Error { errno })
            }
            NLMSG_DONE => (Mode::Add, RtnlEntity::Done),
            NLMSG_NOOP | NLMSG_OVERRUN => {
                return Err(Error::Codec(format!("unsupported control message {}", msg_type)))
            }
            RTM_NEWLINK | RTM_DELLINK | RTM_GETLINK => {
                (mode_of(msg_type - RTM_NEWLINK), decode_link(payload)?)
            }
            RTM_NEWADDR | RTM_DELADDR | RTM_GETADDR => {
                (mode_of(msg_type - RTM_NEWADDR), decode_address(payload)?)
            }
            RTM_NEWROUTE | RTM_DELROUTE | RTM_GETROUTE => {
                (mode_of(msg_type - RTM_NEWROUTE), decode_route(payload)?)
            }
            RTM_NEWNEIGH | RTM_DELNEIGH | RTM_GETNEIGH => {
                (mode_of(msg_type - RTM_NEWNEIGH), decode_neighbor(payload)?)
            }
            RTM_NEWRULE | RTM_DELRULE | RTM_GETRULE => {
                (mode_of(msg_type - RTM_NEWRULE), decode_rule(payload)?)
            }
            other => return Err(Error::Codec(format!("unknown message type {}", other))),
        };

        Ok(Self {
            mode,
            flags,
            seq,
            pid,
            entity,
        })
    }
}

impl fmt::Display for RtnlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entity {
            RtnlEntity::Error { .. } | RtnlEntity::Done => {
                write!(f, "seq {} {}", self.seq, self.entity)
            }
            _ => write!(f, "seq {} {} {}", self.seq, self.mode, self.entity),
        }
    }
}

fn mode_of(offset: u16) -> Mode {
    match offset {
        0 => Mode::Add,
        1 => Mode::Delete,
        _ => Mode::Get,
    }
}

/// Splits a received datagram into individual messages.
///
/// Iteration stops at the first message whose declared length is smaller
/// than a header or runs past the end of the buffer.
pub fn split_messages(buf: &[u8]) -> SplitMessages<'_> {
    SplitMessages { remaining: buf }
}

/// Iterator returned by [`split_messages`].
pub struct SplitMessages<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for SplitMessages<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }
        if self.remaining.len() < NLMSG_HDRLEN {
            tracing::error!(
                remaining = self.remaining.len(),
                "discarding trailing bytes shorter than a netlink header"
            );
            self.remaining = &[];
            return None;
        }
        let len = read_u32(self.remaining, 0) as usize;
        if len < NLMSG_HDRLEN || len > self.remaining.len() {
            tracing::error!(
                declared = len,
                remaining = self.remaining.len(),
                "discarding netlink message with invalid length"
            );
            self.remaining = &[];
            return None;
        }
        let (msg, rest) = self.remaining.split_at(len);
        let pad = (nla_align(len) - len).min(rest.len());
        self.remaining = &rest[pad..];
        Some(msg)
    }
}

// ---------------------------------------------------------------------------
// Writer helpers
// ---------------------------------------------------------------------------

/// Aligns to a 4-byte boundary.
fn nla_align(len: usize) -> usize {
    (len + 3) & !3
}

fn write_nlmsghdr(buf: &mut Vec<u8>, msg_type: u16, flags: u16, seq: u32, pid: u32) {
    buf.extend_from_slice(&0u32.to_ne_bytes()); // patched by finalize()
    buf.extend_from_slice(&msg_type.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&pid.to_ne_bytes());
}

fn finalize(buf: &mut [u8]) -> Result<()> {
    let len = u32::try_from(buf.len())
        .map_err(|_| Error::Codec(format!("message of {} bytes is too long", buf.len())))?;
    buf[0..4].copy_from_slice(&len.to_ne_bytes());
    Ok(())
}

fn push_attr(buf: &mut Vec<u8>, attr_type: u16, data: &[u8]) {
    let nla_len = NLA_HDRLEN + data.len();
    buf.extend_from_slice(&(nla_len as u16).to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(data);
    buf.resize(buf.len() + nla_align(nla_len) - nla_len, 0);
}

fn push_u32(buf: &mut Vec<u8>, attr_type: u16, value: u32) {
    push_attr(buf, attr_type, &value.to_ne_bytes());
}

fn push_addr(buf: &mut Vec<u8>, attr_type: u16, addr: &IpAddr) {
    push_attr(buf, attr_type, &addr_octets(addr));
}

fn push_str(buf: &mut Vec<u8>, attr_type: u16, value: &str) {
    let mut data = Vec::with_capacity(value.len() + 1);
    data.extend_from_slice(value.as_bytes());
    data.push(0);
    push_attr(buf, attr_type, &data);
}

fn push_nested(buf: &mut Vec<u8>, attr_type: u16, fill: impl FnOnce(&mut Vec<u8>)) {
    let mut inner = Vec::new();
    fill(&mut inner);
    push_attr(buf, attr_type, &inner);
}

/// In-body table byte; ids that do not fit use the compat sentinel.
fn table_byte(table: u32) -> u8 {
    u8::try_from(table).unwrap_or(RT_TABLE_COMPAT)
}

fn encode_link(buf: &mut Vec<u8>, link: &LinkEntry, with_attrs: bool) {
    buf.push(libc::AF_UNSPEC as u8);
    buf.push(0);
    buf.extend_from_slice(&link.link_type.to_ne_bytes());
    buf.extend_from_slice(&link.index.to_ne_bytes());
    buf.extend_from_slice(&link.flags.to_ne_bytes());
    buf.extend_from_slice(&link.change.to_ne_bytes());
    if !with_attrs {
        return;
    }
    if let Some(name) = &link.name {
        push_str(buf, IFLA_IFNAME, name);
    }
    if let Some(mtu) = link.mtu {
        push_u32(buf, IFLA_MTU, mtu);
    }
    if let Some(address) = &link.address {
        push_attr(buf, IFLA_ADDRESS, address);
    }
    if let Some(kind) = &link.kind {
        push_nested(buf, IFLA_LINKINFO, |inner| push_str(inner, IFLA_INFO_KIND, kind));
    }
}

fn encode_address(buf: &mut Vec<u8>, addr: &AddressEntry, with_attrs: bool) {
    let family = IpFamily::of_net(&addr.address);
    buf.push(family.af());
    buf.push(addr.address.prefix_len());
    buf.push((addr.flags & 0xff) as u8);
    buf.push(addr.scope.into());
    buf.extend_from_slice(&addr.interface_index.to_ne_bytes());
    if !with_attrs {
        return;
    }
    let ip = addr.address.addr();
    if family == IpFamily::V4 {
        push_addr(buf, IFA_LOCAL, &ip);
    }
    push_addr(buf, IFA_ADDRESS, &ip);
    if addr.flags > 0xff {
        push_u32(buf, IFA_FLAGS, addr.flags);
    }
}

fn encode_route(
    buf: &mut Vec<u8>,
    interface_index: i32,
    entry: &RouteEntry,
    with_attrs: bool,
) -> Result<()> {
    entry.validate()?;
    if entry.route_type == RouteType::Blackhole && !entry.is_default() {
        return Err(Error::Codec(format!(
            "blackhole route cannot carry destination {}",
            entry.dst
        )));
    }

    let src_len = if is_default_net(&entry.src) {
        0
    } else {
        entry.src.prefix_len()
    };
    buf.push(entry.family.af());
    buf.push(entry.dst.prefix_len());
    buf.push(src_len);
    buf.push(0); // tos
    buf.push(table_byte(entry.table));
    buf.push(entry.protocol.into());
    buf.push(entry.scope.into());
    buf.push(entry.route_type.into());
    buf.extend_from_slice(&0u32.to_ne_bytes()); // rtm_flags
    if !with_attrs {
        return Ok(());
    }

    if entry.route_type != RouteType::Blackhole && !entry.is_default() {
        push_addr(buf, RTA_DST, &entry.dst.addr());
    }
    if !is_default_net(&entry.src) {
        push_addr(buf, RTA_PREFSRC, &entry.src.addr());
    }
    if !entry.gateway.is_unspecified() {
        push_addr(buf, RTA_GATEWAY, &entry.gateway);
    }
    push_u32(buf, RTA_TABLE, entry.table);
    push_u32(buf, RTA_PRIORITY, entry.metric);
    // Reject routes take no output device.
    if interface_index > 0 && !entry.route_type.is_reject() {
        push_attr(buf, RTA_OIF, &interface_index.to_ne_bytes());
    }
    Ok(())
}

fn encode_rule(
    buf: &mut Vec<u8>,
    action: u8,
    entry: &RoutingPolicyEntry,
    with_attrs: bool,
) -> Result<()> {
    entry.validate()?;

    buf.push(entry.family.af());
    buf.push(entry.dst.map_or(0, |dst| dst.prefix_len()));
    buf.push(entry.src.map_or(0, |src| src.prefix_len()));
    buf.push(0); // tos
    buf.push(table_byte(entry.table));
    buf.push(0); // res1
    buf.push(0); // res2
    buf.push(action);
    let flags = if entry.invert_rule { FIB_RULE_INVERT } else { 0 };
    buf.extend_from_slice(&flags.to_ne_bytes());
    if !with_attrs {
        return Ok(());
    }

    push_u32(buf, FRA_PRIORITY, entry.priority);
    push_u32(buf, FRA_TABLE, entry.table);
    if let Some(dst) = &entry.dst {
        push_addr(buf, FRA_DST, &dst.addr());
    }
    if let Some(src) = &entry.src {
        push_addr(buf, FRA_SRC, &src.addr());
    }
    if let Some(mark) = &entry.fw_mark {
        push_u32(buf, FRA_FWMARK, mark.value);
        push_u32(buf, FRA_FWMASK, mark.mask);
    }
    if let Some(uids) = &entry.uid_range {
        let mut data = [0u8; 8];
        data[0..4].copy_from_slice(&uids.start.to_ne_bytes());
        data[4..8].copy_from_slice(&uids.end.to_ne_bytes());
        push_attr(buf, FRA_UID_RANGE, &data);
    }
    if let Some(iif) = &entry.iif_name {
        push_str(buf, FRA_IIFNAME, iif);
    }
    if let Some(oif) = &entry.oif_name {
        push_str(buf, FRA_OIFNAME, oif);
    }
    Ok(())
}

fn encode_neighbor(buf: &mut Vec<u8>, neigh: &NeighborEntry, with_attrs: bool) {
    buf.push(IpFamily::of(&neigh.destination).af());
    buf.push(0);
    buf.extend_from_slice(&0u16.to_ne_bytes());
    buf.extend_from_slice(&neigh.interface_index.to_ne_bytes());
    buf.extend_from_slice(&neigh.state.to_ne_bytes());
    buf.push(neigh.flags);
    buf.push(neigh.neighbor_type);
    if !with_attrs {
        return;
    }
    push_addr(buf, NDA_DST, &neigh.destination);
    if let Some(lladdr) = &neigh.link_address {
        push_attr(buf, NDA_LLADDR, lladdr);
    }
}

// ---------------------------------------------------------------------------
// Reader helpers
// ---------------------------------------------------------------------------

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Returns the first `len` bytes of `payload` or a truncation error.
fn body<'a>(payload: &'a [u8], len: usize, what: &str) -> Result<&'a [u8]> {
    payload.get(..len).ok_or_else(|| {
        Error::Codec(format!(
            "{} truncated: {} of {} bytes",
            what,
            payload.len(),
            len
        ))
    })
}

/// A parsed attribute list.
struct Attributes<'a> {
    attrs: Vec<(u16, &'a [u8])>,
}

impl<'a> Attributes<'a> {
    /// Parses attributes, rejecting remnants shorter than an attribute
    /// header and attributes that overrun the buffer.
    fn parse(mut data: &'a [u8]) -> Result<Self> {
        let mut attrs = Vec::new();
        while !data.is_empty() {
            if data.len() < NLA_HDRLEN {
                return Err(Error::Codec(format!(
                    "trailing attribute remnant of {} bytes",
                    data.len()
                )));
            }
            let len = read_u16(data, 0) as usize;
            let attr_type = read_u16(data, 2) & NLA_TYPE_MASK;
            if len < NLA_HDRLEN || len > data.len() {
                return Err(Error::Codec(format!(
                    "attribute {} length {} overruns {} remaining bytes",
                    attr_type,
                    len,
                    data.len()
                )));
            }
            attrs.push((attr_type, &data[NLA_HDRLEN..len]));
            data = &data[nla_align(len).min(data.len())..];
        }
        Ok(Self { attrs })
    }

    fn get(&self, attr_type: u16) -> Option<&'a [u8]> {
        self.attrs
            .iter()
            .find(|(t, _)| *t == attr_type)
            .map(|(_, value)| *value)
    }

    fn u32(&self, attr_type: u16) -> Result<Option<u32>> {
        self.get(attr_type)
            .map(|value| {
                if value.len() < 4 {
                    return Err(Error::Codec(format!(
                        "attribute {} too short for u32",
                        attr_type
                    )));
                }
                Ok(read_u32(value, 0))
            })
            .transpose()
    }

    fn addr(&self, attr_type: u16, family: IpFamily) -> Result<Option<IpAddr>> {
        self.get(attr_type)
            .map(|value| family.addr_from_bytes(value))
            .transpose()
    }

    fn string(&self, attr_type: u16) -> Result<Option<String>> {
        self.get(attr_type)
            .map(|value| {
                let value = value.split(|b| *b == 0).next().unwrap_or_default();
                String::from_utf8(value.to_vec())
                    .map_err(|_| Error::Codec(format!("attribute {} is not UTF-8", attr_type)))
            })
            .transpose()
    }
}

fn family_of(af: u8) -> Result<IpFamily> {
    IpFamily::from_af(af).ok_or_else(|| Error::Codec(format!("unsupported address family {}", af)))
}

fn prefix(addr: IpAddr, len: u8) -> Result<IpNet> {
    IpNet::new(addr, len).map_err(|_| Error::Codec(format!("invalid prefix length {}", len)))
}

fn decode_link(payload: &[u8]) -> Result<RtnlEntity> {
    let hdr = body(payload, IFINFOMSG_LEN, "ifinfomsg")?;
    let attrs = Attributes::parse(&payload[IFINFOMSG_LEN..])?;

    let kind = match attrs.get(IFLA_LINKINFO) {
        Some(info) => Attributes::parse(info)?.string(IFLA_INFO_KIND)?,
        None => None,
    };

    Ok(RtnlEntity::Link(LinkEntry {
        link_type: read_u16(hdr, 2),
        index: read_u32(hdr, 4) as i32,
        flags: read_u32(hdr, 8),
        change: read_u32(hdr, 12),
        name: attrs.string(IFLA_IFNAME)?,
        mtu: attrs.u32(IFLA_MTU)?,
        address: attrs.get(IFLA_ADDRESS).map(<[u8]>::to_vec),
        kind,
    }))
}

fn decode_address(payload: &[u8]) -> Result<RtnlEntity> {
    let hdr = body(payload, IFADDRMSG_LEN, "ifaddrmsg")?;
    let family = family_of(hdr[0])?;
    let attrs = Attributes::parse(&payload[IFADDRMSG_LEN..])?;

    let ip = match attrs.addr(IFA_LOCAL, family)? {
        Some(ip) => ip,
        None => attrs
            .addr(IFA_ADDRESS, family)?
            .ok_or_else(|| Error::Codec("address message without address".into()))?,
    };

    Ok(RtnlEntity::Address(AddressEntry {
        interface_index: read_u32(hdr, 4) as i32,
        address: prefix(ip, hdr[1])?,
        flags: attrs.u32(IFA_FLAGS)?.unwrap_or(u32::from(hdr[2])),
        scope: RouteScope::from(hdr[3]),
    }))
}

fn decode_route(payload: &[u8]) -> Result<RtnlEntity> {
    let hdr = body(payload, RTMSG_LEN, "rtmsg")?;
    let family = family_of(hdr[0])?;
    let attrs = Attributes::parse(&payload[RTMSG_LEN..])?;

    let dst_addr = attrs.addr(RTA_DST, family)?.unwrap_or(family.unspecified());
    let src_addr = match attrs.addr(RTA_PREFSRC, family)? {
        Some(src) => src,
        None => attrs.addr(RTA_SRC, family)?.unwrap_or(family.unspecified()),
    };
    let interface_index = attrs.u32(RTA_OIF)?.map_or(0, |oif| oif as i32);

    let entry = RouteEntry {
        family,
        dst: prefix(dst_addr, hdr[1])?,
        src: prefix(src_addr, hdr[2])?,
        gateway: attrs.addr(RTA_GATEWAY, family)?.unwrap_or(family.unspecified()),
        table: attrs.u32(RTA_TABLE)?.unwrap_or(u32::from(hdr[4])),
        metric: attrs.u32(RTA_PRIORITY)?.unwrap_or(0),
        scope: RouteScope::from(hdr[6]),
        protocol: RouteProtocol::from(hdr[5]),
        route_type: RouteType::from(hdr[7]),
        tag: 0,
    };

    Ok(RtnlEntity::Route {
        interface_index,
        entry,
    })
}

fn decode_rule(payload: &[u8]) -> Result<RtnlEntity> {
    let hdr = body(payload, FIB_RULE_HDR_LEN, "fib_rule_hdr")?;
    let family = family_of(hdr[0])?;
    let attrs = Attributes::parse(&payload[FIB_RULE_HDR_LEN..])?;

    let dst = match (attrs.addr(FRA_DST, family)?, hdr[1]) {
        (Some(addr), len) if len > 0 => Some(prefix(addr, len)?),
        _ => None,
    };
    let src = match (attrs.addr(FRA_SRC, family)?, hdr[2]) {
        (Some(addr), len) if len > 0 => Some(prefix(addr, len)?),
        _ => None,
    };

    let mark = attrs.u32(FRA_FWMARK)?;
    let mask = attrs.u32(FRA_FWMASK)?;
    let fw_mark = match (mark, mask) {
        (None, None) => None,
        (value, mask) => Some(FwMark {
            value: value.unwrap_or(0),
            mask: mask.unwrap_or(0xffff_ffff),
        }),
    };

    let uid_range = match attrs.get(FRA_UID_RANGE) {
        Some(value) if value.len() >= 8 => Some(UidRange {
            start: read_u32(value, 0),
            end: read_u32(value, 4),
        }),
        Some(value) => {
            return Err(Error::Codec(format!(
                "uid range attribute of {} bytes",
                value.len()
            )))
        }
        None => None,
    };

    let entry = RoutingPolicyEntry {
        family,
        priority: attrs.u32(FRA_PRIORITY)?.unwrap_or(0),
        table: attrs.u32(FRA_TABLE)?.unwrap_or(u32::from(hdr[4])),
        dst,
        src,
        fw_mark,
        uid_range,
        iif_name: attrs.string(FRA_IIFNAME)?,
        oif_name: attrs.string(FRA_OIFNAME)?,
        invert_rule: read_u32(hdr, 8) & FIB_RULE_INVERT != 0,
    };

    Ok(RtnlEntity::Rule {
        action: hdr[7],
        entry,
    })
}

fn decode_neighbor(payload: &[u8]) -> Result<RtnlEntity> {
    let hdr = body(payload, NDMSG_LEN, "ndmsg")?;
    let family = family_of(hdr[0])?;
    let attrs = Attributes::parse(&payload[NDMSG_LEN..])?;

    let destination = attrs
        .addr(NDA_DST, family)?
        .ok_or_else(|| Error::Codec("neighbor message without destination".into()))?;

    Ok(RtnlEntity::Neighbor(NeighborEntry {
        interface_index: read_u32(hdr, 4) as i32,
        destination,
        link_address: attrs.get(NDA_LLADDR).map(<[u8]>::to_vec),
        state: read_u16(hdr, 8),
        flags: hdr[10],
        neighbor_type: hdr[11],
    }))
}
