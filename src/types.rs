//! Core types for routing table and routing policy entries.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

use crate::{Error, Result};

/// The kernel's main routing table.
pub const RT_TABLE_MAIN: u32 = 254;

/// Unspecified routing table.
pub const RT_TABLE_UNSPEC: u32 = 0;

/// Address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Both families, IPv4 first.
    pub const ALL: [IpFamily; 2] = [IpFamily::V4, IpFamily::V6];

    /// Returns the family of an address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    /// Returns the family of a prefix.
    pub fn of_net(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => IpFamily::V4,
            IpNet::V6(_) => IpFamily::V6,
        }
    }

    /// Maps a kernel `AF_*` value to a family.
    pub fn from_af(af: u8) -> Option<Self> {
        match i32::from(af) {
            libc::AF_INET => Some(IpFamily::V4),
            libc::AF_INET6 => Some(IpFamily::V6),
            _ => None,
        }
    }

    /// Returns the kernel `AF_*` value.
    pub fn af(self) -> u8 {
        match self {
            IpFamily::V4 => libc::AF_INET as u8,
            IpFamily::V6 => libc::AF_INET6 as u8,
        }
    }

    /// Address length in bytes.
    pub fn addr_len(self) -> usize {
        match self {
            IpFamily::V4 => 4,
            IpFamily::V6 => 16,
        }
    }

    /// Longest prefix length of the family.
    pub fn max_prefix_len(self) -> u8 {
        match self {
            IpFamily::V4 => 32,
            IpFamily::V6 => 128,
        }
    }

    /// The all-zero address.
    pub fn unspecified(self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// The all-zero address with prefix length 0.
    pub fn default_net(self) -> IpNet {
        IpNet::new(self.unspecified(), 0).expect("valid prefix")
    }

    /// Parses raw address octets of this family.
    pub fn addr_from_bytes(self, bytes: &[u8]) -> Result<IpAddr> {
        match self {
            IpFamily::V4 => <[u8; 4]>::try_from(bytes)
                .map(|b| IpAddr::V4(Ipv4Addr::from(b)))
                .map_err(|_| Error::Codec(format!("invalid IPv4 address length {}", bytes.len()))),
            IpFamily::V6 => <[u8; 16]>::try_from(bytes)
                .map(|b| IpAddr::V6(Ipv6Addr::from(b)))
                .map_err(|_| Error::Codec(format!("invalid IPv6 address length {}", bytes.len()))),
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "IPv4"),
            IpFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// Returns true if the prefix is the all-zero address with prefix 0.
pub fn is_default_net(net: &IpNet) -> bool {
    net.prefix_len() == 0 && net.addr().is_unspecified()
}

/// Returns `addr` as a host prefix (/32 or /128).
pub fn host_net(addr: IpAddr) -> IpNet {
    let prefix_len = IpFamily::of(&addr).max_prefix_len();
    IpNet::new(addr, prefix_len).expect("valid prefix")
}

/// Raw address octets.
pub fn addr_octets(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => a.octets().to_vec(),
    }
}

macro_rules! kernel_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:expr => $text:expr,)* }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)*
            /// A value without a named variant.
            Other(u8),
        }

        impl From<u8> for $name {
            fn from(v: u8) -> Self {
                match v {
                    $($value => $name::$variant,)*
                    other => $name::Other(other),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(v: $name) -> Self {
                match v {
                    $($name::$variant => $value,)*
                    $name::Other(other) => other,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $($name::$variant => write!(f, $text),)*
                    $name::Other(other) => write!(f, "{}", other),
                }
            }
        }
    };
}

kernel_enum! {
    /// Route type (`RTN_*`).
    RouteType {
        Unspec = 0 => "unspec",
        Unicast = 1 => "unicast",
        Local = 2 => "local",
        Broadcast = 3 => "broadcast",
        Anycast = 4 => "anycast",
        Multicast = 5 => "multicast",
        Blackhole = 6 => "blackhole",
        Unreachable = 7 => "unreachable",
        Prohibit = 8 => "prohibit",
        Throw = 9 => "throw",
    }
}

impl RouteType {
    /// Types that drop traffic and take no next hop.
    pub fn is_reject(self) -> bool {
        matches!(
            self,
            RouteType::Blackhole | RouteType::Unreachable | RouteType::Prohibit
        )
    }
}

kernel_enum! {
    /// Route origin (`RTPROT_*`).
    RouteProtocol {
        /// Query replies carry no protocol.
        Unspec = 0 => "unspec",
        Redirect = 1 => "redirect",
        Kernel = 2 => "kernel",
        /// Routes installed by this daemon.
        Boot = 3 => "boot",
        Static = 4 => "static",
        /// Routes injected by received router advertisements.
        Ra = 9 => "ra",
        Dhcp = 16 => "dhcp",
    }
}

kernel_enum! {
    /// Route scope (`RT_SCOPE_*`).
    RouteScope {
        Universe = 0 => "global",
        Site = 200 => "site",
        Link = 253 => "link",
        Host = 254 => "host",
        Nowhere = 255 => "nowhere",
    }
}

/// One routing table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub family: IpFamily,
    pub dst: IpNet,
    pub src: IpNet,
    pub gateway: IpAddr,
    pub table: u32,
    pub metric: u32,
    pub scope: RouteScope,
    pub protocol: RouteProtocol,
    pub route_type: RouteType,
    /// Local bookkeeping tag for bulk removal; never sent to the kernel.
    pub tag: i32,
}

impl RouteEntry {
    /// Creates a unicast route in the main table.
    pub fn new(dst: IpNet, src: IpNet, gateway: IpAddr) -> Self {
        Self {
            family: IpFamily::of_net(&dst),
            dst,
            src,
            gateway,
            table: RT_TABLE_MAIN,
            metric: 0,
            scope: RouteScope::Universe,
            protocol: RouteProtocol::Boot,
            route_type: RouteType::Unicast,
            tag: 0,
        }
    }

    /// Creates a route whose destination, source and gateway are all unset.
    pub fn default_route(family: IpFamily) -> Self {
        Self::new(family.default_net(), family.default_net(), family.unspecified())
    }

    pub fn with_table(mut self, table: u32) -> Self {
        self.table = table;
        self
    }

    pub fn with_metric(mut self, metric: u32) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_scope(mut self, scope: RouteScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_protocol(mut self, protocol: RouteProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_type(mut self, route_type: RouteType) -> Self {
        self.route_type = route_type;
        self
    }

    pub fn with_tag(mut self, tag: i32) -> Self {
        self.tag = tag;
        self
    }

    /// Returns true if the destination is the default route.
    pub fn is_default(&self) -> bool {
        is_default_net(&self.dst)
    }

    /// Checks that every address matches `family`.
    pub fn validate(&self) -> Result<()> {
        let consistent = IpFamily::of_net(&self.dst) == self.family
            && IpFamily::of_net(&self.src) == self.family
            && IpFamily::of(&self.gateway) == self.family;
        if consistent {
            Ok(())
        } else {
            Err(Error::FamilyMismatch)
        }
    }

    /// Compares the fields the kernel reports back in notifications,
    /// ignoring the table and local bookkeeping.
    pub fn same_route(&self, other: &RouteEntry) -> bool {
        self.dst == other.dst
            && self.src == other.src
            && self.gateway == other.gateway
            && self.scope == other.scope
            && self.metric == other.metric
            && self.route_type == other.route_type
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.route_type != RouteType::Unicast {
            write!(f, "{} ", self.route_type)?;
        }
        if self.is_default() {
            write!(f, "default")?;
        } else {
            write!(f, "{}", self.dst)?;
        }
        if !self.gateway.is_unspecified() {
            write!(f, " via {}", self.gateway)?;
        }
        if !is_default_net(&self.src) {
            write!(f, " src {}", self.src)?;
        }
        write!(f, " table {}", self.table)?;
        if self.metric != 0 {
            write!(f, " metric {}", self.metric)?;
        }
        if self.scope != RouteScope::Universe {
            write!(f, " scope {}", self.scope)?;
        }
        if self.protocol != RouteProtocol::Boot {
            write!(f, " proto {}", self.protocol)?;
        }
        if self.tag != 0 {
            write!(f, " tag {}", self.tag)?;
        }
        Ok(())
    }
}

/// Firewall mark match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FwMark {
    pub value: u32,
    pub mask: u32,
}

impl FwMark {
    /// Mark selecting a per-device table: the table id in the upper 16 bits.
    pub fn for_table(table: u32) -> Self {
        Self {
            value: table << 16,
            mask: 0xffff_0000,
        }
    }
}

impl fmt::Display for FwMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{:#x}", self.value, self.mask)
    }
}

/// Inclusive UID range match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UidRange {
    pub start: u32,
    pub end: u32,
}

impl UidRange {
    /// Range matching a single UID.
    pub fn single(uid: u32) -> Self {
        Self {
            start: uid,
            end: uid,
        }
    }
}

impl fmt::Display for UidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// One routing policy (RPDB) rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPolicyEntry {
    pub family: IpFamily,
    pub priority: u32,
    pub table: u32,
    pub dst: Option<IpNet>,
    pub src: Option<IpNet>,
    pub fw_mark: Option<FwMark>,
    pub uid_range: Option<UidRange>,
    pub iif_name: Option<String>,
    pub oif_name: Option<String>,
    pub invert_rule: bool,
}

impl RoutingPolicyEntry {
    /// Creates a rule with no match criteria that looks up the main table.
    pub fn new(family: IpFamily) -> Self {
        Self {
            family,
            priority: 0,
            table: RT_TABLE_MAIN,
            dst: None,
            src: None,
            fw_mark: None,
            uid_range: None,
            iif_name: None,
            oif_name: None,
            invert_rule: false,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_table(mut self, table: u32) -> Self {
        self.table = table;
        self
    }

    /// Sets the destination match. A zero-length prefix matches everything
    /// and is stored as no match, which is how the kernel reports it.
    pub fn with_dst(mut self, dst: IpNet) -> Self {
        self.dst = (dst.prefix_len() != 0).then_some(dst);
        self
    }

    /// Sets the source match; see [`Self::with_dst`].
    pub fn with_src(mut self, src: IpNet) -> Self {
        self.src = (src.prefix_len() != 0).then_some(src);
        self
    }

    pub fn with_fw_mark(mut self, fw_mark: FwMark) -> Self {
        self.fw_mark = Some(fw_mark);
        self
    }

    pub fn with_uid_range(mut self, uid_range: UidRange) -> Self {
        self.uid_range = Some(uid_range);
        self
    }

    pub fn with_iif(mut self, name: impl Into<String>) -> Self {
        self.iif_name = Some(name.into());
        self
    }

    pub fn with_oif(mut self, name: impl Into<String>) -> Self {
        self.oif_name = Some(name.into());
        self
    }

    pub fn inverted(mut self) -> Self {
        self.invert_rule = true;
        self
    }

    /// Checks that the prefixes match `family`.
    pub fn validate(&self) -> Result<()> {
        let mismatched = [self.dst, self.src]
            .iter()
            .flatten()
            .any(|net| IpFamily::of_net(net) != self.family);
        if mismatched {
            Err(Error::FamilyMismatch)
        } else {
            Ok(())
        }
    }
}

impl fmt::Display for RoutingPolicyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: ", self.family, self.priority)?;
        if self.invert_rule {
            write!(f, "not ")?;
        }
        match &self.src {
            Some(src) => write!(f, "from {}", src)?,
            None => write!(f, "from all")?,
        }
        if let Some(dst) = &self.dst {
            write!(f, " to {}", dst)?;
        }
        if let Some(mark) = &self.fw_mark {
            write!(f, " fwmark {}", mark)?;
        }
        if let Some(uids) = &self.uid_range {
            write!(f, " uidrange {}", uids)?;
        }
        if let Some(iif) = &self.iif_name {
            write!(f, " iif {}", iif)?;
        }
        if let Some(oif) = &self.oif_name {
            write!(f, " oif {}", oif)?;
        }
        write!(f, " lookup {}", self.table)
    }
}

/// A network link as reported by `RTM_*LINK`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkEntry {
    pub index: i32,
    /// Hardware type (`ARPHRD_*`).
    pub link_type: u16,
    pub flags: u32,
    pub change: u32,
    pub name: Option<String>,
    pub mtu: Option<u32>,
    pub address: Option<Vec<u8>>,
    /// Driver kind from `IFLA_INFO_KIND` (e.g. "veth", "wireguard").
    pub kind: Option<String>,
}

impl fmt::Display for LinkEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link {}", self.index)?;
        if let Some(name) = &self.name {
            write!(f, " {}", name)?;
        }
        if let Some(kind) = &self.kind {
            write!(f, " kind {}", kind)?;
        }
        if let Some(mtu) = self.mtu {
            write!(f, " mtu {}", mtu)?;
        }
        if let Some(address) = &self.address {
            write!(f, " address {}", hex_colon(address))?;
        }
        if self.flags != 0 {
            write!(f, " flags {:#x}", self.flags)?;
        }
        Ok(())
    }
}

/// An interface address as reported by `RTM_*ADDR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    pub interface_index: i32,
    pub address: IpNet,
    pub flags: u32,
    pub scope: RouteScope,
}

impl fmt::Display for AddressEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "address {} dev {}", self.address, self.interface_index)?;
        if self.scope != RouteScope::Universe {
            write!(f, " scope {}", self.scope)?;
        }
        if self.flags != 0 {
            write!(f, " flags {:#x}", self.flags)?;
        }
        Ok(())
    }
}

/// A neighbor cache entry as reported by `RTM_*NEIGH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub interface_index: i32,
    pub destination: IpAddr,
    pub link_address: Option<Vec<u8>>,
    /// `NUD_*` state bits.
    pub state: u16,
    pub flags: u8,
    pub neighbor_type: u8,
}

impl fmt::Display for NeighborEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "neighbor {} dev {}", self.destination, self.interface_index)?;
        if let Some(lladdr) = &self.link_address {
            write!(f, " lladdr {}", hex_colon(lladdr))?;
        }
        write!(f, " state {:#x}", self.state)
    }
}

fn hex_colon(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_display_omits_defaults() {
        let entry = RouteEntry::default_route(IpFamily::V4).with_table(1003);
        assert_eq!(entry.to_string(), "default table 1003");

        let entry = RouteEntry::new(
            "10.0.0.0/8".parse().unwrap(),
            IpFamily::V4.default_net(),
            "192.168.1.1".parse().unwrap(),
        )
        .with_table(1003)
        .with_metric(10)
        .with_protocol(RouteProtocol::Ra)
        .with_tag(3);
        assert_eq!(
            entry.to_string(),
            "10.0.0.0/8 via 192.168.1.1 table 1003 metric 10 proto ra tag 3"
        );
    }

    #[test]
    fn test_rule_display() {
        let rule = RoutingPolicyEntry::new(IpFamily::V4)
            .with_priority(1010)
            .with_table(1003)
            .with_fw_mark(FwMark::for_table(1003))
            .with_uid_range(UidRange::single(20104));
        assert_eq!(
            rule.to_string(),
            "IPv4 1010: from all fwmark 0x3eb0000/0xffff0000 uidrange 20104-20104 lookup 1003"
        );
    }

    #[test]
    fn test_zero_length_prefix_is_no_match() {
        let rule = RoutingPolicyEntry::new(IpFamily::V6).with_dst(IpFamily::V6.default_net());
        assert_eq!(rule.dst, None);
    }

    #[test]
    fn test_family_validation() {
        let mut entry = RouteEntry::default_route(IpFamily::V4);
        assert!(entry.validate().is_ok());
        entry.gateway = "fe80::1".parse().unwrap();
        assert!(matches!(entry.validate(), Err(Error::FamilyMismatch)));

        let rule = RoutingPolicyEntry::new(IpFamily::V4).with_src("2001:db8::1/128".parse().unwrap());
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_kernel_enum_roundtrip() {
        assert_eq!(RouteProtocol::from(9), RouteProtocol::Ra);
        assert_eq!(u8::from(RouteProtocol::Other(42)), 42);
        assert_eq!(RouteType::from(6), RouteType::Blackhole);
        assert!(RouteType::Unreachable.is_reject());
        assert!(!RouteType::Throw.is_reject());
    }
}
