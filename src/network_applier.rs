//! Turns interface properties into routes and routing rules.
//!
//! Rules of one interface share a base priority derived from its rank:
//!
//! ```text
//! base = 10 + ranking_order * 10       (+ 1000 unless VPN)
//! ```
//!
//! A few fixed priorities sit just below the kernel's main table rule
//! (32766): destination rules at 32763, VPN user rules at 32764 and the
//! catch-all at 32765. A static rule at 1000 consults the main table
//! before any physical interface's rules.

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use nix::unistd::geteuid;

use crate::routing_policy::{RoutingPolicyService, RULE_PRIORITY_MAIN, STATIC_RULES_INDEX};
use crate::routing_table::RoutingTable;
use crate::types::{
    host_net, FwMark, IpFamily, RouteEntry, RouteType, RoutingPolicyEntry, UidRange,
    RT_TABLE_MAIN,
};
use crate::{Error, Result};

/// Base priority of the most preferred interface.
pub const DEFAULT_PRIORITY: u32 = 10;

/// Priority distance between consecutive ranks.
pub const PRIORITY_STEP: u32 = 10;

/// Added to the priority of every non-VPN interface.
pub const PHYSICAL_PRIORITY_OFFSET: u32 = 1000;

/// Destination rules from classless static routes.
pub const DST_RULE_PRIORITY: u32 = RULE_PRIORITY_MAIN - 3;

/// Rules sending user traffic into a VPN.
pub const VPN_UID_RULE_PRIORITY: u32 = RULE_PRIORITY_MAIN - 2;

/// Last-resort rule to the primary physical interface.
pub const CATCHALL_PRIORITY: u32 = RULE_PRIORITY_MAIN - 1;

/// Link technology of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Technology {
    Ethernet,
    Wifi,
    Cellular,
    Vpn,
    Other,
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Technology::Ethernet => write!(f, "ethernet"),
            Technology::Wifi => write!(f, "wifi"),
            Technology::Cellular => write!(f, "cellular"),
            Technology::Vpn => write!(f, "vpn"),
            Technology::Other => write!(f, "other"),
        }
    }
}

/// Inputs of [`NetworkApplier::apply_routing_policy`].
#[derive(Debug, Clone)]
pub struct RoutingPolicyParams {
    pub interface_index: i32,
    pub interface_name: String,
    pub technology: Technology,
    /// 0 is the most preferred interface.
    pub ranking_order: u32,
    pub is_primary_physical: bool,
    /// Addresses configured on the interface.
    pub addresses: Vec<IpNet>,
    /// Destinations of classless static routes learned over DHCP.
    pub classless_static_destinations: Vec<IpNet>,
}

impl RoutingPolicyParams {
    pub fn new(interface_index: i32, interface_name: impl Into<String>, technology: Technology) -> Self {
        Self {
            interface_index,
            interface_name: interface_name.into(),
            technology,
            ranking_order: 0,
            is_primary_physical: false,
            addresses: Vec::new(),
            classless_static_destinations: Vec::new(),
        }
    }

    /// Priority shared by the interface's own rules.
    ///
    /// Saturates for very large ranks.
    pub fn base_priority(&self) -> u32 {
        let mut priority = self
            .ranking_order
            .saturating_mul(PRIORITY_STEP)
            .saturating_add(DEFAULT_PRIORITY);
        if self.technology != Technology::Vpn {
            priority = priority.saturating_add(PHYSICAL_PRIORITY_OFFSET);
        }
        priority
    }
}

/// Inputs of [`NetworkApplier::apply_routes`] for one address family.
#[derive(Debug, Clone, Default)]
pub struct RouteConfig {
    /// Local address and prefix of the interface.
    pub local: Option<IpNet>,
    pub gateway: Option<IpAddr>,
    /// Install a link route when the gateway is outside the local subnet.
    pub fix_gateway_reachability: bool,
    pub default_route: bool,
    /// Drop IPv6 traffic on this interface instead of leaking it elsewhere.
    pub blackhole_ipv6: bool,
    /// Destinations routed through the gateway.
    pub included_routes: Vec<IpNet>,
    /// Destinations that fall through to the next rule.
    pub excluded_routes: Vec<IpNet>,
    /// Classless static routes with their own gateways.
    pub classless_static_routes: Vec<(IpNet, IpAddr)>,
}

/// Applies routes and rules for interfaces through the two managers.
pub struct NetworkApplier<'a> {
    table: &'a mut RoutingTable,
    policy: &'a mut RoutingPolicyService,
    own_uid: u32,
}

impl<'a> NetworkApplier<'a> {
    pub fn new(table: &'a mut RoutingTable, policy: &'a mut RoutingPolicyService) -> Self {
        let own_uid = geteuid().as_raw();
        Self {
            table,
            policy,
            own_uid,
        }
    }

    /// Overrides the UID allowed IPv6 access on background cellular links.
    pub fn with_own_uid(mut self, uid: u32) -> Self {
        self.own_uid = uid;
        self
    }

    /// Replaces the routing rules of an interface.
    ///
    /// Every rule is attempted; the first failure is returned.
    pub fn apply_routing_policy(&mut self, params: &RoutingPolicyParams) -> Result<()> {
        let index = params.interface_index;
        let table = self.table.per_device_table(index)?;
        let priority = params.base_priority();
        // Background cellular links carry IPv6 for this daemon only.
        let restrict_ipv6 = params.technology == Technology::Cellular && !params.is_primary_physical;
        tracing::info!(
            interface = index,
            ifname = %params.interface_name,
            technology = %params.technology,
            priority,
            table,
            "applying routing policy"
        );

        self.policy.flush_rules(index);
        let mut batch = Batch::default();

        if params.technology == Technology::Vpn {
            let uids = self.policy.get_user_traffic_uids().to_vec();
            for uid in uids {
                for family in IpFamily::ALL {
                    let rule = RoutingPolicyEntry::new(family)
                        .with_priority(VPN_UID_RULE_PRIORITY)
                        .with_table(table)
                        .with_uid_range(UidRange::single(uid));
                    batch.record(self.policy.add_rule(index, rule));
                }
            }
        }

        if params.is_primary_physical {
            for family in IpFamily::ALL {
                let main = RoutingPolicyEntry::new(family)
                    .with_priority(PHYSICAL_PRIORITY_OFFSET)
                    .with_table(RT_TABLE_MAIN);
                batch.record(self.policy.add_rule(STATIC_RULES_INDEX, main));

                let catchall = RoutingPolicyEntry::new(family)
                    .with_priority(CATCHALL_PRIORITY)
                    .with_table(table);
                batch.record(self.policy.add_rule(index, catchall));
            }
        }

        for dst in &params.classless_static_destinations {
            let rule = RoutingPolicyEntry::new(IpFamily::of_net(dst))
                .with_priority(DST_RULE_PRIORITY)
                .with_table(table)
                .with_dst(*dst);
            batch.record(self.policy.add_rule(index, rule));
        }

        let own_uid = self.own_uid;
        let restrict = |rule: RoutingPolicyEntry| {
            if restrict_ipv6 && rule.family == IpFamily::V6 {
                rule.with_uid_range(UidRange::single(own_uid))
            } else {
                rule
            }
        };
        let base = |family| {
            RoutingPolicyEntry::new(family)
                .with_priority(priority)
                .with_table(table)
        };

        for family in IpFamily::ALL {
            let rule = restrict(base(family).with_fw_mark(FwMark::for_table(table)));
            batch.record(self.policy.add_rule(index, rule));
        }

        for family in IpFamily::ALL {
            let rule = restrict(base(family).with_oif(params.interface_name.as_str()));
            batch.record(self.policy.add_rule(index, rule));
        }

        if params.technology != Technology::Vpn {
            for address in &params.addresses {
                let rule = restrict(
                    base(IpFamily::of_net(address)).with_src(host_net(address.addr())),
                );
                batch.record(self.policy.add_rule(index, rule));
            }
            for family in IpFamily::ALL {
                let rule = restrict(base(family).with_iif(params.interface_name.as_str()));
                batch.record(self.policy.add_rule(index, rule));
            }
        }

        self.table.flush_cache();
        batch.finish()
    }

    /// Replaces the routes of an interface for one address family.
    ///
    /// Every route is attempted; the first failure is returned.
    pub fn apply_routes(&mut self, interface_index: i32, config: &RouteConfig) -> Result<()> {
        let table = self.table.per_device_table(interface_index)?;
        tracing::info!(interface = interface_index, table, "applying routes");
        self.table.flush_routes(interface_index);
        let mut batch = Batch::default();

        if let (Some(local), Some(gateway)) = (config.local, config.gateway) {
            let same_family = IpFamily::of_net(&local) == IpFamily::of(&gateway);
            if config.fix_gateway_reachability && same_family && !local.contains(&gateway) {
                // Treat the gateway as on-link.
                let on_link = IpNet::new(local.addr(), 0).expect("valid prefix");
                tracing::info!(interface = interface_index, %gateway, %local, "gateway outside local subnet");
                batch.record(
                    self.table
                        .create_link_route(interface_index, on_link, gateway, table),
                );
            }
        }

        if config.default_route {
            match (config.gateway, config.local) {
                (Some(gateway), _) => {
                    batch.record(self.table.set_default_route(interface_index, gateway, table));
                }
                (None, Some(local)) => {
                    // Point-to-point links route straight out of the device.
                    let family = IpFamily::of_net(&local);
                    let entry = RouteEntry::default_route(family)
                        .with_table(table)
                        .with_metric(self.table.default_route_metric())
                        .with_tag(interface_index);
                    batch.record(self.table.add_route(interface_index, entry));
                }
                (None, None) => {
                    tracing::warn!(interface = interface_index, "no gateway or address for default route");
                }
            }
        }

        if config.blackhole_ipv6 {
            batch.record(
                self.table
                    .create_blackhole_route(interface_index, IpFamily::V6, 0, table),
            );
        }

        for dst in &config.included_routes {
            let family = IpFamily::of_net(dst);
            let gateway = config
                .gateway
                .filter(|gateway| IpFamily::of(gateway) == family)
                .unwrap_or(family.unspecified());
            let entry = RouteEntry::new(*dst, family.default_net(), gateway)
                .with_table(table)
                .with_tag(interface_index);
            batch.record(self.table.add_route(interface_index, entry));
        }

        for (dst, gateway) in &config.classless_static_routes {
            let family = IpFamily::of_net(dst);
            let entry = RouteEntry::new(*dst, family.default_net(), *gateway)
                .with_table(table)
                .with_tag(interface_index);
            batch.record(self.table.add_route(interface_index, entry));
        }

        for dst in &config.excluded_routes {
            let family = IpFamily::of_net(dst);
            let entry = RouteEntry::new(*dst, family.default_net(), family.unspecified())
                .with_type(RouteType::Throw)
                .with_table(table)
                .with_tag(interface_index);
            batch.record(self.table.add_route(interface_index, entry));
        }

        batch.finish()
    }

    /// Removes everything installed for an interface that went away.
    pub fn clear(&mut self, interface_index: i32, ifname: &str) {
        tracing::info!(interface = interface_index, ifname, "clearing interface");
        self.policy.flush_rules(interface_index);
        self.table.flush_routes(interface_index);
        self.table.deregister_device(interface_index, ifname);
    }
}

/// Keeps going after a failed request and remembers the first error.
#[derive(Default)]
struct Batch {
    first_error: Option<Error>,
}

impl Batch {
    fn record(&mut self, result: Result<()>) {
        if let Err(e) = result {
            tracing::warn!(error = %e, "request failed");
            self.first_error.get_or_insert(e);
        }
    }

    fn finish(self) -> Result<()> {
        match self.first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
