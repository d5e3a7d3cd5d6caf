//! Policy-based routing core for Linux network daemons.
//!
//! Programs the kernel's routing tables and routing policy database (RPDB)
//! for many interfaces at once. Each interface gets a routing table of its
//! own; rules decide which table a packet consults.
//!
//! # Quick Start
//!
//! ```no_run
//! # use policyroute::{RoutingConfig, RoutingPolicyParams, RoutingService, Technology};
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let routing = RoutingService::start(RoutingConfig::default()).await?;
//! routing.register_device(3, "eth0").await?;
//!
//! let mut params = RoutingPolicyParams::new(3, "eth0", Technology::Ethernet);
//! params.is_primary_physical = true;
//! params.addresses = vec!["198.51.100.101/24".parse()?];
//! routing.apply_routing_policy(params).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Layout
//!
//! - [`wire`]: rtnetlink message encoding and decoding
//! - [`socket`]: the `NETLINK_ROUTE` socket and sequence numbering
//! - [`routing_table`]: per-interface routes and kernel reconciliation
//! - [`routing_policy`]: per-interface rules and stale rule collection
//! - [`network_applier`]: routes and rules derived from interface properties
//! - [`service`]: the event loop tying the above together
//!
//! The managers are plain structs driven by [`RoutingService`]; tests and
//! embedders can construct them directly around any [`Transport`].

mod config;
mod error;
mod sysctl;
mod types;

pub mod network_applier;
pub mod routing_policy;
pub mod routing_table;
pub mod service;
pub mod socket;
pub mod wire;

#[cfg(test)]
mod testing;

pub use config::{RoutingConfig, DEFAULT_ROUTE_METRIC, DEFAULT_TABLE_ID_OFFSET, KERNEL_SLAAC_METRIC};
pub use error::Error;
pub use network_applier::{NetworkApplier, RouteConfig, RoutingPolicyParams, Technology};
pub use routing_policy::{RoutingPolicyService, SystemUserDatabase, UserDatabase};
pub use routing_table::{RouteQueryCallback, RoutingTable};
pub use service::{RoutingHandle, RoutingService};
pub use socket::{Groups, RtnlHandler, RtnlSocket, Transport};
pub use sysctl::{Sysctl, SysctlFs};
pub use types::{
    host_net, AddressEntry, FwMark, IpFamily, LinkEntry, NeighborEntry, RouteEntry,
    RouteProtocol, RouteScope, RouteType, RoutingPolicyEntry, UidRange, RT_TABLE_MAIN,
    RT_TABLE_UNSPEC,
};
pub use wire::{Mode, RtnlEntity, RtnlMessage};

/// Result type for routing operations.
pub type Result<T> = std::result::Result<T, Error>;
