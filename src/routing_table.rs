//! Per-interface routing tables.
//!
//! [`RoutingTable`] keeps a shadow copy of the routes of every interface,
//! keyed by interface index. Changes made through it update the shadow
//! optimistically; changes made by anyone else (the kernel installing
//! router advertisement routes, an operator running `ip route`) are folded
//! in by [`RoutingTable::on_kernel_message`].
//!
//! Once an interface is registered, its unicast routes live in a table of
//! its own, `interface_index + table_id_offset`. Routes the kernel puts
//! elsewhere are moved there.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;

use crate::config::RoutingConfig;
use crate::socket::RtnlHandler;
use crate::sysctl::{accept_ra_rt_table_key, Sysctl, ROUTE_FLUSH_KEYS};
use crate::types::{
    host_net, IpFamily, RouteEntry, RouteProtocol, RouteScope, RouteType, RT_TABLE_UNSPEC,
};
use crate::wire::{Mode, RtnlEntity, RtnlMessage, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REPLACE};
use crate::{Error, Result};

/// Invoked once with the outcome of a route query.
pub type RouteQueryCallback = Box<dyn FnOnce(Result<RouteEntry>) + Send>;

/// A route query waiting for its reply.
struct RouteQuery {
    /// Sequence number of the request, `None` until it is sent.
    sequence: Option<u32>,
    interface_index: i32,
    destination: IpAddr,
    tag: i32,
    /// Table to install the resulting host route into.
    table: Option<u32>,
    callback: RouteQueryCallback,
}

/// Returns true if sequence `a` was issued before `b`, allowing for
/// wraparound.
pub fn is_sequence_older(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Returns true if `candidate` should replace `current` as the default
/// route of an interface. Lower metric wins; on a tie the earlier entry
/// is kept.
pub fn is_preferred_default(candidate: &RouteEntry, current: &RouteEntry) -> bool {
    candidate.metric < current.metric
}

/// Shadow routing tables of all interfaces.
pub struct RoutingTable {
    rtnl: Arc<RtnlHandler>,
    sysctl: Arc<dyn Sysctl>,
    config: RoutingConfig,
    tables: HashMap<i32, Vec<RouteEntry>>,
    managed: HashSet<i32>,
    route_queries: VecDeque<RouteQuery>,
}

impl RoutingTable {
    pub fn new(rtnl: Arc<RtnlHandler>, sysctl: Arc<dyn Sysctl>, config: RoutingConfig) -> Self {
        Self {
            rtnl,
            sysctl,
            config,
            tables: HashMap::new(),
            managed: HashSet::new(),
            route_queries: VecDeque::new(),
        }
    }

    /// Routing table id owned by `interface_index`.
    ///
    /// Only real interfaces (index 1 and up) own a table.
    pub fn per_device_table(&self, interface_index: i32) -> Result<u32> {
        u32::try_from(interface_index)
            .ok()
            .filter(|&index| index > 0)
            .and_then(|index| index.checked_add(self.config.table_id_offset))
            .ok_or(Error::InvalidInterface {
                index: interface_index,
            })
    }

    /// Shadow routes of an interface.
    pub fn routes(&self, interface_index: i32) -> &[RouteEntry] {
        self.tables
            .get(&interface_index)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Metric of default routes installed by this daemon.
    pub fn default_route_metric(&self) -> u32 {
        self.config.default_route_metric
    }

    pub fn is_managed(&self, interface_index: i32) -> bool {
        self.managed.contains(&interface_index)
    }

    /// Number of route queries not yet answered.
    pub fn pending_queries(&self) -> usize {
        self.route_queries.len()
    }

    /// Puts an interface under per-device table management.
    ///
    /// Known routes outside the per-device table are added there before
    /// the original is deleted, so the destination stays routable.
    pub fn register_device(&mut self, interface_index: i32, ifname: &str) -> Result<()> {
        let table = self.per_device_table(interface_index)?;
        tracing::info!(interface = interface_index, ifname, table, "registering device");
        self.managed.insert(interface_index);

        let stale: Vec<(usize, RouteEntry)> = self
            .routes(interface_index)
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.table != table && !entry.route_type.is_reject())
            .map(|(i, entry)| (i, entry.clone()))
            .collect();

        for (i, entry) in stale {
            let moved = entry.clone().with_table(table);
            if let Err(e) = self.move_route(interface_index, &entry, &moved) {
                tracing::warn!(interface = interface_index, %entry, error = %e, "failed to move route");
                continue;
            }
            if let Some(slot) = self
                .tables
                .get_mut(&interface_index)
                .and_then(|routes| routes.get_mut(i))
            {
                *slot = moved;
            }
        }

        let value = format!("-{}", self.config.table_id_offset);
        if let Err(e) = self.sysctl.write(&accept_ra_rt_table_key(ifname), &value) {
            tracing::warn!(ifname, error = %e, "failed to redirect router advertisement routes");
        }
        Ok(())
    }

    /// Takes an interface out of per-device table management.
    pub fn deregister_device(&mut self, interface_index: i32, ifname: &str) {
        tracing::info!(interface = interface_index, ifname, "deregistering device");
        self.managed.remove(&interface_index);

        match self.sysctl.write(&accept_ra_rt_table_key(ifname), "0") {
            Ok(()) => {}
            // The interface is already gone.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(ifname, error = %e, "failed to reset router advertisement table");
            }
        }
    }

    /// Installs a route for an interface.
    ///
    /// Unicast and throw routes must target the interface's own table;
    /// blackhole and unreachable routes may target any table.
    pub fn add_route(&mut self, interface_index: i32, entry: RouteEntry) -> Result<()> {
        let expected = self.per_device_table(interface_index)?;
        let any_table = matches!(entry.route_type, RouteType::Blackhole | RouteType::Unreachable);
        if entry.table != expected && !any_table {
            return Err(Error::InvalidTable {
                table: entry.table,
                expected,
            });
        }

        self.send_route(Mode::Add, NLM_F_CREATE | NLM_F_EXCL, interface_index, &entry)?;
        self.tables.entry(interface_index).or_default().push(entry);
        Ok(())
    }

    /// Deletes a route of an interface.
    pub fn remove_route(&mut self, interface_index: i32, entry: &RouteEntry) -> Result<()> {
        self.send_route(Mode::Delete, 0, interface_index, entry)?;

        let routes = self.tables.entry(interface_index).or_default();
        match routes.iter().position(|existing| existing == entry) {
            Some(i) => {
                routes.remove(i);
            }
            None => {
                tracing::debug!(interface = interface_index, %entry, "removed route was not tracked");
            }
        }
        Ok(())
    }

    /// Returns the preferred unicast default route of an interface.
    pub fn get_default_route(&self, interface_index: i32, family: IpFamily) -> Option<RouteEntry> {
        self.default_route_where(interface_index, family, |_| true)
    }

    fn default_route_where(
        &self,
        interface_index: i32,
        family: IpFamily,
        filter: impl Fn(&RouteEntry) -> bool,
    ) -> Option<RouteEntry> {
        self.routes(interface_index)
            .iter()
            .filter(|entry| {
                entry.family == family
                    && entry.is_default()
                    && entry.route_type == RouteType::Unicast
                    && filter(entry)
            })
            .fold(None, |best: Option<&RouteEntry>, entry| match best {
                Some(current) if !is_preferred_default(entry, current) => Some(current),
                _ => Some(entry),
            })
            .cloned()
    }

    /// Points the interface's default route at `gateway`.
    ///
    /// Only the default route installed through this call is replaced;
    /// kernel router advertisement routes are left alone.
    pub fn set_default_route(
        &mut self,
        interface_index: i32,
        gateway: IpAddr,
        table: u32,
    ) -> Result<()> {
        let expected = self.per_device_table(interface_index)?;
        if table != expected {
            return Err(Error::InvalidTable { table, expected });
        }

        let family = IpFamily::of(&gateway);
        let metric = self.config.default_route_metric;
        let previous = self.default_route_where(interface_index, family, |entry| {
            entry.protocol == RouteProtocol::Boot && entry.metric == metric
        });
        if let Some(old) = previous {
            if old.gateway == gateway && old.table == table {
                return Ok(());
            }
            if let Err(e) = self.remove_route(interface_index, &old) {
                tracing::warn!(interface = interface_index, entry = %old, error = %e, "failed to remove old default route");
            }
        }

        let entry = RouteEntry::new(family.default_net(), family.default_net(), gateway)
            .with_table(table)
            .with_metric(metric)
            .with_tag(interface_index);
        tracing::info!(interface = interface_index, %entry, "setting default route");
        self.add_route(interface_index, entry)
    }

    /// Deletes every route of an interface.
    pub fn flush_routes(&mut self, interface_index: i32) {
        let routes = self.tables.remove(&interface_index).unwrap_or_default();
        for entry in &routes {
            if let Err(e) = self.send_route(Mode::Delete, 0, interface_index, entry) {
                tracing::warn!(interface = interface_index, %entry, error = %e, "failed to flush route");
            }
        }
    }

    /// Deletes every route carrying `tag`, across all interfaces.
    pub fn flush_routes_with_tag(&mut self, tag: i32) {
        let mut flushed = Vec::new();
        for (&interface_index, routes) in self.tables.iter_mut() {
            routes.retain(|entry| {
                if entry.tag == tag {
                    flushed.push((interface_index, entry.clone()));
                    false
                } else {
                    true
                }
            });
        }
        for (interface_index, entry) in flushed {
            if let Err(e) = self.send_route(Mode::Delete, 0, interface_index, &entry) {
                tracing::warn!(interface = interface_index, %entry, error = %e, "failed to flush route");
            }
        }
    }

    /// Installs a default blackhole route of `family` into `table`.
    pub fn create_blackhole_route(
        &mut self,
        interface_index: i32,
        family: IpFamily,
        metric: u32,
        table: u32,
    ) -> Result<()> {
        let entry = RouteEntry::default_route(family)
            .with_type(RouteType::Blackhole)
            .with_metric(metric)
            .with_table(table);
        self.add_route(interface_index, entry)
    }

    /// Installs an on-link host route to `remote`.
    ///
    /// `remote` must lie inside the subnet of `local`.
    pub fn create_link_route(
        &mut self,
        interface_index: i32,
        local: IpNet,
        remote: IpAddr,
        table: u32,
    ) -> Result<()> {
        if !local.contains(&remote) {
            return Err(Error::Unreachable { local, remote });
        }
        let family = IpFamily::of(&remote);
        let entry = RouteEntry::new(host_net(remote), host_net(local.addr()), family.unspecified())
            .with_scope(RouteScope::Link)
            .with_table(table);
        self.add_route(interface_index, entry)
    }

    /// Asks the kernel for its route to `destination` through an interface.
    ///
    /// Queries are answered one at a time, oldest first. When `table` is
    /// given the resulting host route is installed there, tagged with
    /// `tag`. The callback receives the installed (or reported) route, or
    /// the error that ended the query.
    pub fn request_route_to_host(
        &mut self,
        interface_index: i32,
        destination: IpAddr,
        tag: i32,
        table: Option<u32>,
        callback: RouteQueryCallback,
    ) {
        self.route_queries.push_back(RouteQuery {
            sequence: None,
            interface_index,
            destination,
            tag,
            table,
            callback,
        });
        if self.route_queries.len() == 1 {
            self.send_next_query();
        }
    }

    /// Flushes the kernel route caches of both families.
    pub fn flush_cache(&self) {
        for key in ROUTE_FLUSH_KEYS {
            if let Err(e) = self.sysctl.write(key, "-1") {
                tracing::warn!(key, error = %e, "failed to flush route cache");
            }
        }
    }

    /// Folds a kernel message into the shadow tables.
    pub fn on_kernel_message(&mut self, msg: &RtnlMessage) {
        match &msg.entity {
            RtnlEntity::Route {
                interface_index,
                entry,
            } => self.handle_route(msg.mode, msg.seq, *interface_index, entry),
            RtnlEntity::Error { errno } if *errno != 0 => self.handle_nack(msg.seq, *errno),
            _ => {}
        }
    }

    fn handle_route(&mut self, mode: Mode, seq: u32, interface_index: i32, entry: &RouteEntry) {
        if mode == Mode::Get || mode == Mode::Query {
            return;
        }
        if entry.protocol == RouteProtocol::Unspec {
            if mode == Mode::Add {
                self.handle_query_reply(seq, entry);
            }
            return;
        }
        match entry.protocol {
            RouteProtocol::Boot => {}
            RouteProtocol::Ra if entry.is_default() => {}
            _ => return,
        }
        // Routes without an output device are not tied to an interface.
        let Ok(table) = self.per_device_table(interface_index) else {
            return;
        };

        let managed = self.is_managed(interface_index);
        let routes = self.tables.entry(interface_index).or_default();
        let known = routes.iter().position(|existing| {
            existing.same_route(entry)
                && match mode {
                    Mode::Add => managed || existing.table == entry.table,
                    _ => existing.table == entry.table,
                }
        });
        if let Some(i) = known {
            if mode == Mode::Delete {
                tracing::debug!(interface = interface_index, %entry, "route removed externally");
                routes.remove(i);
            }
            return;
        }
        if mode != Mode::Add {
            return;
        }

        if managed && entry.table != table {
            let moved = entry.clone().with_table(table);
            tracing::debug!(interface = interface_index, %entry, table, "moving route to device table");
            if let Err(e) = self.move_route(interface_index, entry, &moved) {
                tracing::warn!(interface = interface_index, %entry, error = %e, "failed to move route");
                return;
            }
            self.tables.entry(interface_index).or_default().push(moved);
        } else {
            tracing::debug!(interface = interface_index, %entry, "tracking route");
            self.tables
                .entry(interface_index)
                .or_default()
                .push(entry.clone());
        }
    }

    fn handle_query_reply(&mut self, seq: u32, reply: &RouteEntry) {
        let Some(sequence) = self.route_queries.front().and_then(|query| query.sequence) else {
            return;
        };
        if sequence == seq {
            if let Some(query) = self.route_queries.pop_front() {
                self.complete_query(query, reply);
            }
        } else if is_sequence_older(sequence, seq) {
            if let Some(query) = self.route_queries.pop_front() {
                tracing::warn!(sequence, seq, "abandoning route query");
                (query.callback)(Err(Error::QueryAbandoned { sequence }));
            }
        } else {
            // Reply to a query that was already abandoned.
            tracing::debug!(seq, "ignoring stale route query reply");
            return;
        }
        self.send_next_query();
    }

    fn handle_nack(&mut self, seq: u32, errno: i32) {
        let head_sequence = self.route_queries.front().and_then(|query| query.sequence);
        if head_sequence != Some(seq) {
            return;
        }
        if let Some(query) = self.route_queries.pop_front() {
            tracing::warn!(
                seq,
                destination = %query.destination,
                error = %io::Error::from_raw_os_error(errno),
                "route query failed"
            );
            (query.callback)(Err(io::Error::from_raw_os_error(errno).into()));
        }
        self.send_next_query();
    }

    fn complete_query(&mut self, query: RouteQuery, reply: &RouteEntry) {
        let Some(table) = query.table else {
            (query.callback)(Ok(reply.clone()));
            return;
        };

        let family = reply.family;
        let mut entry = RouteEntry::new(reply.dst, family.default_net(), reply.gateway)
            .with_scope(reply.scope)
            .with_table(table)
            .with_tag(query.tag);
        if entry.dst.prefix_len() != family.max_prefix_len() {
            entry.dst = host_net(query.destination);
        }
        tracing::debug!(interface = query.interface_index, %entry, "installing queried host route");
        let result = self
            .add_route(query.interface_index, entry.clone())
            .map(|()| entry);
        (query.callback)(result);
    }

    /// Sends queued queries until one is in flight.
    fn send_next_query(&mut self) {
        while let Some(head) = self.route_queries.front() {
            if head.sequence.is_some() {
                return;
            }
            let (interface_index, destination) = (head.interface_index, head.destination);
            match self.send_query(interface_index, destination) {
                Ok(seq) => {
                    if let Some(head) = self.route_queries.front_mut() {
                        head.sequence = Some(seq);
                    }
                    return;
                }
                Err(e) => {
                    if let Some(query) = self.route_queries.pop_front() {
                        (query.callback)(Err(e));
                    }
                }
            }
        }
    }

    fn send_query(&self, interface_index: i32, destination: IpAddr) -> Result<u32> {
        let family = IpFamily::of(&destination);
        let entry = RouteEntry::new(host_net(destination), family.default_net(), family.unspecified())
            .with_table(RT_TABLE_UNSPEC)
            .with_protocol(RouteProtocol::Unspec);
        let seq = self
            .rtnl
            .send_message(RtnlMessage::new(Mode::Query, RtnlEntity::route(interface_index, entry)))?;
        tracing::debug!(interface = interface_index, %destination, seq, "route query sent");
        Ok(seq)
    }

    /// Re-adds `from` as `to`, then deletes `from`.
    fn move_route(&self, interface_index: i32, from: &RouteEntry, to: &RouteEntry) -> Result<()> {
        self.send_route(Mode::Add, NLM_F_CREATE | NLM_F_REPLACE, interface_index, to)?;
        if let Err(e) = self.send_route(Mode::Delete, 0, interface_index, from) {
            tracing::warn!(interface = interface_index, entry = %from, error = %e, "failed to delete moved route");
        }
        Ok(())
    }

    fn send_route(
        &self,
        mode: Mode,
        flags: u16,
        interface_index: i32,
        entry: &RouteEntry,
    ) -> Result<u32> {
        tracing::debug!(interface = interface_index, %mode, %entry, "route request");
        let msg = RtnlMessage::new(mode, RtnlEntity::route(interface_index, entry.clone()))
            .with_flags(flags);
        self.rtnl.send_message(msg)
    }
}
