//! The routing event loop.
//!
//! ## Architecture
//!
//! The routing core uses an actor model:
//! - A single `RoutingService` owns the routing socket and both managers
//!   (no locks needed)
//! - Callers hold a cloneable [`RoutingHandle`] and send commands over a
//!   channel
//! - The actor handles commands and kernel messages one at a time, on one
//!   task
//!
//! Every kernel message is passed to both managers; each picks out what it
//! cares about.
//!
//! ## Example
//!
//! ```no_run
//! # use policyroute::{IpFamily, RoutingConfig, RoutingService};
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let routing = RoutingService::start(RoutingConfig::default()).await?;
//! routing.register_device(3, "eth0").await?;
//! let table = routing.per_device_table(3).await?;
//! routing.set_default_route(3, "192.168.1.1".parse()?, table).await?;
//! println!("{:?}", routing.get_default_route(3, IpFamily::V4).await?);
//! # Ok(())
//! # }
//! ```

use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::config::RoutingConfig;
use crate::network_applier::{NetworkApplier, RouteConfig, RoutingPolicyParams};
use crate::routing_policy::{RoutingPolicyService, SystemUserDatabase};
use crate::routing_table::RoutingTable;
use crate::socket::{decode_datagram, Groups, RtnlHandler, RtnlSocket, RECEIVE_BUFFER_SIZE};
use crate::sysctl::SysctlFs;
use crate::types::{IpFamily, RouteEntry, RoutingPolicyEntry};
use crate::wire::{RtnlEntity, RtnlMessage};
use crate::{Error, Result};

/// Capacity of the command channel.
const COMMAND_QUEUE_SIZE: usize = 1024;

/// Commands sent to the routing service.
enum Command {
    RegisterDevice {
        interface_index: i32,
        ifname: String,
        response_tx: oneshot::Sender<Result<()>>,
    },
    DeregisterDevice {
        interface_index: i32,
        ifname: String,
        response_tx: oneshot::Sender<()>,
    },
    AddRoute {
        interface_index: i32,
        entry: RouteEntry,
        response_tx: oneshot::Sender<Result<()>>,
    },
    RemoveRoute {
        interface_index: i32,
        entry: RouteEntry,
        response_tx: oneshot::Sender<Result<()>>,
    },
    GetDefaultRoute {
        interface_index: i32,
        family: IpFamily,
        response_tx: oneshot::Sender<Option<RouteEntry>>,
    },
    SetDefaultRoute {
        interface_index: i32,
        gateway: IpAddr,
        table: u32,
        response_tx: oneshot::Sender<Result<()>>,
    },
    FlushRoutes {
        interface_index: i32,
    },
    FlushRoutesWithTag {
        tag: i32,
    },
    RequestRouteToHost {
        interface_index: i32,
        destination: IpAddr,
        tag: i32,
        table: Option<u32>,
        response_tx: oneshot::Sender<Result<RouteEntry>>,
    },
    AddRule {
        interface_index: i32,
        entry: RoutingPolicyEntry,
        response_tx: oneshot::Sender<Result<()>>,
    },
    FlushRules {
        interface_index: i32,
    },
    RequestRuleDump {
        family: IpFamily,
        response_tx: oneshot::Sender<Result<u32>>,
    },
    ApplyRoutingPolicy {
        params: RoutingPolicyParams,
        response_tx: oneshot::Sender<Result<()>>,
    },
    ApplyRoutes {
        interface_index: i32,
        config: RouteConfig,
        response_tx: oneshot::Sender<Result<()>>,
    },
    Clear {
        interface_index: i32,
        ifname: String,
        response_tx: oneshot::Sender<()>,
    },
    GetRoutes {
        interface_index: i32,
        response_tx: oneshot::Sender<Vec<RouteEntry>>,
    },
    GetRules {
        interface_index: i32,
        response_tx: oneshot::Sender<Vec<RoutingPolicyEntry>>,
    },
    PerDeviceTable {
        interface_index: i32,
        response_tx: oneshot::Sender<Result<u32>>,
    },
    /// A kernel message obtained outside the socket.
    Deliver {
        msg: RtnlMessage,
    },
}

/// Owns the routing socket and both managers.
pub struct RoutingService {
    table: RoutingTable,
    policy: RoutingPolicyService,
    socket: Option<Arc<RtnlSocket>>,
}

impl RoutingService {
    /// Creates a service around existing managers. Without a socket, kernel
    /// messages only arrive through [`RoutingHandle::deliver`].
    pub fn new(table: RoutingTable, policy: RoutingPolicyService) -> Self {
        Self {
            table,
            policy,
            socket: None,
        }
    }

    /// Reads kernel messages from `socket`.
    pub fn with_socket(mut self, socket: Arc<RtnlSocket>) -> Self {
        self.socket = Some(socket);
        self
    }

    /// Opens the routing socket, removes rules left by a previous run and
    /// spawns the service.
    ///
    /// Waits at most `config.startup_timeout` per address family while the
    /// stale rules are collected. Must be called from within a tokio
    /// runtime.
    pub async fn start(config: RoutingConfig) -> Result<RoutingHandle> {
        let mut socket = RtnlSocket::new();
        socket.start(Groups::routing())?;
        let socket = Arc::new(socket);
        let rtnl = Arc::new(RtnlHandler::new(socket.clone()));
        let table = RoutingTable::new(
            rtnl.clone(),
            Arc::new(SysctlFs::new(&config.sysctl_root)),
            config.clone(),
        );
        let policy = RoutingPolicyService::new(rtnl, Arc::new(SystemUserDatabase), &config);

        let mut service = Self::new(table, policy).with_socket(socket.clone());
        for family in IpFamily::ALL {
            let seq = service.policy.request_rule_dump(family)?;
            let result = socket
                .wait_for(config.startup_timeout, |msg| {
                    service.dispatch(&msg);
                    msg.seq == seq && matches!(msg.entity, RtnlEntity::Done | RtnlEntity::Error { .. })
                })
                .await;
            if let Err(e) = result {
                tracing::warn!(%family, error = %e, "rule dump did not complete");
            }
        }

        tracing::info!("routing service started");
        Ok(service.spawn())
    }

    /// Spawns the service on the current runtime.
    pub fn spawn(self) -> RoutingHandle {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        tokio::spawn(self.run(rx));
        RoutingHandle { tx }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let socket = self.socket.clone();
        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                received = receive(socket.as_deref(), &mut buf) => {
                    if !self.handle_receive(received, &buf) {
                        break;
                    }
                }
            }
        }
        tracing::debug!("routing service shutting down");
    }

    /// Dispatches one received datagram. Returns false when the socket is
    /// unusable.
    fn handle_receive(&mut self, received: Result<usize>, buf: &[u8]) -> bool {
        match received {
            Ok(n) => {
                for msg in decode_datagram(&buf[..n]) {
                    self.dispatch(&msg);
                }
                true
            }
            Err(e) if e.is_overrun() => {
                // Notifications were lost; queued ones are still readable.
                tracing::warn!("routing socket overrun, shadow state may lag the kernel");
                true
            }
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::Interrupted => true,
            Err(e) => {
                tracing::error!(error = %e, "routing socket receive failed");
                false
            }
        }
    }

    fn dispatch(&mut self, msg: &RtnlMessage) {
        match &msg.entity {
            RtnlEntity::Error { errno } if *errno != 0 => {
                tracing::warn!(
                    seq = msg.seq,
                    error = %io::Error::from_raw_os_error(*errno),
                    "kernel rejected request"
                );
            }
            RtnlEntity::Error { .. } | RtnlEntity::Done => {}
            _ => tracing::debug!(%msg, "kernel message"),
        }
        self.table.on_kernel_message(msg);
        self.policy.on_kernel_message(msg);
    }

    fn applier(&mut self) -> NetworkApplier<'_> {
        NetworkApplier::new(&mut self.table, &mut self.policy)
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::RegisterDevice {
                interface_index,
                ifname,
                response_tx,
            } => {
                let _ = response_tx.send(self.table.register_device(interface_index, &ifname));
            }
            Command::DeregisterDevice {
                interface_index,
                ifname,
                response_tx,
            } => {
                self.table.deregister_device(interface_index, &ifname);
                let _ = response_tx.send(());
            }
            Command::AddRoute {
                interface_index,
                entry,
                response_tx,
            } => {
                let _ = response_tx.send(self.table.add_route(interface_index, entry));
            }
            Command::RemoveRoute {
                interface_index,
                entry,
                response_tx,
            } => {
                let _ = response_tx.send(self.table.remove_route(interface_index, &entry));
            }
            Command::GetDefaultRoute {
                interface_index,
                family,
                response_tx,
            } => {
                let _ = response_tx.send(self.table.get_default_route(interface_index, family));
            }
            Command::SetDefaultRoute {
                interface_index,
                gateway,
                table,
                response_tx,
            } => {
                let result = self.table.set_default_route(interface_index, gateway, table);
                let _ = response_tx.send(result);
            }
            Command::FlushRoutes { interface_index } => self.table.flush_routes(interface_index),
            Command::FlushRoutesWithTag { tag } => self.table.flush_routes_with_tag(tag),
            Command::RequestRouteToHost {
                interface_index,
                destination,
                tag,
                table,
                response_tx,
            } => {
                let callback = Box::new(move |result: Result<RouteEntry>| {
                    let _ = response_tx.send(result);
                });
                self.table
                    .request_route_to_host(interface_index, destination, tag, table, callback);
            }
            Command::AddRule {
                interface_index,
                entry,
                response_tx,
            } => {
                let _ = response_tx.send(self.policy.add_rule(interface_index, entry));
            }
            Command::FlushRules { interface_index } => self.policy.flush_rules(interface_index),
            Command::RequestRuleDump {
                family,
                response_tx,
            } => {
                let _ = response_tx.send(self.policy.request_rule_dump(family));
            }
            Command::ApplyRoutingPolicy {
                params,
                response_tx,
            } => {
                let result = self.applier().apply_routing_policy(&params);
                let _ = response_tx.send(result);
            }
            Command::ApplyRoutes {
                interface_index,
                config,
                response_tx,
            } => {
                let result = self.applier().apply_routes(interface_index, &config);
                let _ = response_tx.send(result);
            }
            Command::Clear {
                interface_index,
                ifname,
                response_tx,
            } => {
                self.applier().clear(interface_index, &ifname);
                let _ = response_tx.send(());
            }
            Command::GetRoutes {
                interface_index,
                response_tx,
            } => {
                let _ = response_tx.send(self.table.routes(interface_index).to_vec());
            }
            Command::GetRules {
                interface_index,
                response_tx,
            } => {
                let _ = response_tx.send(self.policy.rules(interface_index).to_vec());
            }
            Command::PerDeviceTable {
                interface_index,
                response_tx,
            } => {
                let _ = response_tx.send(self.table.per_device_table(interface_index));
            }
            Command::Deliver { msg } => self.dispatch(&msg),
        }
    }
}

async fn receive(socket: Option<&RtnlSocket>, buf: &mut [u8]) -> Result<usize> {
    match socket {
        Some(socket) => socket.receive(buf).await,
        None => std::future::pending().await,
    }
}

/// Handle for sending commands to the routing service.
#[derive(Clone)]
pub struct RoutingHandle {
    tx: mpsc::Sender<Command>,
}

impl RoutingHandle {
    async fn send(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| Error::Closed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(make(response_tx)).await?;
        response_rx.await.map_err(|_| Error::Closed)
    }

    /// Puts an interface under per-device table management.
    pub async fn register_device(&self, interface_index: i32, ifname: &str) -> Result<()> {
        let ifname = ifname.to_string();
        self.request(|response_tx| Command::RegisterDevice {
            interface_index,
            ifname,
            response_tx,
        })
        .await?
    }

    pub async fn deregister_device(&self, interface_index: i32, ifname: &str) -> Result<()> {
        let ifname = ifname.to_string();
        self.request(|response_tx| Command::DeregisterDevice {
            interface_index,
            ifname,
            response_tx,
        })
        .await
    }

    pub async fn add_route(&self, interface_index: i32, entry: RouteEntry) -> Result<()> {
        self.request(|response_tx| Command::AddRoute {
            interface_index,
            entry,
            response_tx,
        })
        .await?
    }

    pub async fn remove_route(&self, interface_index: i32, entry: RouteEntry) -> Result<()> {
        self.request(|response_tx| Command::RemoveRoute {
            interface_index,
            entry,
            response_tx,
        })
        .await?
    }

    pub async fn get_default_route(
        &self,
        interface_index: i32,
        family: IpFamily,
    ) -> Result<Option<RouteEntry>> {
        self.request(|response_tx| Command::GetDefaultRoute {
            interface_index,
            family,
            response_tx,
        })
        .await
    }

    pub async fn set_default_route(
        &self,
        interface_index: i32,
        gateway: IpAddr,
        table: u32,
    ) -> Result<()> {
        self.request(|response_tx| Command::SetDefaultRoute {
            interface_index,
            gateway,
            table,
            response_tx,
        })
        .await?
    }

    pub async fn flush_routes(&self, interface_index: i32) -> Result<()> {
        self.send(Command::FlushRoutes { interface_index }).await
    }

    pub async fn flush_routes_with_tag(&self, tag: i32) -> Result<()> {
        self.send(Command::FlushRoutesWithTag { tag }).await
    }

    /// Asks the kernel for its route to `destination` and, when `table` is
    /// given, installs it there as a host route.
    ///
    /// There is no timeout; the query resolves once its reply or a later
    /// one arrives.
    pub async fn request_route_to_host(
        &self,
        interface_index: i32,
        destination: IpAddr,
        tag: i32,
        table: Option<u32>,
    ) -> Result<RouteEntry> {
        self.request(|response_tx| Command::RequestRouteToHost {
            interface_index,
            destination,
            tag,
            table,
            response_tx,
        })
        .await?
    }

    pub async fn add_rule(&self, interface_index: i32, entry: RoutingPolicyEntry) -> Result<()> {
        self.request(|response_tx| Command::AddRule {
            interface_index,
            entry,
            response_tx,
        })
        .await?
    }

    pub async fn flush_rules(&self, interface_index: i32) -> Result<()> {
        self.send(Command::FlushRules { interface_index }).await
    }

    /// Dumps the kernel's rules of `family`. Rules in the reply that this
    /// service no longer tracks are deleted. Returns the dump's sequence
    /// number.
    pub async fn request_rule_dump(&self, family: IpFamily) -> Result<u32> {
        self.request(|response_tx| Command::RequestRuleDump {
            family,
            response_tx,
        })
        .await?
    }

    pub async fn apply_routing_policy(&self, params: RoutingPolicyParams) -> Result<()> {
        self.request(|response_tx| Command::ApplyRoutingPolicy {
            params,
            response_tx,
        })
        .await?
    }

    pub async fn apply_routes(&self, interface_index: i32, config: RouteConfig) -> Result<()> {
        self.request(|response_tx| Command::ApplyRoutes {
            interface_index,
            config,
            response_tx,
        })
        .await?
    }

    /// Removes the rules and routes of an interface and deregisters it.
    pub async fn clear(&self, interface_index: i32, ifname: &str) -> Result<()> {
        let ifname = ifname.to_string();
        self.request(|response_tx| Command::Clear {
            interface_index,
            ifname,
            response_tx,
        })
        .await
    }

    /// Shadow routes of an interface.
    pub async fn routes(&self, interface_index: i32) -> Result<Vec<RouteEntry>> {
        self.request(|response_tx| Command::GetRoutes {
            interface_index,
            response_tx,
        })
        .await
    }

    /// Tracked rules of an interface.
    pub async fn rules(&self, interface_index: i32) -> Result<Vec<RoutingPolicyEntry>> {
        self.request(|response_tx| Command::GetRules {
            interface_index,
            response_tx,
        })
        .await
    }

    pub async fn per_device_table(&self, interface_index: i32) -> Result<u32> {
        self.request(|response_tx| Command::PerDeviceTable {
            interface_index,
            response_tx,
        })
        .await?
    }

    /// Feeds a kernel message through the same path as socket traffic.
    pub async fn deliver(&self, msg: RtnlMessage) -> Result<()> {
        self.send(Command::Deliver { msg }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing_policy::UserDatabase;
    use crate::testing::{MemorySysctl, RecordingTransport};
    use crate::types::RouteEntry;
    use crate::wire::Mode;

    struct NoUsers;

    impl UserDatabase for NoUsers {
        fn uid_of(&self, _username: &str) -> io::Result<u32> {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn service() -> (Arc<RecordingTransport>, RoutingService) {
        let transport = Arc::new(RecordingTransport::default());
        let rtnl = Arc::new(RtnlHandler::with_initial_sequence(transport.clone(), 1));
        let config = RoutingConfig::default();
        let table = RoutingTable::new(rtnl.clone(), Arc::new(MemorySysctl::default()), config.clone());
        let policy = RoutingPolicyService::new(rtnl, Arc::new(NoUsers), &config);
        (transport, RoutingService::new(table, policy))
    }

    fn default_route(interface_index: i32) -> RtnlMessage {
        RtnlMessage::new(
            Mode::Add,
            RtnlEntity::route(
                interface_index,
                RouteEntry::new(
                    IpFamily::V4.default_net(),
                    IpFamily::V4.default_net(),
                    "192.168.1.1".parse().unwrap(),
                )
                .with_table(1002),
            ),
        )
    }

    #[test]
    fn test_overrun_keeps_reading() {
        let (_, mut service) = service();
        service.table.register_device(2, "eth0").unwrap();

        let overrun: Result<usize> = Err(io::Error::from_raw_os_error(libc::ENOBUFS).into());
        assert!(service.handle_receive(overrun, &[]));
        let interrupted: Result<usize> = Err(io::Error::from(io::ErrorKind::Interrupted).into());
        assert!(service.handle_receive(interrupted, &[]));

        // The next datagram is still dispatched.
        let buf = default_route(2).encode().unwrap();
        assert!(service.handle_receive(Ok(buf.len()), &buf));
        assert_eq!(service.table.routes(2).len(), 1);
    }

    #[test]
    fn test_broken_socket_stops_reading() {
        let (_, mut service) = service();
        let broken: Result<usize> = Err(io::Error::from_raw_os_error(libc::EBADF).into());
        assert!(!service.handle_receive(broken, &[]));
    }

    #[tokio::test]
    async fn test_rule_dump_through_handle() {
        let (transport, service) = service();
        let handle = service.spawn();
        let seq = handle.request_rule_dump(IpFamily::V6).await.unwrap();

        let sent = transport.with_mode(Mode::Get);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].seq, seq);
        assert!(matches!(sent[0].entity, RtnlEntity::Rule { .. }));
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_index() {
        let (_, service) = service();
        let handle = service.spawn();
        assert!(matches!(
            handle.register_device(0, "lo").await,
            Err(Error::InvalidInterface { index: 0 })
        ));
        assert!(matches!(
            handle.per_device_table(-3).await,
            Err(Error::InvalidInterface { index: -3 })
        ));
        assert_eq!(handle.per_device_table(7).await.unwrap(), 1007);
    }
}
