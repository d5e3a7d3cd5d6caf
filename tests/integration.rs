//! Integration tests for the routing service over a recording transport.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use policyroute::wire::split_messages;
use policyroute::{
    Error, IpFamily, Mode, RouteConfig, RouteEntry, RouteProtocol, RoutingConfig,
    RoutingHandle, RoutingPolicyEntry, RoutingPolicyParams, RoutingPolicyService,
    RoutingService, RoutingTable, RtnlEntity, RtnlHandler, RtnlMessage, Sysctl, Technology,
    Transport, UserDatabase,
};
use tokio::time::timeout;

/// Transport that records every message sent.
#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<RtnlMessage>>,
}

impl Recorder {
    fn messages(&self) -> Vec<RtnlMessage> {
        self.sent.lock().clone()
    }

    fn clear(&self) {
        self.sent.lock().clear();
    }

    fn count(&self, mode: Mode) -> usize {
        self.sent.lock().iter().filter(|msg| msg.mode == mode).count()
    }
}

impl Transport for Recorder {
    fn send(&self, buf: &[u8]) -> policyroute::Result<()> {
        // Everything sent must be a single well-formed message.
        assert_eq!(split_messages(buf).count(), 1);
        self.sent.lock().push(RtnlMessage::decode(buf)?);
        Ok(())
    }
}

#[derive(Default)]
struct Tunables {
    values: Mutex<HashMap<String, String>>,
}

impl Sysctl for Tunables {
    fn write(&self, key: &str, value: &str) -> io::Result<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

struct Users;

impl UserDatabase for Users {
    fn uid_of(&self, username: &str) -> io::Result<u32> {
        match username {
            "chronos" => Ok(1000),
            "debugd" => Ok(20104),
            _ => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }
}

struct Harness {
    transport: Arc<Recorder>,
    tunables: Arc<Tunables>,
    handle: RoutingHandle,
}

fn harness() -> Harness {
    let transport = Arc::new(Recorder::default());
    let tunables = Arc::new(Tunables::default());
    let rtnl = Arc::new(RtnlHandler::with_initial_sequence(transport.clone(), 500));
    let config = RoutingConfig::default();
    let table = RoutingTable::new(rtnl.clone(), tunables.clone(), config.clone());
    let policy = RoutingPolicyService::new(rtnl, Arc::new(Users), &config);
    let handle = RoutingService::new(table, policy).spawn();
    Harness {
        transport,
        tunables,
        handle,
    }
}

fn addr(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_primary_ethernet_bring_up() {
    let h = harness();
    h.handle.register_device(2, "eth0").await.unwrap();
    let table = h.handle.per_device_table(2).await.unwrap();
    assert_eq!(table, 1002);

    let mut params = RoutingPolicyParams::new(2, "eth0", Technology::Ethernet);
    params.is_primary_physical = true;
    params.addresses = vec![
        "198.51.100.101/24".parse().unwrap(),
        "2001:db8:0:1000::abcd/64".parse().unwrap(),
    ];
    h.handle.apply_routing_policy(params).await.unwrap();

    h.handle
        .apply_routes(
            2,
            RouteConfig {
                local: Some("198.51.100.101/24".parse().unwrap()),
                gateway: Some(addr("198.51.100.1")),
                default_route: true,
                ..RouteConfig::default()
            },
        )
        .await
        .unwrap();

    let rules = h.handle.rules(2).await.unwrap();
    assert_eq!(rules.len(), 10);
    let routes = h.handle.routes(2).await.unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].table, 1002);
    assert_eq!(routes[0].metric, 65536);

    let tunables = h.tunables.values.lock().clone();
    assert_eq!(tunables["ipv6/conf/eth0/accept_ra_rt_table"], "-1000");
    assert_eq!(tunables["ipv4/route/flush"], "-1");
    assert_eq!(tunables["ipv6/route/flush"], "-1");
}

#[tokio::test]
async fn test_kernel_echo_is_not_duplicated() {
    let h = harness();
    h.handle.register_device(2, "eth0").await.unwrap();
    h.handle
        .set_default_route(2, addr("192.168.1.1"), 1002)
        .await
        .unwrap();

    // The kernel echoes our own add back to us.
    let echo = h
        .transport
        .messages()
        .into_iter()
        .find(|msg| msg.mode == Mode::Add)
        .unwrap();
    h.handle.deliver(echo.clone()).await.unwrap();
    assert_eq!(h.handle.routes(2).await.unwrap().len(), 1);

    // Set again: nothing new is sent.
    h.transport.clear();
    h.handle
        .set_default_route(2, addr("192.168.1.1"), 1002)
        .await
        .unwrap();
    assert!(h.transport.messages().is_empty());

    // Someone else deletes it.
    h.handle
        .deliver(RtnlMessage {
            mode: Mode::Delete,
            ..echo
        })
        .await
        .unwrap();
    assert!(h.handle.routes(2).await.unwrap().is_empty());
    assert!(h
        .handle
        .get_default_route(2, IpFamily::V4)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_router_advertisement_route_moves_to_device_table() {
    let h = harness();
    h.handle.register_device(4, "wlan0").await.unwrap();

    let ra = RouteEntry::new(
        IpFamily::V6.default_net(),
        IpFamily::V6.default_net(),
        addr("fe80::1"),
    )
    .with_table(254)
    .with_metric(1024)
    .with_protocol(RouteProtocol::Ra);
    h.handle
        .deliver(RtnlMessage::new(Mode::Add, RtnlEntity::route(4, ra)))
        .await
        .unwrap();

    let sent = h.transport.messages();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].mode, Mode::Add);
    assert_eq!(sent[1].mode, Mode::Delete);

    let best = h
        .handle
        .get_default_route(4, IpFamily::V6)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(best.table, 1004);
    assert_eq!(best.metric, 1024);
}

#[tokio::test]
async fn test_route_query_round_trip() {
    let h = harness();
    let handle = h.handle.clone();
    let query = tokio::spawn(async move {
        handle
            .request_route_to_host(3, addr("203.0.113.9"), 3, Some(1003))
            .await
    });

    let seq = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(msg) = h.transport.messages().first() {
                return msg.seq;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let reply = RouteEntry::new(
        "203.0.113.9/32".parse().unwrap(),
        IpFamily::V4.default_net(),
        addr("192.168.3.1"),
    )
    .with_protocol(RouteProtocol::Unspec);
    h.handle
        .deliver(RtnlMessage::new(Mode::Add, RtnlEntity::route(3, reply)).with_seq(seq))
        .await
        .unwrap();

    let installed = timeout(Duration::from_secs(5), query)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(installed.table, 1003);
    assert_eq!(installed.gateway, addr("192.168.3.1"));
    assert_eq!(h.handle.routes(3).await.unwrap(), vec![installed]);
    assert_eq!(h.transport.count(Mode::Add), 1);
}

fn deleted_rules(h: &Harness) -> Vec<RtnlMessage> {
    h.transport
        .messages()
        .into_iter()
        .filter(|msg| msg.mode == Mode::Delete)
        .collect()
}

#[tokio::test]
async fn test_stale_rules_from_previous_run_are_removed() {
    let h = harness();
    let ours = RoutingPolicyEntry::new(IpFamily::V4)
        .with_priority(1010)
        .with_table(1002)
        .with_oif("eth0");
    h.handle.add_rule(2, ours.clone()).await.unwrap();
    h.handle.add_rule(2, ours.clone()).await.unwrap();
    assert_eq!(h.transport.count(Mode::Add), 1);

    let seq = h.handle.request_rule_dump(IpFamily::V4).await.unwrap();
    let leftover = RoutingPolicyEntry::new(IpFamily::V4)
        .with_priority(1010)
        .with_table(1007)
        .with_oif("eth7");
    for entry in [
        ours,
        leftover.clone(),
        RoutingPolicyEntry::new(IpFamily::V4).with_priority(32766),
        RoutingPolicyEntry::new(IpFamily::V4).with_priority(32767).with_table(253),
    ] {
        h.handle
            .deliver(RtnlMessage::new(Mode::Add, RtnlEntity::rule(entry)).with_seq(seq))
            .await
            .unwrap();
    }
    h.handle
        .deliver(RtnlMessage::new(Mode::Add, RtnlEntity::Done).with_seq(seq))
        .await
        .unwrap();
    // Synchronize with the service.
    h.handle.rules(2).await.unwrap();

    let deleted = deleted_rules(&h);
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].entity, RtnlEntity::rule(leftover));
}

#[tokio::test]
async fn test_rules_of_other_programs_survive() {
    let h = harness();
    let foreign = RoutingPolicyEntry::new(IpFamily::V4)
        .with_priority(5000)
        .with_table(100);
    let mut notification = RtnlMessage::new(Mode::Add, RtnlEntity::rule(foreign.clone()));
    notification.pid = 4242;

    // Outside any dump.
    h.handle.deliver(notification.clone()).await.unwrap();

    // While a dump is running, but not part of its reply.
    let seq = h.handle.request_rule_dump(IpFamily::V4).await.unwrap();
    h.handle.deliver(notification.clone()).await.unwrap();
    h.handle
        .deliver(RtnlMessage::new(Mode::Add, RtnlEntity::Done).with_seq(seq))
        .await
        .unwrap();

    // After the dump finished, a late reply with its sequence is ignored.
    h.handle.deliver(notification.with_seq(seq)).await.unwrap();
    h.handle.rules(2).await.unwrap();

    assert!(deleted_rules(&h).is_empty());
}

#[tokio::test]
async fn test_semantic_rejections_send_nothing() {
    let h = harness();
    let foreign = RouteEntry::default_route(IpFamily::V4).with_table(254);
    assert!(matches!(
        h.handle.add_route(2, foreign).await,
        Err(Error::InvalidTable { .. })
    ));
    // An off-subnet gateway is left alone unless asked to fix it.
    h.handle
        .apply_routes(
            2,
            RouteConfig {
                local: Some("192.168.1.1/24".parse().unwrap()),
                gateway: Some(addr("10.0.0.5")),
                ..RouteConfig::default()
            },
        )
        .await
        .unwrap();
    assert!(h.transport.messages().is_empty());

    // A kernel error for an unknown sequence is only logged.
    h.handle
        .deliver(RtnlMessage::new(Mode::Add, RtnlEntity::Error { errno: 17 }).with_seq(1))
        .await
        .unwrap();
    h.handle.clear(2, "eth0").await.unwrap();
}

#[tokio::test]
async fn test_service_runs_while_a_handle_exists() {
    let h = harness();
    let handle = h.handle.clone();
    drop(h);
    assert!(handle.routes(1).await.unwrap().is_empty());
    handle.flush_routes_with_tag(1).await.unwrap();
    handle.deregister_device(1, "eth1").await.unwrap();
}

#[test]
fn test_truncated_kernel_input_is_rejected() {
    let msg = RtnlMessage::new(
        Mode::Add,
        RtnlEntity::route(2, RouteEntry::default_route(IpFamily::V6).with_table(1002)),
    );
    let buf = msg.encode().unwrap();

    // Declared length past the end of the buffer.
    let mut overrun = buf.clone();
    let len = (buf.len() as u32 + 64).to_ne_bytes();
    overrun[..4].copy_from_slice(&len);
    assert!(RtnlMessage::decode(&overrun).is_err());
    assert_eq!(split_messages(&overrun).count(), 0);

    // Cut inside the attributes.
    assert!(RtnlMessage::decode(&buf[..buf.len() - 2]).is_err());
    assert!(RtnlMessage::decode(&buf[..8]).is_err());
}
