//! Routing policy database (RPDB) rules.
//!
//! Rules are tracked per interface index; index `-1` holds rules that are
//! never flushed. A rule dump at start-up removes rules left behind by an
//! earlier run that did not shut down cleanly. Rules seen outside a dump
//! this service requested belong to someone else and are left alone.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;

use nix::unistd::User;

use crate::config::RoutingConfig;
use crate::socket::RtnlHandler;
use crate::types::{IpFamily, RoutingPolicyEntry};
use crate::wire::{Mode, RtnlEntity, RtnlMessage, FR_ACT_TO_TBL, NLM_F_CREATE, NLM_F_EXCL};
use crate::Result;

/// Priority of the kernel's local table rule.
pub const RULE_PRIORITY_LOCAL: u32 = 0;

/// Priority of the kernel's main table rule.
pub const RULE_PRIORITY_MAIN: u32 = 32766;

/// Interface index for rules that outlive every interface.
pub const STATIC_RULES_INDEX: i32 = -1;

/// Resolves usernames to UIDs.
pub trait UserDatabase: Send + Sync {
    fn uid_of(&self, username: &str) -> io::Result<u32>;
}

/// The system user database.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemUserDatabase;

impl UserDatabase for SystemUserDatabase {
    fn uid_of(&self, username: &str) -> io::Result<u32> {
        match User::from_name(username)? {
            Some(user) => Ok(user.uid.as_raw()),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no user named {}", username),
            )),
        }
    }
}

/// Shadow RPDB of all interfaces.
pub struct RoutingPolicyService {
    rtnl: Arc<RtnlHandler>,
    users: Arc<dyn UserDatabase>,
    usernames: Vec<String>,
    tables: HashMap<i32, Vec<RoutingPolicyEntry>>,
    user_traffic_uids: Option<Vec<u32>>,
    /// Sequence numbers of rule dumps still in progress.
    pending_dumps: HashSet<u32>,
}

impl RoutingPolicyService {
    pub fn new(rtnl: Arc<RtnlHandler>, users: Arc<dyn UserDatabase>, config: &RoutingConfig) -> Self {
        Self {
            rtnl,
            users,
            usernames: config.user_traffic_usernames.clone(),
            tables: HashMap::new(),
            user_traffic_uids: None,
            pending_dumps: HashSet::new(),
        }
    }

    /// Tracked rules of an interface.
    pub fn rules(&self, interface_index: i32) -> &[RoutingPolicyEntry] {
        self.tables
            .get(&interface_index)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Installs a rule for an interface. A rule already tracked for the
    /// interface is not sent again.
    pub fn add_rule(&mut self, interface_index: i32, entry: RoutingPolicyEntry) -> Result<()> {
        if self.rules(interface_index).contains(&entry) {
            tracing::trace!(interface = interface_index, %entry, "rule already installed");
            return Ok(());
        }

        tracing::debug!(interface = interface_index, %entry, "adding rule");
        let msg = RtnlMessage::new(Mode::Add, RtnlEntity::rule(entry.clone()))
            .with_flags(NLM_F_CREATE | NLM_F_EXCL);
        self.rtnl.send_message(msg)?;
        self.tables.entry(interface_index).or_default().push(entry);
        Ok(())
    }

    /// Deletes every tracked rule of an interface.
    pub fn flush_rules(&mut self, interface_index: i32) {
        let rules = self.tables.remove(&interface_index).unwrap_or_default();
        for entry in rules {
            tracing::debug!(interface = interface_index, %entry, "removing rule");
            if let Err(e) = self.send_delete(entry.clone()) {
                tracing::warn!(interface = interface_index, %entry, error = %e, "failed to remove rule");
            }
        }
    }

    /// Requests a dump of all rules of `family`. Untracked rules in the
    /// reply are deleted.
    pub fn request_rule_dump(&mut self, family: IpFamily) -> Result<u32> {
        let msg = RtnlMessage::new(Mode::Get, RtnlEntity::rule(RoutingPolicyEntry::new(family)));
        let seq = self.rtnl.send_message(msg)?;
        self.pending_dumps.insert(seq);
        tracing::debug!(%family, seq, "requested rule dump");
        Ok(seq)
    }

    /// Returns true while a rule dump is outstanding.
    pub fn is_dumping(&self) -> bool {
        !self.pending_dumps.is_empty()
    }

    /// UIDs of the users whose traffic follows VPNs.
    ///
    /// Resolved on first use; users that cannot be resolved are skipped.
    pub fn get_user_traffic_uids(&mut self) -> &[u32] {
        let users = &self.users;
        let usernames = &self.usernames;
        self.user_traffic_uids.get_or_insert_with(|| {
            usernames
                .iter()
                .filter_map(|name| match users.uid_of(name) {
                    Ok(uid) => Some(uid),
                    Err(e) => {
                        tracing::warn!(user = %name, error = %e, "cannot resolve user");
                        None
                    }
                })
                .collect()
        })
    }

    /// Removes stale rules reported by a dump this service requested.
    ///
    /// The kernel's own local and main rules, anything outside their
    /// priority range and every rule notification outside a dump are left
    /// alone.
    pub fn on_kernel_message(&mut self, msg: &RtnlMessage) {
        let (action, entry) = match &msg.entity {
            RtnlEntity::Rule { action, entry } => (*action, entry),
            RtnlEntity::Done | RtnlEntity::Error { .. } => {
                if self.pending_dumps.remove(&msg.seq) {
                    tracing::debug!(seq = msg.seq, "rule dump complete");
                }
                return;
            }
            _ => return,
        };
        if !self.pending_dumps.contains(&msg.seq) {
            return;
        }
        if msg.mode != Mode::Add || action != FR_ACT_TO_TBL {
            return;
        }
        if entry.priority <= RULE_PRIORITY_LOCAL || entry.priority >= RULE_PRIORITY_MAIN {
            return;
        }
        if self.tables.values().flatten().any(|tracked| tracked == entry) {
            return;
        }

        tracing::info!(%entry, "removing stale rule");
        if let Err(e) = self.send_delete(entry.clone()) {
            tracing::warn!(%entry, error = %e, "failed to remove stale rule");
        }
    }

    fn send_delete(&self, entry: RoutingPolicyEntry) -> Result<u32> {
        self.rtnl
            .send_message(RtnlMessage::new(Mode::Delete, RtnlEntity::rule(entry)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::testing::RecordingTransport;
    use crate::types::{FwMark, RT_TABLE_MAIN};
    use crate::wire::NLM_F_MULTI;

    struct FakeUsers {
        lookups: AtomicUsize,
    }

    impl UserDatabase for FakeUsers {
        fn uid_of(&self, username: &str) -> io::Result<u32> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            match username {
                "chronos" => Ok(1000),
                "debugd" => Ok(20104),
                _ => Err(io::Error::from(io::ErrorKind::NotFound)),
            }
        }
    }

    fn service() -> (Arc<RecordingTransport>, Arc<FakeUsers>, RoutingPolicyService) {
        let transport = Arc::new(RecordingTransport::default());
        let users = Arc::new(FakeUsers {
            lookups: AtomicUsize::new(0),
        });
        let rtnl = Arc::new(RtnlHandler::with_initial_sequence(transport.clone(), 1));
        let config = RoutingConfig {
            user_traffic_usernames: vec!["chronos".into(), "nobody-here".into(), "debugd".into()],
            ..RoutingConfig::default()
        };
        let service = RoutingPolicyService::new(rtnl, users.clone(), &config);
        (transport, users, service)
    }

    fn mark_rule() -> RoutingPolicyEntry {
        RoutingPolicyEntry::new(IpFamily::V4)
            .with_priority(1010)
            .with_table(1003)
            .with_fw_mark(FwMark::for_table(1003))
    }

    fn dumped(seq: u32, entry: RoutingPolicyEntry) -> RtnlMessage {
        RtnlMessage::new(Mode::Add, RtnlEntity::rule(entry))
            .with_flags(NLM_F_MULTI)
            .with_seq(seq)
    }

    fn dump_done(seq: u32) -> RtnlMessage {
        RtnlMessage::new(Mode::Add, RtnlEntity::Done)
            .with_flags(NLM_F_MULTI)
            .with_seq(seq)
    }

    #[test]
    fn test_duplicate_rule_is_added_once() {
        let (transport, _, mut service) = service();
        service.add_rule(3, mark_rule()).unwrap();
        service.add_rule(3, mark_rule()).unwrap();

        assert_eq!(transport.rules(Mode::Add), vec![mark_rule()]);
        assert_eq!(service.rules(3).len(), 1);
        let sent = transport.messages();
        assert_eq!(sent[0].flags & (NLM_F_CREATE | NLM_F_EXCL), NLM_F_CREATE | NLM_F_EXCL);

        // The same rule for another interface is a separate entry.
        service.add_rule(4, mark_rule()).unwrap();
        assert_eq!(transport.rules(Mode::Add).len(), 2);
    }

    #[test]
    fn test_flush_rules() {
        let (transport, _, mut service) = service();
        service.add_rule(3, mark_rule()).unwrap();
        service
            .add_rule(3, mark_rule().with_oif("eth0"))
            .unwrap();
        service.flush_rules(3);

        assert_eq!(transport.rules(Mode::Delete).len(), 2);
        assert!(service.rules(3).is_empty());
    }

    #[test]
    fn test_stale_rules_are_collected() {
        let (transport, _, mut service) = service();
        service.add_rule(3, mark_rule()).unwrap();
        let seq = service.request_rule_dump(IpFamily::V4).unwrap();
        assert!(service.is_dumping());
        transport.clear();

        // Tracked: ignored.
        service.on_kernel_message(&dumped(seq, mark_rule()));
        // Kernel main and local rules: ignored.
        service.on_kernel_message(&dumped(
            seq,
            RoutingPolicyEntry::new(IpFamily::V4).with_priority(RULE_PRIORITY_MAIN),
        ));
        service.on_kernel_message(&dumped(
            seq,
            RoutingPolicyEntry::new(IpFamily::V4)
                .with_priority(RULE_PRIORITY_LOCAL)
                .with_table(255),
        ));
        assert_eq!(transport.count(), 0);

        // Untracked rule in range: exactly one delete.
        let stale = RoutingPolicyEntry::new(IpFamily::V6)
            .with_priority(1020)
            .with_table(1009)
            .with_oif("wlan0");
        service.on_kernel_message(&dumped(seq, stale.clone()));
        assert_eq!(transport.rules(Mode::Delete), vec![stale.clone()]);

        // Delete notifications and non-lookup actions are ignored.
        service.on_kernel_message(
            &RtnlMessage::new(Mode::Delete, RtnlEntity::rule(stale.clone())).with_seq(seq),
        );
        service.on_kernel_message(
            &RtnlMessage::new(
                Mode::Add,
                RtnlEntity::Rule {
                    action: 2,
                    entry: stale.clone(),
                },
            )
            .with_seq(seq),
        );
        assert_eq!(transport.count(), 1);

        // Once the dump is done its sequence no longer collects anything.
        service.on_kernel_message(&dump_done(seq));
        assert!(!service.is_dumping());
        service.on_kernel_message(&dumped(seq, stale));
        assert_eq!(transport.count(), 1);
    }

    #[test]
    fn test_rules_added_by_others_are_kept() {
        let (transport, _, mut service) = service();
        let seq = service.request_rule_dump(IpFamily::V4).unwrap();
        transport.clear();

        let foreign = RoutingPolicyEntry::new(IpFamily::V4)
            .with_priority(5000)
            .with_table(100);
        // A multicast notification from another process, before and after
        // our dump completes.
        let mut notification = RtnlMessage::new(Mode::Add, RtnlEntity::rule(foreign.clone()));
        notification.pid = 4242;
        service.on_kernel_message(&notification);
        service.on_kernel_message(&dump_done(seq));
        service.on_kernel_message(&notification);

        // A reply to someone else's dump.
        service.on_kernel_message(&dumped(seq.wrapping_add(1), foreign));
        assert_eq!(transport.count(), 0);
    }

    #[test]
    fn test_static_rule_survives_interface_flush() {
        let (_, _, mut service) = service();
        let main = RoutingPolicyEntry::new(IpFamily::V4)
            .with_priority(1000)
            .with_table(RT_TABLE_MAIN);
        service.add_rule(STATIC_RULES_INDEX, main.clone()).unwrap();
        service.flush_rules(3);
        assert_eq!(service.rules(STATIC_RULES_INDEX), &[main]);
    }

    #[test]
    fn test_user_traffic_uids_resolved_once() {
        let (_, users, mut service) = service();
        assert_eq!(service.get_user_traffic_uids(), &[1000, 20104]);
        assert_eq!(service.get_user_traffic_uids(), &[1000, 20104]);
        assert_eq!(users.lookups.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_rule_dump_request() {
        let (transport, _, mut service) = service();
        let seq = service.request_rule_dump(IpFamily::V6).unwrap();
        let sent = transport.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].seq, seq);
        assert_eq!(sent[0].mode, Mode::Get);
    }

    #[test]
    fn test_system_user_database_root() {
        assert_eq!(SystemUserDatabase.uid_of("root").unwrap(), 0);
        assert!(SystemUserDatabase.uid_of("no-such-user-policyroute").is_err());
    }
}
