//! Recording doubles for the kernel socket and tunables.

use std::collections::{HashMap, HashSet};
use std::io;

use parking_lot::Mutex;

use crate::socket::Transport;
use crate::sysctl::Sysctl;
use crate::wire::{Mode, RtnlEntity, RtnlMessage};
use crate::Result;

/// Transport that keeps every sent message.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl RecordingTransport {
    /// Decoded copies of everything sent so far.
    pub fn messages(&self) -> Vec<RtnlMessage> {
        self.sent
            .lock()
            .iter()
            .map(|buf| RtnlMessage::decode(buf).expect("sent message decodes"))
            .collect()
    }

    /// Messages sent with `mode`.
    pub fn with_mode(&self, mode: Mode) -> Vec<RtnlMessage> {
        self.messages()
            .into_iter()
            .filter(|msg| msg.mode == mode)
            .collect()
    }

    /// Rules carried by sent messages of `mode`.
    pub fn rules(&self, mode: Mode) -> Vec<crate::types::RoutingPolicyEntry> {
        self.with_mode(mode)
            .into_iter()
            .filter_map(|msg| match msg.entity {
                RtnlEntity::Rule { entry, .. } => Some(entry),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl Transport for RecordingTransport {
    fn send(&self, buf: &[u8]) -> Result<()> {
        self.sent.lock().push(buf.to_vec());
        Ok(())
    }
}

/// In-memory tunables; keys listed as missing fail with `NotFound`.
#[derive(Default)]
pub struct MemorySysctl {
    values: Mutex<HashMap<String, String>>,
    missing: Mutex<HashSet<String>>,
}

impl MemorySysctl {
    pub fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    pub fn set_missing(&self, key: &str) {
        self.missing.lock().insert(key.to_string());
    }
}

impl Sysctl for MemorySysctl {
    fn write(&self, key: &str, value: &str) -> io::Result<()> {
        if self.missing.lock().contains(key) {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}
