//! Node registry
//!
//! The master's single source of truth for "who is connected". Each entry
//! maps a slave's command-listener address and machine name to the channel
//! the master dialed back to it.
//!
//! At most one entry exists per address and per machine name. Replacing or
//! removing an entry closes its channel, after the lock is released.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use svman_infra::{AuthenticatedChannel, NodeChannel};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Channel capacity for registry events
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A registered slave
#[derive(Clone, Debug)]
pub struct NodeEntry {
    /// `host:port` of the slave's command listener
    pub address: String,
    /// Logical machine name used by feature subsystems
    pub machine_name: String,
    /// Master → slave channel, owned by the registry once inserted
    pub channel: NodeChannel,
    /// Last successful active probe
    pub last_seen: SystemTime,
    /// When this entry was registered
    pub registered_at: SystemTime,
    /// Registry-assigned id, unique per upsert
    pub generation: u64,
}

impl NodeEntry {
    /// Create an entry stamped with the current time
    ///
    /// The generation is assigned on [`NodeRegistry::upsert`].
    pub fn new(
        address: impl Into<String>,
        machine_name: impl Into<String>,
        channel: NodeChannel,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            address: address.into(),
            machine_name: machine_name.into(),
            channel,
            last_seen: now,
            registered_at: now,
            generation: 0,
        }
    }

    /// Time since the last successful probe
    pub fn since_last_seen(&self) -> Duration {
        self.last_seen.elapsed().unwrap_or_default()
    }
}

/// Why an entry left the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalReason {
    /// Health checks exhausted or channel found closed
    Unhealthy,
    /// Removed explicitly
    Removed,
    /// Registration hook refused the node
    Rejected,
    /// Registry shutdown
    Shutdown,
}

/// Registry change notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    /// A node registered with no prior entry
    Registered {
        /// Listener address
        address: String,
        /// Machine name
        machine_name: String,
    },
    /// A node registered and displaced older entries
    Replaced {
        /// Listener address
        address: String,
        /// Machine name
        machine_name: String,
        /// Addresses of the displaced entries
        displaced: Vec<String>,
    },
    /// An entry was removed
    Removed {
        /// Listener address
        address: String,
        /// Machine name
        machine_name: String,
        /// Why it was removed
        reason: RemovalReason,
    },
}

/// Result of an upsert
#[derive(Debug)]
pub struct Upserted {
    /// Generation assigned to the new entry
    pub generation: u64,
    /// Entries the new one replaced (0, 1 or 2); their channels are closed
    pub displaced: Vec<NodeEntry>,
}

/// Lookup failure seen by feature subsystems
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No live channel to the machine
    #[error("machine '{machine_name}' is not connected")]
    NotConnected {
        /// Machine that was asked for
        machine_name: String,
    },
}

/// Live-channel lookup for feature subsystems
///
/// Never blocks waiting for a node to reconnect.
pub trait NodeChannels: Send + Sync {
    /// Channel to `machine_name`, with the shared secret attached
    fn channel_for(&self, machine_name: &str) -> Result<AuthenticatedChannel, RegistryError>;

    /// Machine names of every registered node
    fn machine_names(&self) -> Vec<String>;
}

#[derive(Default)]
struct RegistryState {
    by_address: HashMap<String, NodeEntry>,
    /// machine name → address
    by_name: HashMap<String, String>,
    next_generation: u64,
}

impl RegistryState {
    fn take(&mut self, address: &str) -> Option<NodeEntry> {
        let entry = self.by_address.remove(address)?;
        if self.by_name.get(&entry.machine_name).map(String::as_str) == Some(address) {
            self.by_name.remove(&entry.machine_name);
        }
        Some(entry)
    }
}

/// In-memory registry of connected slaves
pub struct NodeRegistry {
    state: RwLock<RegistryState>,
    events: broadcast::Sender<NodeEvent>,
}

/// Wrap registry in Arc for sharing across tasks
pub type SharedNodeRegistry = Arc<NodeRegistry>;

impl Default for NodeRegistry {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(RegistryState::default()),
            events,
        }
    }
}

impl NodeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking writer can't leave the maps half-updated: every mutation
    // finishes before anything that could panic.
    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Entry registered at `address`
    pub fn get_by_address(&self, address: &str) -> Option<NodeEntry> {
        self.read().by_address.get(address).cloned()
    }

    /// Entry registered under `machine_name`
    pub fn get_by_machine_name(&self, machine_name: &str) -> Option<NodeEntry> {
        let state = self.read();
        state
            .by_name
            .get(machine_name)
            .and_then(|address| state.by_address.get(address))
            .cloned()
    }

    /// Entry under `machine_name` whose channel is still usable
    pub fn get_healthy_by_machine_name(&self, machine_name: &str) -> Option<NodeEntry> {
        self.get_by_machine_name(machine_name)
            .filter(|entry| entry.channel.is_usable())
    }

    /// Copy of every entry
    pub fn snapshot(&self) -> Vec<NodeEntry> {
        self.read().by_address.values().cloned().collect()
    }

    /// Every registered channel
    pub fn all_channels(&self) -> Vec<NodeChannel> {
        self.read()
            .by_address
            .values()
            .map(|entry| entry.channel.clone())
            .collect()
    }

    /// Machine names of every entry, sorted
    pub fn machine_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.read().by_address.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.read().by_address.is_empty()
    }

    /// Insert `entry`, replacing any entry with the same address or name
    ///
    /// Displaced channels are closed after the lock is released, unless the
    /// displaced entry shares the new entry's channel.
    pub fn upsert(&self, mut entry: NodeEntry) -> Upserted {
        let new_channel = entry.channel.clone();
        let address = entry.address.clone();
        let machine_name = entry.machine_name.clone();

        let (generation, displaced) = {
            let mut state = self.write();
            let mut displaced = Vec::new();

            if let Some(old) = state.take(&address) {
                displaced.push(old);
            }
            if let Some(other) = state.by_name.get(&machine_name).cloned() {
                if let Some(old) = state.take(&other) {
                    displaced.push(old);
                }
            }

            state.next_generation += 1;
            entry.generation = state.next_generation;
            let generation = entry.generation;

            state.by_name.insert(machine_name.clone(), address.clone());
            state.by_address.insert(address.clone(), entry);
            (generation, displaced)
        };

        for old in &displaced {
            if !old.channel.same_channel(&new_channel) {
                old.channel.close();
            }
        }

        if displaced.is_empty() {
            info!(address = %address, machine = %machine_name, generation, "node registered");
            let _ = self.events.send(NodeEvent::Registered {
                address,
                machine_name,
            });
        } else {
            let displaced_addresses: Vec<String> =
                displaced.iter().map(|e| e.address.clone()).collect();
            info!(
                address = %address,
                machine = %machine_name,
                generation,
                displaced = ?displaced_addresses,
                "node re-registered, replaced previous entry"
            );
            let _ = self.events.send(NodeEvent::Replaced {
                address,
                machine_name,
                displaced: displaced_addresses,
            });
        }

        Upserted {
            generation,
            displaced,
        }
    }

    /// Remove the entry at `address` and close its channel
    pub fn remove(&self, address: &str) -> Option<NodeEntry> {
        let removed = self.write().take(address);
        self.finish_removal(removed, RemovalReason::Removed)
    }

    /// Remove the entry at `address` only if it is still `generation`
    ///
    /// Returns `None` when the entry is gone or was replaced by a newer
    /// registration.
    pub fn remove_if_current(
        &self,
        address: &str,
        generation: u64,
        reason: RemovalReason,
    ) -> Option<NodeEntry> {
        let removed = {
            let mut state = self.write();
            let current = state.by_address.get(address).map(|e| e.generation) == Some(generation);
            if current {
                state.take(address)
            } else {
                None
            }
        };
        self.finish_removal(removed, reason)
    }

    fn finish_removal(
        &self,
        removed: Option<NodeEntry>,
        reason: RemovalReason,
    ) -> Option<NodeEntry> {
        let entry = removed?;
        entry.channel.close();
        info!(
            address = %entry.address,
            machine = %entry.machine_name,
            reason = ?reason,
            registered_for = ?entry.registered_at.elapsed().unwrap_or_default(),
            "node removed"
        );
        let _ = self.events.send(NodeEvent::Removed {
            address: entry.address.clone(),
            machine_name: entry.machine_name.clone(),
            reason,
        });
        Some(entry)
    }

    /// Record a successful probe. Returns false if no entry exists.
    pub fn touch_last_seen(&self, address: &str) -> bool {
        match self.write().by_address.get_mut(address) {
            Some(entry) => {
                entry.last_seen = SystemTime::now();
                true
            }
            None => false,
        }
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Remove every entry and close every channel
    pub fn close_all(&self) -> usize {
        let drained: Vec<NodeEntry> = {
            let mut state = self.write();
            state.by_name.clear();
            state.by_address.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            self.finish_removal(Some(entry), RemovalReason::Shutdown);
        }
        debug!(count, "registry closed");
        count
    }
}

impl NodeChannels for NodeRegistry {
    fn channel_for(&self, machine_name: &str) -> Result<AuthenticatedChannel, RegistryError> {
        self.get_healthy_by_machine_name(machine_name)
            .map(|entry| entry.channel.authenticated())
            .ok_or_else(|| RegistryError::NotConnected {
                machine_name: machine_name.to_string(),
            })
    }

    fn machine_names(&self) -> Vec<String> {
        NodeRegistry::machine_names(self)
    }
}
