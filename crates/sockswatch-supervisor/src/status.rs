//! Read-side types handed to front ends: snapshots and change events.

use std::collections::BTreeMap;
use std::fmt;

use sockswatch_config::ServerId;

use crate::probe::PortStatus;

/// Health of one tunnel as last observed by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Health {
    /// A process was just spawned and no probe has completed for it yet.
    Starting,
    Open,
    Closed,
}

impl From<PortStatus> for Health {
    fn from(status: PortStatus) -> Self {
        match status {
            PortStatus::Open => Health::Open,
            PortStatus::Closed => Health::Closed,
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Health::Starting => "Starting",
            Health::Open => "Open",
            Health::Closed => "Closed",
        };
        f.write_str(label)
    }
}

/// Published view of one tunnel. Replaced as a whole on every mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStatus {
    pub display_name: String,
    pub host: String,
    pub port: u16,
    pub health: Health,
    pub generation: u64,
    pub pid: Option<u32>,
}

/// Point-in-time copy of every tunnel's status, ordered by id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    tunnels: BTreeMap<ServerId, TunnelStatus>,
}

impl Snapshot {
    pub(crate) fn new(tunnels: BTreeMap<ServerId, TunnelStatus>) -> Self {
        Self { tunnels }
    }

    pub fn get(&self, id: ServerId) -> Option<&TunnelStatus> {
        self.tunnels.get(&id)
    }

    pub fn health(&self, id: ServerId) -> Option<Health> {
        self.get(id).map(|status| status.health)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ServerId, &TunnelStatus)> {
        self.tunnels.iter()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// `id -> (display name, health)`, the minimal view a renderer needs.
    pub fn summary(&self) -> BTreeMap<ServerId, (String, Health)> {
        self.tunnels
            .iter()
            .map(|(id, status)| (*id, (status.display_name.clone(), status.health)))
            .collect()
    }
}

/// A status change pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// A tunnel entered the catalog and its process was spawned.
    Added {
        id: ServerId,
        display_name: String,
        generation: u64,
    },
    Changed {
        id: ServerId,
        old: Health,
        new: Health,
        generation: u64,
    },
    /// Spawning failed; the tunnel is now `Closed` with no process.
    SpawnFailed {
        id: ServerId,
        old: Health,
        generation: u64,
        error: String,
    },
    Removed { id: ServerId },
}

impl StatusEvent {
    pub fn id(&self) -> ServerId {
        match self {
            StatusEvent::Added { id, .. }
            | StatusEvent::Changed { id, .. }
            | StatusEvent::SpawnFailed { id, .. }
            | StatusEvent::Removed { id } => *id,
        }
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::Added { id, display_name, .. } => {
                write!(f, "[{}] {} added, starting", id, display_name)
            }
            StatusEvent::Changed { id, old, new, .. } => write!(f, "[{}] {} -> {}", id, old, new),
            StatusEvent::SpawnFailed { id, error, .. } => {
                write!(f, "[{}] spawn failed: {}", id, error)
            }
            StatusEvent::Removed { id } => write!(f, "[{}] removed", id),
        }
    }
}
