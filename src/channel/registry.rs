//! Registry of open channels for one session

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

/// What a channel was opened for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelKind {
    Shell,
    Exec { command: String },
    Subsystem { name: String },
    DirectTcpip { host: String, port: u16 },
    ForwardedTcpip { port: u16 },
    Loopback,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Shell => write!(f, "shell"),
            ChannelKind::Exec { command } => write!(f, "exec({})", command),
            ChannelKind::Subsystem { name } => write!(f, "subsystem({})", name),
            ChannelKind::DirectTcpip { host, port } => write!(f, "direct-tcpip({}:{})", host, port),
            ChannelKind::ForwardedTcpip { port } => write!(f, "forwarded-tcpip({})", port),
            ChannelKind::Loopback => write!(f, "loopback"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelEntry {
    pub kind: ChannelKind,
    pub opened_at: Instant,
}

#[derive(Debug, Default)]
pub struct ChannelRegistry {
    next_id: AtomicU64,
    channels: DashMap<u64, ChannelEntry>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: ChannelKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.channels.insert(
            id,
            ChannelEntry {
                kind,
                opened_at: Instant::now(),
            },
        );
        id
    }

    /// Returns `true` only for the first release of `id`.
    pub fn release(&self, id: u64) -> bool {
        self.channels.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn list(&self) -> Vec<(u64, ChannelEntry)> {
        let mut entries: Vec<_> = self
            .channels
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }
}
