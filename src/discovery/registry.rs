//! Process-wide table of advertised endpoints.

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    config::split_list,
    finder::{Source, SourceAddress},
};

/// Group used by advertisers that name none and by finders without a filter.
pub(crate) const DEFAULT_GROUP: &str = "public";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub(crate) enum EntryKind {
    Source = 0,
    Receiver = 1,
}

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub name: String,
    pub kind: EntryKind,
    pub address: SocketAddr,
    /// Lowercased group names.
    pub groups: Vec<String>,
    /// Originates on this host.
    pub local: bool,
    /// Registered by this process. Owned entries never expire.
    pub owned: bool,
    pub instance: u64,
    pub last_seen: Instant,
}

impl Entry {
    pub(crate) fn source(&self) -> Source {
        Source {
            name: self.name.clone(),
            address: SourceAddress::Ip(self.address.to_string()),
        }
    }
}

/// Parses a group list, substituting the default group when it is empty.
pub(crate) fn parse_groups(groups: Option<&str>) -> Vec<String> {
    let mut parsed: Vec<String> = groups
        .map(|g| split_list(g).map(str::to_lowercase).collect())
        .unwrap_or_default();
    if parsed.is_empty() {
        parsed.push(DEFAULT_GROUP.to_owned());
    }
    parsed.sort();
    parsed.dedup();
    parsed
}

/// Sources and receivers have separate namespaces.
type Key = (EntryKind, String);

#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: HashMap<Key, Entry>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes an entry. Returns `true` if listings change.
    ///
    /// A remote announcement never replaces an entry owned by this process.
    pub(crate) fn upsert(&mut self, entry: Entry) -> bool {
        let key = (entry.kind, entry.name.clone());
        match self.entries.get_mut(&key) {
            Some(existing) if existing.owned && !entry.owned => false,
            Some(existing) => {
                let changed = existing.address != entry.address
                    || existing.groups != entry.groups
                    || existing.local != entry.local;
                *existing = entry;
                changed
            }
            None => {
                self.entries.insert(key, entry);
                true
            }
        }
    }

    /// Removes the `kind` entry called `name` if it belongs to `instance`.
    pub(crate) fn remove(&mut self, kind: EntryKind, name: &str, instance: u64) -> bool {
        let key = (kind, name.to_owned());
        match self.entries.get(&key) {
            Some(entry) if entry.instance == instance => {
                self.entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Drops remote entries not seen within `ttl`. Returns `true` if any went.
    pub(crate) fn expire(&mut self, now: Instant, ttl: Duration) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.owned || now.saturating_duration_since(e.last_seen) < ttl);
        self.entries.len() != before
    }

    pub(crate) fn get(&self, kind: EntryKind, name: &str) -> Option<&Entry> {
        self.entries.get(&(kind, name.to_owned()))
    }

    pub(crate) fn owned(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values().filter(|e| e.owned)
    }

    /// Entries of `kind` in any of `groups`, optionally hiding this host's.
    pub(crate) fn list(&self, kind: EntryKind, groups: &[String], show_local: bool) -> Vec<Source> {
        self.entries
            .values()
            .filter(|e| e.kind == kind)
            .filter(|e| show_local || !e.local)
            .filter(|e| e.groups.iter().any(|g| groups.contains(g)))
            .map(Entry::source)
            .collect()
    }
}
