//! Source discovery: the process-wide registry and the announcement
//! protocol that keeps it current.
//!
//! Sessions in this process register directly. Other processes and hosts
//! are learned from multicast announcements and from explicitly configured
//! unicast peers. Remote entries expire when their announcements stop.

mod packet;
mod registry;
mod socket;

use std::{
    collections::HashSet,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use parking_lot::{Mutex, RwLock};
use tokio::{
    net::UdpSocket,
    runtime::Handle,
    sync::watch,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{config::split_list, finder::Source, Config, Error, Result};

pub(crate) use registry::{parse_groups, EntryKind};
use {
    packet::{Packet, MAX_DATAGRAM},
    registry::{Entry, Registry},
};

pub(crate) struct DiscoveryService {
    config: Config,
    instance: u64,
    machine_name: String,
    local_ips: Vec<IpAddr>,
    registry: RwLock<Registry>,
    changes: watch::Sender<u64>,
    socket: Option<Arc<UdpSocket>>,
    peers: Mutex<HashSet<SocketAddr>>,
    cancel: CancellationToken,
}

impl DiscoveryService {
    /// Starts the listener and announcer on `handle`.
    ///
    /// A discovery socket that cannot be bound is not an error: the service
    /// then only knows about sessions in this process.
    pub(crate) fn start(handle: &Handle, config: &Config) -> Arc<Self> {
        let socket = {
            let _guard = handle.enter();
            match socket::bind(config) {
                Ok(socket) => Some(Arc::new(socket)),
                Err(e) => {
                    tracing::warn!(
                        port = config.discovery_port,
                        error = %e,
                        "discovery socket unavailable, only in-process sources will be found"
                    );
                    None
                }
            }
        };

        let (changes, _) = watch::channel(0u64);
        let service = Arc::new(Self {
            config: config.clone(),
            instance: rand::random(),
            machine_name: machine_name(),
            local_ips: socket::local_addresses(config),
            registry: RwLock::new(Registry::new()),
            changes,
            socket: socket.clone(),
            peers: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
        });

        if let Some(socket) = socket {
            handle.spawn(service.clone().listen(socket));
        }
        handle.spawn(service.clone().maintain());

        tracing::debug!(
            instance = service.instance,
            machine = %service.machine_name,
            "discovery started"
        );
        service
    }

    pub(crate) fn machine_name(&self) -> &str {
        &self.machine_name
    }

    /// Network-visible name for a session called `name`.
    pub(crate) fn advertised_name(&self, name: &str) -> String {
        format!("{} ({})", self.machine_name, name)
    }

    /// Whether `ip` reaches this machine.
    pub(crate) fn is_local_ip(&self, ip: IpAddr) -> bool {
        ip.is_loopback() || ip.is_unspecified() || self.local_ips.contains(&ip)
    }

    /// Registers a local endpoint and announces it until the returned guard
    /// is dropped.
    pub(crate) fn advertise(
        self: &Arc<Self>,
        kind: EntryKind,
        name: &str,
        groups: Option<&str>,
        port: u16,
    ) -> Result<Announcement> {
        if name.trim().is_empty() {
            return Err(Error::InvalidConfiguration(
                "Advertised name must not be empty".into(),
            ));
        }
        let entry = Entry {
            name: name.to_owned(),
            kind,
            address: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            groups: parse_groups(groups),
            local: true,
            owned: true,
            instance: self.instance,
            last_seen: Instant::now(),
        };
        // Encoding checks the record fits in a datagram.
        self.announce_packet(&entry).encode()?;

        {
            let mut registry = self.registry.write();
            if registry.get(kind, name).is_some_and(|e| e.owned) {
                return Err(Error::InvalidConfiguration(format!(
                    "'{name}' is already advertised by this process"
                )));
            }
            registry.upsert(entry.clone());
        }
        self.bump();
        self.broadcast(&self.announce_packet(&entry));
        tracing::info!(name, port, groups = %entry.groups.join(","), "advertising");

        Ok(Announcement {
            service: Arc::clone(self),
            kind,
            name: name.to_owned(),
        })
    }

    fn withdraw(&self, kind: EntryKind, name: &str) {
        let removed = self.registry.write().remove(kind, name, self.instance);
        if removed {
            self.bump();
            self.broadcast(&Packet::Withdraw {
                instance: self.instance,
                kind,
                name: name.to_owned(),
            });
            tracing::info!(name, "withdrawn");
        }
    }

    /// Adds unicast peers from a comma-separated list of `ip` or `ip:port`
    /// items and queries them right away.
    pub(crate) fn add_peers(&self, list: &str) {
        let mut added = Vec::new();
        for item in split_list(list) {
            let addr = item.parse::<SocketAddr>().ok().or_else(|| {
                item.parse::<IpAddr>()
                    .ok()
                    .map(|ip| SocketAddr::new(ip, self.config.discovery_port))
            });
            match addr {
                Some(addr) => {
                    if self.peers.lock().insert(addr) {
                        added.push(addr);
                    }
                }
                None => tracing::warn!(peer = item, "ignoring unparsable discovery peer"),
            }
        }
        for addr in added {
            tracing::debug!(peer = %addr, "added discovery peer");
            self.unicast(
                &Packet::Query {
                    instance: self.instance,
                },
                addr,
            );
            let owned: Vec<Entry> = self.registry.read().owned().cloned().collect();
            for entry in &owned {
                self.unicast(&self.announce_packet(entry), addr);
            }
        }
    }

    pub(crate) fn sources(&self, groups: &[String], show_local: bool) -> Vec<Source> {
        self.registry
            .read()
            .list(EntryKind::Source, groups, show_local)
    }

    pub(crate) fn receivers(&self, groups: &[String], show_local: bool) -> Vec<Source> {
        self.registry
            .read()
            .list(EntryKind::Receiver, groups, show_local)
    }

    /// Connect address of a named source.
    pub(crate) fn lookup(&self, name: &str) -> Option<SocketAddr> {
        self.registry
            .read()
            .get(EntryKind::Source, name)
            .map(|e| e.address)
    }

    /// Watch channel whose value increases whenever listings change.
    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Withdraws everything this process advertised and stops the tasks.
    pub(crate) fn stop(&self) {
        let owned: Vec<(EntryKind, String)> = self
            .registry
            .read()
            .owned()
            .map(|e| (e.kind, e.name.clone()))
            .collect();
        for (kind, name) in owned {
            self.withdraw(kind, &name);
        }
        self.cancel.cancel();
    }

    fn bump(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }

    fn announce_packet(&self, entry: &Entry) -> Packet {
        Packet::Announce {
            instance: self.instance,
            kind: entry.kind,
            name: entry.name.clone(),
            groups: entry.groups.join(","),
            port: entry.address.port(),
        }
    }

    fn broadcast(&self, packet: &Packet) {
        let Some(socket) = &self.socket else {
            return;
        };
        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(error = %e, "dropping unencodable discovery packet");
                return;
            }
        };
        if self.config.multicast_enabled {
            let group = SocketAddr::from((self.config.multicast_group, self.config.discovery_port));
            if let Err(e) = socket.try_send_to(&bytes, group) {
                tracing::debug!(%group, error = %e, "multicast announce failed");
            }
        }
        let peers: Vec<SocketAddr> = self.peers.lock().iter().copied().collect();
        for peer in peers {
            if let Err(e) = socket.try_send_to(&bytes, peer) {
                tracing::debug!(%peer, error = %e, "unicast announce failed");
            }
        }
    }

    fn unicast(&self, packet: &Packet, to: SocketAddr) {
        let Some(socket) = &self.socket else {
            return;
        };
        match packet.encode() {
            Ok(bytes) => {
                if let Err(e) = socket.try_send_to(&bytes, to) {
                    tracing::debug!(peer = %to, error = %e, "unicast discovery send failed");
                }
            }
            Err(e) => tracing::debug!(error = %e, "dropping unencodable discovery packet"),
        }
    }

    fn handle(&self, packet: Packet, from: SocketAddr) {
        if packet.instance() == self.instance {
            return;
        }
        match packet {
            Packet::Announce {
                instance,
                kind,
                name,
                groups,
                port,
            } => {
                let entry = Entry {
                    name,
                    kind,
                    address: SocketAddr::new(from.ip(), port),
                    groups: parse_groups(Some(&groups)),
                    local: self.local_ips.contains(&from.ip()),
                    owned: false,
                    instance,
                    last_seen: Instant::now(),
                };
                tracing::trace!(name = %entry.name, address = %entry.address, "announcement");
                if self.registry.write().upsert(entry) {
                    self.bump();
                }
            }
            Packet::Withdraw {
                instance,
                kind,
                name,
            } => {
                if self.registry.write().remove(kind, &name, instance) {
                    tracing::debug!(name = %name, "remote source withdrawn");
                    self.bump();
                }
            }
            Packet::Query { .. } => {
                let owned: Vec<Entry> = self.registry.read().owned().cloned().collect();
                for entry in &owned {
                    self.unicast(&self.announce_packet(entry), from);
                }
            }
        }
    }

    async fn listen(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; MAX_DATAGRAM + 64];
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };
            match received {
                Ok((len, from)) => match Packet::decode(&buf[..len]) {
                    Ok(packet) => self.handle(packet, from),
                    Err(e) => tracing::trace!(peer = %from, error = %e, "ignoring datagram"),
                },
                Err(e) => tracing::debug!(error = %e, "discovery receive failed"),
            }
        }
    }

    async fn maintain(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.announce_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let owned: Vec<Entry> = self.registry.read().owned().cloned().collect();
            for entry in &owned {
                self.broadcast(&self.announce_packet(entry));
            }
            let peers: Vec<SocketAddr> = self.peers.lock().iter().copied().collect();
            for peer in peers {
                self.unicast(
                    &Packet::Query {
                        instance: self.instance,
                    },
                    peer,
                );
            }
            let expired = self
                .registry
                .write()
                .expire(Instant::now(), self.config.source_ttl);
            if expired {
                self.bump();
            }
        }
    }
}

/// Keeps an endpoint advertised. Dropping it withdraws the endpoint.
pub(crate) struct Announcement {
    service: Arc<DiscoveryService>,
    kind: EntryKind,
    name: String,
}

impl Announcement {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Announcement {
    fn drop(&mut self) {
        self.service.withdraw(self.kind, &self.name);
    }
}

fn machine_name() -> String {
    hostname::get()
        .ok()
        .map(|name| name.to_string_lossy().into_owned())
        .and_then(|name| name.split('.').next().map(str::to_uppercase))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "LOCALHOST".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    fn offline_config() -> Config {
        Config::default().multicast(false).discovery_port(0)
    }

    #[test]
    fn test_advertise_and_withdraw() {
        let rt = test_runtime();
        let service = DiscoveryService::start(rt.handle(), &offline_config());
        let mut changes = service.subscribe();
        let groups = parse_groups(None);

        let name = service.advertised_name("unit advertise");
        let guard = service
            .advertise(EntryKind::Source, &name, None, 4100)
            .unwrap();
        assert!(changes.has_changed().unwrap());
        changes.mark_unchanged();

        let sources = service.sources(&groups, true);
        assert!(sources.iter().any(|s| s.name == name));
        assert!(service.sources(&groups, false).is_empty());
        assert_eq!(service.lookup(&name).map(|a| a.port()), Some(4100));

        drop(guard);
        assert!(changes.has_changed().unwrap());
        assert!(service.lookup(&name).is_none());
        service.stop();
    }

    #[test]
    fn test_duplicate_and_empty_names_rejected() {
        let rt = test_runtime();
        let service = DiscoveryService::start(rt.handle(), &offline_config());

        let _first = service
            .advertise(EntryKind::Source, "DUP (x)", None, 4200)
            .unwrap();
        assert!(service
            .advertise(EntryKind::Source, "DUP (x)", None, 4201)
            .is_err());
        assert!(service.advertise(EntryKind::Source, "  ", None, 4202).is_err());

        // A receiver may carry a source's name
        let receiver = service
            .advertise(EntryKind::Receiver, "DUP (x)", None, 4203)
            .unwrap();
        drop(receiver);
        assert_eq!(service.lookup("DUP (x)").map(|a| a.port()), Some(4200));
        service.stop();
    }

    #[test]
    fn test_remote_announcement_and_query() {
        let rt = test_runtime();
        let service = DiscoveryService::start(rt.handle(), &offline_config());
        let from: SocketAddr = "10.1.2.3:5960".parse().unwrap();

        service.handle(
            Packet::Announce {
                instance: 77,
                kind: EntryKind::Source,
                name: "REMOTE (cam)".into(),
                groups: "Studio".into(),
                port: 4300,
            },
            from,
        );
        let studio = parse_groups(Some("studio"));
        let sources = service.sources(&studio, false);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].address.port(), Some(4300));
        assert!(sources[0].matches_host("10.1.2.3"));
        assert!(service.sources(&parse_groups(None), true).is_empty());

        service.handle(
            Packet::Withdraw {
                instance: 78,
                kind: EntryKind::Source,
                name: "REMOTE (cam)".into(),
            },
            from,
        );
        assert_eq!(service.sources(&studio, true).len(), 1, "wrong instance");

        service.handle(
            Packet::Withdraw {
                instance: 77,
                kind: EntryKind::Source,
                name: "REMOTE (cam)".into(),
            },
            from,
        );
        assert!(service.sources(&studio, true).is_empty());
        service.stop();
    }

    #[test]
    fn test_own_announcements_ignored() {
        let rt = test_runtime();
        let service = DiscoveryService::start(rt.handle(), &offline_config());
        service.handle(
            Packet::Announce {
                instance: service.instance,
                kind: EntryKind::Source,
                name: "ECHO (cam)".into(),
                groups: String::new(),
                port: 4400,
            },
            "10.0.0.9:5960".parse().unwrap(),
        );
        assert!(service.lookup("ECHO (cam)").is_none());
        service.stop();
    }

    #[test]
    fn test_remote_sources_expire() {
        let rt = test_runtime();
        let config = offline_config()
            .announce_interval(Duration::from_millis(20))
            .source_ttl(Duration::from_millis(60));
        let service = DiscoveryService::start(rt.handle(), &config);
        service.handle(
            Packet::Announce {
                instance: 5,
                kind: EntryKind::Source,
                name: "FADING (cam)".into(),
                groups: String::new(),
                port: 4500,
            },
            "10.0.0.5:5960".parse().unwrap(),
        );
        assert!(service.lookup("FADING (cam)").is_some());
        std::thread::sleep(Duration::from_millis(300));
        assert!(service.lookup("FADING (cam)").is_none());
        service.stop();
    }
}
