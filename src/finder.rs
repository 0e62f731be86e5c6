//! Source discovery and network browsing.

use std::{
    fmt::{self, Display, Formatter},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    config::StringList,
    discovery::{parse_groups, DiscoveryService},
    runtime, Result, Runtime,
};

/// Configuration for source discovery.
///
/// Use the builder pattern to create instances with specific settings.
///
/// # Examples
///
/// ```
/// use grafton_av::FinderOptions;
///
/// // Find all sources including local ones
/// let options = FinderOptions::builder()
///     .show_local_sources(true)
///     .build();
///
/// // Groups may be a comma-separated string or a list
/// let options = FinderOptions::builder()
///     .groups(["public", "studio"])
///     .build();
/// assert_eq!(options.groups.as_deref(), Some("public,studio"));
///
/// // Ask specific hosts directly when multicast does not reach them
/// let options = FinderOptions::builder()
///     .extra_ips("192.168.1.20,10.0.0.7:5960")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct FinderOptions {
    /// Whether sources running on this machine are listed.
    pub show_local_sources: bool,
    /// Comma-separated groups to list. `None` lists the `public` group.
    pub groups: Option<String>,
    /// Comma-separated `ip` or `ip:port` discovery peers to query directly.
    pub extra_ips: Option<String>,
}

impl Default for FinderOptions {
    fn default() -> Self {
        FinderOptionsBuilder::new().build()
    }
}

impl FinderOptions {
    /// Create a builder for configuring find options
    pub fn builder() -> FinderOptionsBuilder {
        FinderOptionsBuilder::new()
    }
}

/// Builder for configuring FinderOptions with ergonomic method chaining
#[derive(Debug, Clone, Default)]
pub struct FinderOptionsBuilder {
    show_local_sources: Option<bool>,
    groups: Option<StringList>,
    extra_ips: Option<StringList>,
}

impl FinderOptionsBuilder {
    /// Creates a new builder with default settings.
    ///
    /// Default settings:
    /// - `show_local_sources`: `true`
    /// - `groups`: `None` (the `public` group)
    /// - `extra_ips`: `None`
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure whether to show local sources
    #[must_use]
    pub fn show_local_sources(mut self, show: bool) -> Self {
        self.show_local_sources = Some(show);
        self
    }

    /// Set the groups to search
    #[must_use]
    pub fn groups(mut self, groups: impl Into<StringList>) -> Self {
        self.groups = Some(groups.into());
        self
    }

    /// Set extra discovery peers to query
    #[must_use]
    pub fn extra_ips(mut self, ips: impl Into<StringList>) -> Self {
        self.extra_ips = Some(ips.into());
        self
    }

    /// Build the FinderOptions
    #[must_use]
    pub fn build(self) -> FinderOptions {
        FinderOptions {
            show_local_sources: self.show_local_sources.unwrap_or(true),
            groups: self.groups.as_ref().and_then(StringList::normalize),
            extra_ips: self.extra_ips.as_ref().and_then(StringList::normalize),
        }
    }
}

/// Browses the process-wide source registry.
///
/// Any number of finders can exist at once; they share one registry that
/// the discovery service keeps current in the background.
///
/// # Examples
///
/// ```no_run
/// # use grafton_av::{Runtime, FinderOptions, Finder};
/// # use std::time::Duration;
/// # async fn run() -> Result<(), grafton_av::Error> {
/// let runtime = Runtime::new()?;
/// let finder = Finder::new(&runtime, &FinderOptions::default())?;
///
/// if finder.wait_for_sources(Duration::from_secs(5)).await {
///     for source in finder.current_sources() {
///         println!("Found: {source}");
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Finder {
    runtime: Runtime,
    discovery: Arc<DiscoveryService>,
    groups: Vec<String>,
    show_local_sources: bool,
    seen: AtomicU64,
}

impl Finder {
    /// Creates a finder and queries any extra peers right away.
    pub fn new(runtime: &Runtime, options: &FinderOptions) -> Result<Self> {
        let discovery = runtime.discovery().clone();
        if let Some(peers) = &options.extra_ips {
            discovery.add_peers(peers);
        }
        Ok(Self {
            runtime: runtime.clone(),
            discovery,
            groups: parse_groups(options.groups.as_deref()),
            show_local_sources: options.show_local_sources,
            seen: AtomicU64::new(0),
        })
    }

    /// Waits until the registry changes or `timeout` elapses.
    ///
    /// Returns `true` if the registry changed since the previous call (or
    /// since the finder was created). A zero timeout only checks.
    pub async fn wait_for_sources(&self, timeout: Duration) -> bool {
        let mut changes = self.discovery.subscribe();
        let seen = self.seen.load(Ordering::Acquire);
        let generation = {
            let current = *changes.borrow_and_update();
            if current != seen {
                Some(current)
            } else if timeout.is_zero() {
                None
            } else {
                let changed = changes.wait_for(|g| *g != seen);
                match runtime::timeout(self.runtime.handle(), timeout, changed).await {
                    Some(Ok(generation)) => Some(*generation),
                    _ => None,
                }
            }
        };
        match generation {
            Some(generation) => {
                self.seen.store(generation, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the sources currently known.
    pub fn current_sources(&self) -> Vec<Source> {
        self.discovery
            .sources(&self.groups, self.show_local_sources)
    }

    /// Current sources, waiting up to `timeout` for a change if there are
    /// none yet.
    pub async fn sources(&self, timeout: Duration) -> Vec<Source> {
        let sources = self.current_sources();
        if !sources.is_empty() || timeout.is_zero() {
            return sources;
        }
        self.wait_for_sources(timeout).await;
        self.current_sources()
    }

    /// Receivers that advertise themselves by name.
    pub fn current_receivers(&self) -> Vec<Source> {
        self.discovery
            .receivers(&self.groups, self.show_local_sources)
    }

    /// Finds the first source whose name or address contains `host`.
    pub async fn find_by_host(&self, host: &str, timeout: Duration) -> Option<Source> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(source) = self
                .current_sources()
                .into_iter()
                .find(|s| s.matches_host(host))
            {
                return Some(source);
            }
            let left = deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));
            if left.is_zero() || !self.wait_for_sources(left).await {
                return None;
            }
        }
    }
}

/// Network address of a source.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub enum SourceAddress {
    /// No address known; the source is resolved by name.
    #[default]
    None,
    /// URL form, e.g. `tcp://camera.local:5961`.
    Url(String),
    /// `host:port` form.
    Ip(String),
}

impl SourceAddress {
    /// Check if this address contains the given host or IP.
    ///
    /// # Examples
    ///
    /// ```
    /// use grafton_av::SourceAddress;
    ///
    /// let addr = SourceAddress::Ip("192.168.1.100:5961".to_string());
    /// assert!(addr.contains_host("192.168.1.100"));
    /// assert!(addr.contains_host("192.168.1"));
    /// ```
    pub fn contains_host(&self, host: &str) -> bool {
        self.as_str().is_some_and(|addr| addr.contains(host))
    }

    /// Port number, if the address carries one.
    ///
    /// # Examples
    ///
    /// ```
    /// use grafton_av::SourceAddress;
    ///
    /// assert_eq!(SourceAddress::Ip("10.0.0.2:5961".into()).port(), Some(5961));
    /// assert_eq!(SourceAddress::Ip("10.0.0.2".into()).port(), None);
    /// assert_eq!(SourceAddress::Url("tcp://cam.local:6000/main".into()).port(), Some(6000));
    /// ```
    pub fn port(&self) -> Option<u16> {
        let authority = self.authority()?;
        let (_, port) = authority.rsplit_once(':')?;
        port.parse().ok()
    }

    /// Host part without scheme, port or path.
    pub fn host(&self) -> Option<&str> {
        let authority = self.authority()?;
        let host = match authority.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => host,
            _ => authority,
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        (!host.is_empty()).then_some(host)
    }

    /// Resolves the address to a socket address if it is numeric.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let authority = self.authority()?;
        authority.parse().ok()
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            SourceAddress::Ip(ip) => Some(ip),
            SourceAddress::Url(url) => Some(url),
            SourceAddress::None => None,
        }
    }

    /// `host:port` with any URL scheme and path removed.
    fn authority(&self) -> Option<&str> {
        let addr = self.as_str()?;
        let addr = addr.split_once("://").map_or(addr, |(_, rest)| rest);
        addr.split('/').next()
    }
}

impl From<SocketAddr> for SourceAddress {
    fn from(addr: SocketAddr) -> Self {
        SourceAddress::Ip(addr.to_string())
    }
}

/// A discovered or explicitly named source.
///
/// Names take the form `"MACHINE (Source)"`. A source without an address
/// is resolved by name through the local registry when a receiver connects.
///
/// # Examples
///
/// ```
/// use grafton_av::{Source, SourceAddress};
///
/// let source = Source {
///     name: "LAPTOP (Camera 1)".to_string(),
///     address: SourceAddress::Ip("192.168.1.100:5961".to_string()),
/// };
///
/// assert_eq!(source.to_string(), "LAPTOP (Camera 1)@192.168.1.100:5961");
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct Source {
    /// The advertised name (e.g., "MACHINE (Source Name)").
    pub name: String,
    /// Where to connect.
    pub address: SourceAddress,
}

impl Source {
    /// A source known only by name.
    pub fn named(name: impl Into<String>) -> Self {
        Source {
            name: name.into(),
            address: SourceAddress::None,
        }
    }

    /// Check if this source matches a given host or IP address.
    ///
    /// Both the name and the address are searched.
    ///
    /// ```
    /// use grafton_av::{Source, SourceAddress};
    ///
    /// let source = Source {
    ///     name: "CAMERA1 (Chan1)".to_string(),
    ///     address: SourceAddress::Ip("192.168.0.107:5961".to_string()),
    /// };
    ///
    /// assert!(source.matches_host("192.168.0.107"));
    /// assert!(source.matches_host("CAMERA1"));
    /// assert!(!source.matches_host("192.168.1.1"));
    /// ```
    pub fn matches_host(&self, host: &str) -> bool {
        self.name.contains(host) || self.address.contains_host(host)
    }

    /// Host part of the address, if any.
    pub fn host(&self) -> Option<&str> {
        self.address.host()
    }
}

impl Display for Source {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.address.as_str() {
            Some(addr) => write!(f, "{}@{}", self.name, addr),
            None => f.write_str(&self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parts() {
        let ip = SourceAddress::Ip("192.168.1.100:5961".into());
        assert_eq!(ip.host(), Some("192.168.1.100"));
        assert_eq!(ip.port(), Some(5961));
        assert_eq!(ip.socket_addr(), Some("192.168.1.100:5961".parse().unwrap()));

        let url = SourceAddress::Url("tcp://camera.local:6000/main".into());
        assert_eq!(url.host(), Some("camera.local"));
        assert_eq!(url.port(), Some(6000));
        assert_eq!(url.socket_addr(), None);

        let bare = SourceAddress::Ip("camera.local".into());
        assert_eq!(bare.host(), Some("camera.local"));
        assert_eq!(bare.port(), None);

        assert_eq!(SourceAddress::None.host(), None);
        assert!(!SourceAddress::None.contains_host(""));
    }

    #[test]
    fn test_ipv6_address() {
        let addr = SourceAddress::from("[::1]:7000".parse::<SocketAddr>().unwrap());
        assert_eq!(addr.port(), Some(7000));
        assert_eq!(addr.host(), Some("::1"));
        assert!(addr.socket_addr().is_some());
    }

    #[test]
    fn test_named_source_display() {
        let source = Source::named("HOST (cam)");
        assert_eq!(source.to_string(), "HOST (cam)");
        assert_eq!(source.host(), None);
    }

    #[test]
    fn test_finder_options_normalization() {
        let options = FinderOptions::builder()
            .groups(vec!["a", " b "])
            .extra_ips(" , ")
            .build();
        assert_eq!(options.groups.as_deref(), Some("a, b "));
        assert_eq!(options.extra_ips, None);
        assert!(options.show_local_sources);
    }
}
