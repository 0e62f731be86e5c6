//! Runtime tunables and option value types.

use std::{env, net::Ipv4Addr, time::Duration};

use crate::{Error, Result};

/// Default UDP port used by discovery.
pub const DEFAULT_DISCOVERY_PORT: u16 = 5960;

/// Default IPv4 multicast group used by discovery.
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 96, 60);

/// A string-valued option that can be given either as one string or as a
/// sequence of strings.
///
/// Group filters and peer lists accept both forms. A sequence is joined with
/// `,` so `["a", "b"]` and `"a,b"` produce the same filter.
///
/// # Examples
///
/// ```
/// use grafton_av::StringList;
///
/// let one = StringList::from("studio,news");
/// let many = StringList::from(vec!["studio", "news"]);
/// assert_eq!(one.join(), many.join());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringList {
    One(String),
    Many(Vec<String>),
}

impl StringList {
    /// The canonical comma-joined form.
    pub fn join(&self) -> String {
        match self {
            StringList::One(s) => s.clone(),
            StringList::Many(items) => items.join(","),
        }
    }

    /// The canonical form, or `None` when it has no non-blank entries.
    pub(crate) fn normalize(&self) -> Option<String> {
        let joined = self.join();
        if split_list(&joined).next().is_none() {
            None
        } else {
            Some(joined)
        }
    }
}

impl From<&str> for StringList {
    fn from(value: &str) -> Self {
        StringList::One(value.to_owned())
    }
}

impl From<String> for StringList {
    fn from(value: String) -> Self {
        StringList::One(value)
    }
}

impl From<Vec<String>> for StringList {
    fn from(value: Vec<String>) -> Self {
        StringList::Many(value)
    }
}

impl From<Vec<&str>> for StringList {
    fn from(value: Vec<&str>) -> Self {
        StringList::Many(value.into_iter().map(str::to_owned).collect())
    }
}

impl From<&[&str]> for StringList {
    fn from(value: &[&str]) -> Self {
        StringList::Many(value.iter().map(|s| (*s).to_owned()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for StringList {
    fn from(value: [&str; N]) -> Self {
        StringList::Many(value.iter().map(|s| (*s).to_owned()).collect())
    }
}

/// Iterates over the trimmed, non-empty entries of a comma-joined list.
pub(crate) fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Engine configuration.
///
/// The engine reads its configuration once, when the first
/// [`Runtime`](crate::Runtime) handle starts it.
///
/// # Examples
///
/// ```
/// use grafton_av::Config;
/// use std::time::Duration;
///
/// let config = Config::default()
///     .discovery_port(15960)
///     .multicast(false)
///     .source_ttl(Duration::from_secs(3));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub discovery_port: u16,
    pub multicast_group: Ipv4Addr,
    pub multicast_enabled: bool,
    pub announce_interval: Duration,
    pub source_ttl: Duration,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub worker_threads: usize,
    pub audio_queue_depth: usize,
    pub metadata_queue_depth: usize,
    pub tcp_nodelay: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            multicast_group: DEFAULT_MULTICAST_GROUP,
            multicast_enabled: true,
            announce_interval: Duration::from_secs(1),
            source_ttl: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(2),
            worker_threads: 2,
            audio_queue_depth: 32,
            metadata_queue_depth: 64,
            tcp_nodelay: true,
        }
    }
}

impl Config {
    /// Defaults overlaid with `GRAFTON_AV_*` environment variables.
    ///
    /// Recognised variables: `GRAFTON_AV_DISCOVERY_PORT`,
    /// `GRAFTON_AV_MULTICAST_GROUP`, `GRAFTON_AV_MULTICAST` and
    /// `GRAFTON_AV_WORKER_THREADS`. Values that fail to parse are logged and
    /// ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = env_parse::<u16>("GRAFTON_AV_DISCOVERY_PORT") {
            config.discovery_port = port;
        }
        if let Some(group) = env_parse::<Ipv4Addr>("GRAFTON_AV_MULTICAST_GROUP") {
            if group.is_multicast() {
                config.multicast_group = group;
            } else {
                tracing::warn!(%group, "GRAFTON_AV_MULTICAST_GROUP is not a multicast address");
            }
        }
        if let Ok(value) = env::var("GRAFTON_AV_MULTICAST") {
            config.multicast_enabled = !matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "off" | "no"
            );
        }
        if let Some(threads) = env_parse::<usize>("GRAFTON_AV_WORKER_THREADS") {
            config.worker_threads = threads;
        }

        config
    }

    #[must_use]
    pub fn discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = port;
        self
    }

    #[must_use]
    pub fn multicast_group(mut self, group: Ipv4Addr) -> Self {
        self.multicast_group = group;
        self
    }

    /// Enable or disable multicast announcements. Unicast peers and
    /// in-process registration keep working either way.
    #[must_use]
    pub fn multicast(mut self, enabled: bool) -> Self {
        self.multicast_enabled = enabled;
        self
    }

    #[must_use]
    pub fn announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval = interval;
        self
    }

    /// How long a remote source stays listed without being re-announced.
    #[must_use]
    pub fn source_ttl(mut self, ttl: Duration) -> Self {
        self.source_ttl = ttl;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    #[must_use]
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    #[must_use]
    pub fn audio_queue_depth(mut self, depth: usize) -> Self {
        self.audio_queue_depth = depth;
        self
    }

    #[must_use]
    pub fn metadata_queue_depth(mut self, depth: usize) -> Self {
        self.metadata_queue_depth = depth;
        self
    }

    #[must_use]
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(Error::InvalidConfiguration(
                "worker_threads must be at least 1".into(),
            ));
        }
        if self.audio_queue_depth == 0 || self.metadata_queue_depth == 0 {
            return Err(Error::InvalidConfiguration(
                "queue depths must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("announce_interval", self.announce_interval),
            ("connect_timeout", self.connect_timeout),
            ("ping_interval", self.ping_interval),
        ] {
            if value.is_zero() {
                return Err(Error::InvalidConfiguration(format!(
                    "{name} must be non-zero"
                )));
            }
        }
        if self.source_ttl <= self.announce_interval {
            return Err(Error::InvalidConfiguration(format!(
                "source_ttl ({:?}) must be longer than announce_interval ({:?})",
                self.source_ttl, self.announce_interval
            )));
        }
        if !self.multicast_group.is_multicast() {
            return Err(Error::InvalidConfiguration(format!(
                "{} is not a multicast address",
                self.multicast_group
            )));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = env::var(key).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %value, "ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_list_matches_joined_string() {
        let literal = StringList::from("a,b");
        let list = StringList::from(vec!["a", "b"]);
        assert_eq!(literal.join(), list.join());
        assert_eq!(list.normalize().as_deref(), Some("a,b"));
    }

    #[test]
    fn test_blank_lists_normalize_to_none() {
        assert_eq!(StringList::from("").normalize(), None);
        assert_eq!(StringList::from(" , ").normalize(), None);
        assert_eq!(StringList::Many(vec![]).normalize(), None);
    }

    #[test]
    fn test_split_list_trims_entries() {
        let items: Vec<_> = split_list(" studio , ,news").collect();
        assert_eq!(items, vec!["studio", "news"]);
    }

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().expect("defaults should validate");
    }

    #[test]
    fn test_validate_rejects_short_ttl() {
        let config = Config::default()
            .announce_interval(Duration::from_secs(2))
            .source_ttl(Duration::from_secs(1));
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_depth() {
        let config = Config::default().audio_queue_depth(0);
        assert!(config.validate().is_err());
        let config = Config::default().worker_threads(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unicast_group() {
        let config = Config::default().multicast_group(Ipv4Addr::new(10, 0, 0, 1));
        assert!(config.validate().is_err());
    }
}
