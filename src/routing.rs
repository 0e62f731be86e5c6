//! Routing proxies: advertised sources that forward another source.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    config::StringList,
    discovery::{Announcement, EntryKind},
    finder::{Source, SourceAddress},
    frames::Tally,
    receiver::{resolve_source, Bandwidth, ColorFormat},
    transport::{
        codec::{Hello, RawMessage, PROTOCOL_VERSION},
        InboundLink, LinkSink, OutboundHub,
    },
    Error, Result, Runtime,
};

const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct RoutingOptions {
    pub name: String,
    pub groups: Option<String>,
}

impl RoutingOptions {
    /// Create a builder for configuring routing options
    pub fn builder<S: Into<String>>(name: S) -> RoutingOptionsBuilder {
        RoutingOptionsBuilder::new(name)
    }
}

/// Builder for configuring RoutingOptions with ergonomic method chaining
#[derive(Debug, Clone)]
pub struct RoutingOptionsBuilder {
    name: String,
    groups: Option<StringList>,
}

impl RoutingOptionsBuilder {
    /// Create a new builder with the specified name
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            groups: None,
        }
    }

    /// Set the groups the proxy is advertised in
    #[must_use]
    pub fn groups(mut self, groups: impl Into<StringList>) -> Self {
        self.groups = Some(groups.into());
        self
    }

    /// Build the `RoutingOptions`
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or contains only whitespace.
    pub fn build(self) -> Result<RoutingOptions> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfiguration(
                "Routing name cannot be empty or contain only whitespace".into(),
            ));
        }
        Ok(RoutingOptions {
            name: self.name,
            groups: self.groups.as_ref().and_then(StringList::normalize),
        })
    }
}

/// The bound upstream source and the link reading from it.
struct Upstream {
    source: Source,
    link: InboundLink,
}

/// Forwards whatever one upstream link reads, as long as that link is
/// still the current binding.
struct ForwardSink {
    hub: Arc<OutboundHub>,
    generation: u64,
    active: Arc<AtomicU64>,
}

impl ForwardSink {
    fn is_current(&self) -> bool {
        self.active.load(Ordering::Acquire) == self.generation
    }
}

impl LinkSink for ForwardSink {
    fn connected(&self, source_name: &str) {
        if self.is_current() {
            tracing::debug!(source = %source_name, generation = self.generation, "upstream connected");
        }
    }

    fn message(&self, raw: RawMessage) {
        if self.is_current() {
            self.hub.broadcast(raw);
        }
    }

    fn disconnected(&self, error: Error) {
        if self.is_current() {
            tracing::warn!(error = %error, generation = self.generation, "upstream lost");
        }
    }
}

/// A named source whose content comes from another source.
///
/// Receivers connect to the proxy like to any sender. [`change`](Self::change)
/// rebinds the upstream without disconnecting them: they see a short gap in
/// frames and then the new source. Frames are forwarded as received, without
/// decoding. The combined tally of the proxy's receivers is passed on to the
/// current upstream.
///
/// # Examples
///
/// ```no_run
/// # use grafton_av::{Runtime, RoutingOptions, RoutingProxy, Source};
/// # fn run() -> Result<(), grafton_av::Error> {
/// let runtime = Runtime::new()?;
/// let proxy = RoutingProxy::new(&runtime, &RoutingOptions::builder("Program").build()?)?;
///
/// let generation = proxy.change(&Source::named("CAMERA1 (Main)"))?;
/// assert_eq!(proxy.generation(), generation);
/// # Ok(())
/// # }
/// ```
pub struct RoutingProxy {
    runtime: Runtime,
    name: String,
    hub: Arc<OutboundHub>,
    announcement: Mutex<Option<Announcement>>,
    upstream: Arc<Mutex<Option<Upstream>>>,
    generation: AtomicU64,
    active: Arc<AtomicU64>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl RoutingProxy {
    /// Advertises the proxy as `"<HOSTNAME> (<name>)"` with no upstream.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfiguration`] if this process already advertises
    /// the name, [`Error::Io`] if no listening socket could be opened.
    pub fn new(runtime: &Runtime, options: &RoutingOptions) -> Result<Self> {
        let discovery = runtime.discovery();
        let name = discovery.advertised_name(&options.name);
        let hub = Arc::new(OutboundHub::bind(
            runtime.handle(),
            runtime.config(),
            &name,
        )?);
        let announcement = discovery.advertise(
            EntryKind::Source,
            &name,
            options.groups.as_deref(),
            hub.port(),
        )?;

        let upstream = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();
        runtime.handle().spawn(forward_tally(
            hub.subscribe_tally(),
            upstream.clone(),
            cancel.clone(),
        ));

        tracing::info!(proxy = %name, port = hub.port(), "routing proxy created");
        Ok(Self {
            runtime: runtime.clone(),
            name,
            hub,
            announcement: Mutex::new(Some(announcement)),
            upstream,
            generation: AtomicU64::new(0),
            active: Arc::new(AtomicU64::new(0)),
            cancel,
            closed: AtomicBool::new(false),
        })
    }

    /// Routes `source` to every receiver of the proxy, replacing the previous
    /// upstream. Returns the new generation, which is higher than any
    /// generation returned before.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfiguration`] if the source cannot be resolved or
    /// is the proxy itself, [`Error::Closed`] after
    /// [`destroy`](Self::destroy).
    pub fn change(&self, source: &Source) -> Result<u64> {
        self.ensure_open()?;
        let addr = resolve_source(&self.runtime, source)?;
        if self.is_self(source, addr) {
            return Err(Error::InvalidConfiguration(format!(
                "Routing '{}' to itself",
                self.name
            )));
        }

        let hello = Hello {
            version: PROTOCOL_VERSION,
            receiver_name: self.name.clone(),
            color_format: ColorFormat::Fastest.into(),
            bandwidth: Bandwidth::Highest.into(),
            allow_video_fields: true,
        };

        let mut upstream = self.upstream.lock();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.active.store(generation, Ordering::Release);
        let sink = Arc::new(ForwardSink {
            hub: self.hub.clone(),
            generation,
            active: self.active.clone(),
        });
        let link = InboundLink::open(
            self.runtime.handle(),
            self.runtime.config(),
            addr,
            hello,
            sink,
        );
        let tally = self.hub.tally();
        if tally != Tally::default() {
            link.send_metadata(tally.to_metadata());
        }

        let previous = upstream.replace(Upstream {
            source: source.clone(),
            link,
        });
        drop(upstream);
        if let Some(previous) = previous {
            previous.link.close();
        }

        tracing::info!(proxy = %self.name, upstream = %source, %addr, generation, "route changed");
        Ok(generation)
    }

    /// Detaches the upstream. The proxy stays advertised but sends nothing.
    /// Returns whether an upstream was bound.
    pub fn clear(&self) -> bool {
        let previous = {
            let mut upstream = self.upstream.lock();
            self.active.store(0, Ordering::Release);
            upstream.take()
        };
        match previous {
            Some(previous) => {
                previous.link.close();
                tracing::info!(proxy = %self.name, upstream = %previous.source, "route cleared");
                true
            }
            None => false,
        }
    }

    /// Number of receivers connected to the proxy.
    pub fn connections(&self) -> usize {
        self.hub.connections()
    }

    /// Waits up to `timeout` for at least one receiver.
    pub async fn wait_for_connections(&self, timeout: Duration) -> bool {
        self.hub.wait_for_connections(timeout).await
    }

    /// Name of the bound upstream source, or an empty string.
    pub fn sourcename(&self) -> String {
        match &*self.upstream.lock() {
            Some(upstream) if !upstream.source.name.is_empty() => upstream.source.name.clone(),
            Some(upstream) => upstream.link.source_name().unwrap_or_default(),
            None => String::new(),
        }
    }

    /// The bound upstream source.
    pub fn upstream(&self) -> Option<Source> {
        self.upstream
            .lock()
            .as_ref()
            .map(|upstream| upstream.source.clone())
    }

    /// Whether the current upstream link has completed its handshake.
    pub fn is_upstream_connected(&self) -> bool {
        self.upstream
            .lock()
            .as_ref()
            .is_some_and(|upstream| upstream.link.is_connected())
    }

    /// Generation of the last successful [`change`](Self::change); 0 before
    /// the first.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// The proxy as a source receivers can connect to.
    pub fn source(&self) -> Source {
        Source {
            name: self.name.clone(),
            address: SourceAddress::Ip(format!("{}:{}", Ipv4Addr::LOCALHOST, self.hub.port())),
        }
    }

    /// Withdraws the proxy, detaches the upstream and disconnects every
    /// receiver. Calling it again does nothing.
    pub async fn destroy(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.announcement.lock().take();
        self.cancel.cancel();
        self.clear();
        self.hub.shutdown(CLOSE_GRACE).await;
        tracing::info!(proxy = %self.name, "routing proxy destroyed");
    }

    fn is_self(&self, source: &Source, addr: SocketAddr) -> bool {
        source.name == self.name
            || (addr.port() == self.hub.port() && self.runtime.discovery().is_local_ip(addr.ip()))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed("routing proxy"))
        } else {
            Ok(())
        }
    }
}

impl Drop for RoutingProxy {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.announcement.get_mut().take();
        self.cancel.cancel();
        self.active.store(0, Ordering::Release);
        if let Some(upstream) = self.upstream.lock().take() {
            upstream.link.close();
        }
        self.hub.abort();
    }
}

/// Passes the receivers' combined tally on to whichever upstream is bound.
async fn forward_tally(
    mut tally: watch::Receiver<Tally>,
    upstream: Arc<Mutex<Option<Upstream>>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = tally.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let current = *tally.borrow_and_update();
        if let Some(upstream) = &*upstream.lock() {
            upstream.link.send_metadata(current.to_metadata());
        }
    }
}
