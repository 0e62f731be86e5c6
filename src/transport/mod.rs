//! Connection plumbing shared by senders, receivers and routing proxies.
//!
//! A sender owns an [`OutboundHub`]: a listener plus one writer per
//! connected receiver. A receiver (or a routing proxy's upstream side) owns
//! an [`InboundLink`]: a single connection it reads frames from.

pub(crate) mod codec;
mod inbound;
mod outbound;
pub(crate) mod queue;

pub(crate) use inbound::{InboundLink, LinkSink};
pub(crate) use outbound::OutboundHub;
