//! Discovery datagrams.
//!
//! ```text
//! GAVD | version u8 | type u8 | instance u64 | body
//! ```
//!
//! Strings are UTF-8 with a `u16` big-endian length prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::registry::EntryKind;
use crate::{Error, Result};

const MAGIC: &[u8; 4] = b"GAVD";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 14;

/// Largest datagram we build or accept.
pub(crate) const MAX_DATAGRAM: usize = 1400;

const TYPE_ANNOUNCE: u8 = 1;
const TYPE_WITHDRAW: u8 = 2;
const TYPE_QUERY: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Packet {
    Announce {
        instance: u64,
        kind: EntryKind,
        name: String,
        groups: String,
        port: u16,
    },
    Withdraw {
        instance: u64,
        kind: EntryKind,
        name: String,
    },
    Query {
        instance: u64,
    },
}

impl Packet {
    pub(crate) fn instance(&self) -> u64 {
        match self {
            Packet::Announce { instance, .. }
            | Packet::Withdraw { instance, .. }
            | Packet::Query { instance } => *instance,
        }
    }

    pub(crate) fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_slice(MAGIC);
        buf.put_u8(VERSION);
        match self {
            Packet::Announce {
                instance,
                kind,
                name,
                groups,
                port,
            } => {
                buf.put_u8(TYPE_ANNOUNCE);
                buf.put_u64(*instance);
                buf.put_u8((*kind).into());
                buf.put_u16(*port);
                put_str(&mut buf, name)?;
                put_str(&mut buf, groups)?;
            }
            Packet::Withdraw {
                instance,
                kind,
                name,
            } => {
                buf.put_u8(TYPE_WITHDRAW);
                buf.put_u64(*instance);
                buf.put_u8((*kind).into());
                put_str(&mut buf, name)?;
            }
            Packet::Query { instance } => {
                buf.put_u8(TYPE_QUERY);
                buf.put_u64(*instance);
            }
        }
        if buf.len() > MAX_DATAGRAM {
            return Err(Error::InvalidConfiguration(format!(
                "Discovery record of {} bytes exceeds {MAX_DATAGRAM} bytes",
                buf.len()
            )));
        }
        Ok(buf.freeze())
    }

    pub(crate) fn decode(datagram: &[u8]) -> Result<Packet> {
        if datagram.len() < HEADER_LEN || &datagram[..4] != MAGIC {
            return Err(Error::Transport("Not a discovery datagram".into()));
        }
        let mut buf = &datagram[4..];
        let version = buf.get_u8();
        if version != VERSION {
            return Err(Error::Transport(format!(
                "Unsupported discovery version {version}"
            )));
        }
        let packet_type = buf.get_u8();
        let instance = buf.get_u64();
        match packet_type {
            TYPE_ANNOUNCE => {
                if buf.remaining() < 3 {
                    return Err(truncated());
                }
                let kind = get_kind(&mut buf)?;
                let port = buf.get_u16();
                let name = get_str(&mut buf)?;
                let groups = get_str(&mut buf)?;
                if name.is_empty() || port == 0 {
                    return Err(Error::Transport("Announcement without name or port".into()));
                }
                Ok(Packet::Announce {
                    instance,
                    kind,
                    name,
                    groups,
                    port,
                })
            }
            TYPE_WITHDRAW => Ok(Packet::Withdraw {
                instance,
                kind: get_kind(&mut buf)?,
                name: get_str(&mut buf)?,
            }),
            TYPE_QUERY => Ok(Packet::Query { instance }),
            other => Err(Error::Transport(format!(
                "Unknown discovery packet type {other}"
            ))),
        }
    }
}

fn truncated() -> Error {
    Error::Transport("Truncated discovery datagram".into())
}

fn get_kind(buf: &mut &[u8]) -> Result<EntryKind> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    EntryKind::try_from(buf.get_u8())
        .map_err(|e| Error::Transport(format!("Unknown entry kind {}", e.number)))
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| Error::InvalidConfiguration(format!("'{s}' is too long to announce")))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|e| Error::Transport(format!("Invalid UTF-8 in discovery datagram: {e}")))?
        .to_owned();
    buf.advance(len);
    Ok(s)
}
