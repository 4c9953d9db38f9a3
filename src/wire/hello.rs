//! UDP hello messages, used for discovery and as liveness pings. They are also exchanged as the
//!  first thing on every new TCP data connection to identify the peer.
//!
//! There are two wire versions, distinguished by the leading version field. Both are decoded
//!  into the same [Hello] struct.
//!
//! Version 1 (128 bytes):
//! ```ascii
//!   0: version (u16)
//!   2: class (u16)
//!   4: kind (u16)
//!   6: TCP port (u16)
//!   8: destination address (cip, 20 bytes)
//!  28: name (100 bytes, NUL padded), decorated as `V<supported version>:<name><<unique ip>:<port>>`
//! ```
//!
//! Version 2 (180 bytes):
//! ```ascii
//!   0: version (u16)
//!   2: supported version (u16)
//!   4: class (u16)
//!   6: kind (u16)
//!   8: TCP port (u16)
//!  10: destination address (cip, 20 bytes)
//!  30: unique address (cip, 20 bytes)
//!  50: requested number of connections per path (u16)
//!  52: name (128 bytes, NUL padded)
//! ```
//!
//! A `cip` is a combined-family address: family (u16, 2 for IPv4), port (u16) and 16 address
//!  bytes of which IPv4 uses the first four.
//!
//! Any other version is rejected: a node that speaks a newer protocol still announces itself
//!  with a version 2 hello and negotiates up from there (see `supported version`).

use std::net::Ipv4Addr;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::error::TransportError;
use crate::wire::data_header::{CURRENT_PROTOCOL_VERSION, PROTOCOL_VERSION_1, PROTOCOL_VERSION_2};

pub const CIP_LEN: usize = 20;
pub const NAME_LEN_V1: usize = 100;
pub const NAME_LEN_V2: usize = 128;

const AF_UNSPEC: u16 = 0;
const AF_INET: u16 = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum HelloKind {
    Join = 1,
    Drop = 2,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Hello {
    /// the wire version this hello is (or will be) encoded with
    pub version: u16,
    pub supported_version: u16,
    pub class: u16,
    pub kind: HelloKind,
    pub port: u16,
    /// the address the sender believes it is sending to
    pub dest_ip: Ipv4Addr,
    /// `None` for a version 1 hello without decoration - the receiver falls back to the
    ///  sender's address
    pub unique_ip: Option<Ipv4Addr>,
    pub nconn: u16,
    pub name: String,
}

impl Hello {
    pub const SERIALIZED_LEN_V1: usize = 8 + CIP_LEN + NAME_LEN_V1;
    pub const SERIALIZED_LEN_V2: usize = 10 + 2 * CIP_LEN + 2 + NAME_LEN_V2;

    pub fn serialized_len(version: u16) -> usize {
        if version >= PROTOCOL_VERSION_2 {
            Self::SERIALIZED_LEN_V2
        }
        else {
            Self::SERIALIZED_LEN_V1
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        if self.version >= PROTOCOL_VERSION_2 {
            buf.put_u16(self.version);
            buf.put_u16(self.supported_version);
            buf.put_u16(self.class);
            buf.put_u16(self.kind.into());
            buf.put_u16(self.port);
            put_cip(buf, Some(self.dest_ip));
            put_cip(buf, self.unique_ip);
            buf.put_u16(self.nconn);
            put_name(buf, &self.name, NAME_LEN_V2);
        }
        else {
            buf.put_u16(PROTOCOL_VERSION_1);
            buf.put_u16(self.class);
            buf.put_u16(self.kind.into());
            buf.put_u16(self.port);
            put_cip(buf, Some(self.dest_ip));
            let decorated = match self.unique_ip {
                Some(uip) => format!("V{}:{}<{}:{}>", self.supported_version, self.name, uip, self.port),
                None => self.name.clone(),
            };
            put_name(buf, &decorated, NAME_LEN_V1);
        }
    }

    /// Reads the leading version field and dispatches to the version specific decoder
    pub fn deser(buf: &mut impl Buf) -> Result<Hello, TransportError> {
        if buf.remaining() < 2 {
            return Err(TransportError::Truncated { expected: 2, got: buf.remaining() });
        }
        let version = buf.get_u16();
        match version {
            PROTOCOL_VERSION_1 => Self::deser_v1(buf),
            PROTOCOL_VERSION_2 => Self::deser_v2(buf),
            v => Err(TransportError::BadVersion { got: v, supported: CURRENT_PROTOCOL_VERSION }),
        }
    }

    fn deser_v1(buf: &mut impl Buf) -> Result<Hello, TransportError> {
        check_remaining(buf, Self::SERIALIZED_LEN_V1 - 2)?;

        let class = buf.get_u16();
        let kind = get_kind(buf)?;
        let port = buf.get_u16();
        let dest_ip = get_cip(buf)?.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let raw_name = get_name(buf, NAME_LEN_V1)?;

        let (supported_version, name, unique_ip) = match parse_decorated_name(&raw_name) {
            Some((supported_version, name, unique_ip)) => (supported_version, name, Some(unique_ip)),
            None => (PROTOCOL_VERSION_1, raw_name, None),
        };

        Ok(Hello {
            version: PROTOCOL_VERSION_1,
            supported_version,
            class,
            kind,
            port,
            dest_ip,
            unique_ip,
            nconn: 1,
            name,
        })
    }

    fn deser_v2(buf: &mut impl Buf) -> Result<Hello, TransportError> {
        check_remaining(buf, Self::SERIALIZED_LEN_V2 - 2)?;

        let supported_version = buf.get_u16();
        let class = buf.get_u16();
        let kind = get_kind(buf)?;
        let port = buf.get_u16();
        let dest_ip = get_cip(buf)?.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let unique_ip = get_cip(buf)?;
        let nconn = buf.get_u16();
        let name = get_name(buf, NAME_LEN_V2)?;

        Ok(Hello {
            version: PROTOCOL_VERSION_2,
            supported_version,
            class,
            kind,
            port,
            dest_ip,
            unique_ip,
            nconn,
            name,
        })
    }
}

/// The hello exchanged at the start of a TCP data connection. From version 2 on it carries the
///  sender's process generation, which changes when a node restarts with the same identity, and
///  the sender's session epoch towards the recipient, which changes when the sender discarded
///  its message state for the recipient (after declaring it dead).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectHello {
    pub hello: Hello,
    /// 0 if unknown
    pub generation: u64,
    pub epoch: u64,
}

impl ConnectHello {
    pub fn serialized_len(version: u16) -> usize {
        if version >= PROTOCOL_VERSION_2 {
            Hello::SERIALIZED_LEN_V2 + 16
        }
        else {
            Hello::SERIALIZED_LEN_V1
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.hello.ser(buf);
        if self.hello.version >= PROTOCOL_VERSION_2 {
            buf.put_u64(self.generation);
            buf.put_u64(self.epoch);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> Result<ConnectHello, TransportError> {
        let hello = Hello::deser(buf)?;
        let (generation, epoch) = if hello.version >= PROTOCOL_VERSION_2 {
            check_remaining(buf, 16)?;
            (buf.get_u64(), buf.get_u64())
        }
        else {
            (0, 0)
        };
        Ok(ConnectHello { hello, generation, epoch })
    }
}

fn check_remaining(buf: &impl Buf, expected: usize) -> Result<(), TransportError> {
    if buf.remaining() < expected {
        return Err(TransportError::Truncated { expected, got: buf.remaining() });
    }
    Ok(())
}

fn get_kind(buf: &mut impl Buf) -> Result<HelloKind, TransportError> {
    let raw = buf.get_u16();
    HelloKind::try_from(raw)
        .map_err(|_| TransportError::Protocol(format!("invalid hello kind {}", raw)))
}

fn put_cip(buf: &mut BytesMut, ip: Option<Ipv4Addr>) {
    match ip {
        Some(ip) => {
            buf.put_u16(AF_INET);
            buf.put_u16(0);
            buf.put_slice(&ip.octets());
            buf.put_bytes(0, 12);
        }
        None => {
            buf.put_u16(AF_UNSPEC);
            buf.put_bytes(0, CIP_LEN - 2);
        }
    }
}

fn get_cip(buf: &mut impl Buf) -> Result<Option<Ipv4Addr>, TransportError> {
    let family = buf.get_u16();
    let _port = buf.get_u16();
    let mut addr = [0u8; 16];
    buf.copy_to_slice(&mut addr);

    match family {
        AF_UNSPEC => Ok(None),
        AF_INET => Ok(Some(Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]))),
        f => Err(TransportError::Protocol(format!("unsupported address family {}", f))),
    }
}

/// writes the name NUL-padded, truncating it if necessary to leave room for at least one NUL
fn put_name(buf: &mut BytesMut, name: &str, len: usize) {
    let mut end = name.len().min(len - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    buf.put_slice(&name.as_bytes()[..end]);
    buf.put_bytes(0, len - end);
}

fn get_name(buf: &mut impl Buf, len: usize) -> Result<String, TransportError> {
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    let used = raw.iter()
        .position(|&b| b == 0)
        .unwrap_or(len);
    raw.truncate(used);
    String::from_utf8(raw)
        .map_err(|_| TransportError::Protocol("hello name is not valid UTF-8".to_string()))
}

/// parses `V<n>:<name><<ip>:<port>>`
fn parse_decorated_name(raw: &str) -> Option<(u16, String, Ipv4Addr)> {
    let rest = raw.strip_prefix('V')?;
    let (version, rest) = rest.split_once(':')?;
    let supported_version = version.parse::<u16>().ok()?;

    let rest = rest.strip_suffix('>')?;
    let (name, addr) = rest.rsplit_once('<')?;
    let (ip, port) = addr.rsplit_once(':')?;
    let unique_ip = ip.parse::<Ipv4Addr>().ok()?;
    port.parse::<u16>().ok()?;

    Some((supported_version, name.to_string(), unique_ip))
}
