// src/core/protocol/proxy_header.rs

//! Proxy-protocol v1 (text) and v2 (binary) prelude handling.
//!
//! A listener may be configured to accept a proxy-protocol header from
//! trusted load balancers; the header carries the real client address.
//! Acceptance is gated by a configured allowed-networks list. The preparser
//! distinguishes the three framings purely by inspecting at most the first
//! 16 bytes, so garbage can be rejected without buffering.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use ipnet::IpNet;

use crate::core::SqlGateError;

/// The 12-byte binary signature.
pub const BINARY_SIG: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Maximum length of the text form.
pub const MAX_TEXT_LEN: usize = 107;

/// Outcome of inspecting the first bytes of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreParseResult {
    /// Not enough bytes to decide yet.
    Incomplete,
    /// A complete text header of this many bytes (terminator included).
    Text(usize),
    /// A complete binary header of this many bytes.
    Binary(usize),
    /// The bytes cannot begin a proxy-protocol header.
    Error,
}

/// Classifies the start of `data` as a proxy-protocol header.
pub fn preparse(data: &[u8]) -> PreParseResult {
    const TEXT_PREFIX: &[u8] = b"PROXY ";

    // Binary signature first: it is fixed-length and unambiguous.
    let sig_check = data.len().min(BINARY_SIG.len());
    if data[..sig_check] == BINARY_SIG[..sig_check] {
        if data.len() < 16 {
            return PreParseResult::Incomplete;
        }
        let len = u16::from_be_bytes([data[14], data[15]]) as usize;
        return PreParseResult::Binary(16 + len);
    }

    let prefix_check = data.len().min(TEXT_PREFIX.len());
    if data[..prefix_check] == TEXT_PREFIX[..prefix_check] {
        if data.len() < TEXT_PREFIX.len() {
            return PreParseResult::Incomplete;
        }
        let window = &data[..data.len().min(MAX_TEXT_LEN)];
        if let Some(pos) = window.windows(2).position(|w| w == b"\r\n") {
            return PreParseResult::Text(pos + 2);
        }
        if data.len() >= MAX_TEXT_LEN {
            return PreParseResult::Error;
        }
        return PreParseResult::Incomplete;
    }

    PreParseResult::Error
}

/// A parsed proxy-protocol header. `addresses` is `None` for the UNKNOWN /
/// LOCAL forms, in which case the real peer address stays in effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    pub addresses: Option<(SocketAddr, SocketAddr)>,
}

/// Parses a complete text header (`PROXY TCP4 ...\r\n`).
pub fn parse_text_header(header: &[u8]) -> Result<ProxyHeader, SqlGateError> {
    let text = std::str::from_utf8(header)
        .map_err(|_| SqlGateError::Protocol("proxy header is not ASCII".into()))?;
    let text = text
        .strip_suffix("\r\n")
        .ok_or_else(|| SqlGateError::Protocol("proxy header missing terminator".into()))?;
    let mut parts = text.split(' ');
    if parts.next() != Some("PROXY") {
        return Err(SqlGateError::Protocol("not a proxy header".into()));
    }
    let family = parts
        .next()
        .ok_or_else(|| SqlGateError::Protocol("proxy header missing family".into()))?;
    match family {
        "UNKNOWN" => Ok(ProxyHeader { addresses: None }),
        "TCP4" | "TCP6" => {
            let fields: Vec<&str> = parts.collect();
            if fields.len() != 4 {
                return Err(SqlGateError::Protocol("malformed proxy header".into()));
            }
            let src_ip = IpAddr::from_str(fields[0])?;
            let dst_ip = IpAddr::from_str(fields[1])?;
            let want_v4 = family == "TCP4";
            if src_ip.is_ipv4() != want_v4 || dst_ip.is_ipv4() != want_v4 {
                return Err(SqlGateError::Protocol(
                    "proxy header family/address mismatch".into(),
                ));
            }
            let src_port: u16 = fields[2]
                .parse()
                .map_err(|_| SqlGateError::Protocol("bad proxy source port".into()))?;
            let dst_port: u16 = fields[3]
                .parse()
                .map_err(|_| SqlGateError::Protocol("bad proxy destination port".into()))?;
            Ok(ProxyHeader {
                addresses: Some((
                    SocketAddr::new(src_ip, src_port),
                    SocketAddr::new(dst_ip, dst_port),
                )),
            })
        }
        other => Err(SqlGateError::Protocol(format!(
            "unknown proxy header family '{other}'"
        ))),
    }
}

/// Parses a complete binary header (signature included).
pub fn parse_binary_header(header: &[u8]) -> Result<ProxyHeader, SqlGateError> {
    if header.len() < 16 || header[..12] != BINARY_SIG {
        return Err(SqlGateError::Protocol("bad binary proxy header".into()));
    }
    let ver_cmd = header[12];
    if ver_cmd >> 4 != 0x2 {
        return Err(SqlGateError::Protocol("bad proxy protocol version".into()));
    }
    let fam_proto = header[13];
    let len = u16::from_be_bytes([header[14], header[15]]) as usize;
    let addrs = header
        .get(16..16 + len)
        .ok_or(SqlGateError::Underflow)?;

    // LOCAL command: connection from the balancer itself, no address block.
    if ver_cmd & 0x0F == 0 {
        return Ok(ProxyHeader { addresses: None });
    }

    match fam_proto >> 4 {
        0x1 => {
            if addrs.len() < 12 {
                return Err(SqlGateError::Underflow);
            }
            let src = Ipv4Addr::new(addrs[0], addrs[1], addrs[2], addrs[3]);
            let dst = Ipv4Addr::new(addrs[4], addrs[5], addrs[6], addrs[7]);
            let src_port = u16::from_be_bytes([addrs[8], addrs[9]]);
            let dst_port = u16::from_be_bytes([addrs[10], addrs[11]]);
            Ok(ProxyHeader {
                addresses: Some((
                    SocketAddr::new(IpAddr::V4(src), src_port),
                    SocketAddr::new(IpAddr::V4(dst), dst_port),
                )),
            })
        }
        0x2 => {
            if addrs.len() < 36 {
                return Err(SqlGateError::Underflow);
            }
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&addrs[..16]);
            dst.copy_from_slice(&addrs[16..32]);
            let src_port = u16::from_be_bytes([addrs[32], addrs[33]]);
            let dst_port = u16::from_be_bytes([addrs[34], addrs[35]]);
            Ok(ProxyHeader {
                addresses: Some((
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), src_port),
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), dst_port),
                )),
            })
        }
        0x0 => Ok(ProxyHeader { addresses: None }),
        other => Err(SqlGateError::Protocol(format!(
            "unsupported proxy address family {other:#x}"
        ))),
    }
}

/// The configured set of networks allowed to send a proxy header.
#[derive(Debug, Clone, Default)]
pub struct AllowedNetworks {
    any: bool,
    nets: Vec<IpNet>,
}

impl AllowedNetworks {
    /// Parses a comma-separated list of CIDR networks, plain addresses and
    /// the `*` wildcard.
    pub fn parse(setting: &str) -> Result<AllowedNetworks, SqlGateError> {
        let mut out = AllowedNetworks::default();
        for token in setting.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if token == "*" {
                out.any = true;
                continue;
            }
            let net = if token.contains('/') {
                IpNet::from_str(token)
                    .map_err(|_| SqlGateError::Config(format!("bad proxy network '{token}'")))
            } else {
                IpAddr::from_str(token)
                    .map(IpNet::from)
                    .map_err(|_| SqlGateError::Config(format!("bad proxy network '{token}'")))
            }?;
            out.nets.push(net);
        }
        if !out.any && out.nets.is_empty() {
            return Err(SqlGateError::Config(
                "proxy networks setting is empty".into(),
            ));
        }
        Ok(out)
    }

    pub fn is_allowed(&self, addr: IpAddr) -> bool {
        self.any || self.nets.iter().any(|n| n.contains(&addr))
    }
}
