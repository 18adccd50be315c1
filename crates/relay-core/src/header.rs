//! Binary tunnel header: the preamble each session sends once, identifying
//! the caller and the requested destination.
//!
//! Wire format, first message of the stream:
//!
//! ```text
//! version:u8 | identity:16 | optlen:u8 | options:optlen | command:u8 |
//! port:u16(BE) | addrtype:u8 | address:(4 | 1+N | 16) | payload:rest
//! ```
//!
//! Address types: 1 = IPv4, 2 = domain (1-byte length prefix + UTF-8),
//! 3 = IPv6 (eight big-endian u16 groups). The option block is skipped
//! unparsed; the version byte is recorded but not validated.

use crate::error::{TunnelError, TunnelResult};
use std::fmt;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Fewest bytes a complete header can occupy (single-byte domain, no
/// options). Parsing is not attempted below this.
pub const MIN_HEADER_LEN: usize = 24;

/// Requested transport for the tunneled payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Tcp,
    Udp,
}

impl TryFrom<u8> for Command {
    type Error = TunnelError;

    fn try_from(value: u8) -> TunnelResult<Self> {
        match value {
            1 => Ok(Command::Tcp),
            2 => Ok(Command::Udp),
            other => Err(TunnelError::UnsupportedCommand(other)),
        }
    }
}

/// Target address, typed by the wire address-type byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Domain(String),
    /// Eight big-endian groups, rendered as colon-joined lowercase hex
    /// without zero compression.
    Ipv6([u16; 8]),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip) => write!(f, "{ip}"),
            TargetAddr::Domain(name) => f.write_str(name),
            TargetAddr::Ipv6(groups) => {
                for (i, group) in groups.iter().enumerate() {
                    if i > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{group:x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Parsed tunnel header. Constructed once from the first inbound bytes of
/// a session, immutable thereafter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHeader {
    pub version: u8,
    pub identity: Uuid,
    pub command: Command,
    pub port: u16,
    pub addr: TargetAddr,
}

impl TunnelHeader {
    /// Parse a header from the accumulated first bytes of a session.
    ///
    /// Returns the header and the offset where the payload starts.
    /// Declared lengths that overflow the buffer are an error — the
    /// caller has already waited for [`MIN_HEADER_LEN`] bytes and a
    /// well-formed client sends the whole header in its first chunk.
    pub fn parse(buf: &[u8]) -> TunnelResult<(Self, usize)> {
        if buf.len() < MIN_HEADER_LEN {
            return Err(TunnelError::TruncatedHeader {
                need: MIN_HEADER_LEN,
                have: buf.len(),
            });
        }

        let version = buf[0];
        let identity = Uuid::from_slice(&buf[1..17])
            .map_err(|e| TunnelError::MalformedHeader(e.to_string()))?;
        let opt_len = buf[17] as usize;

        // command + port + address type follow the option block
        let mut pos = 18 + opt_len;
        if buf.len() < pos + 4 {
            return Err(TunnelError::TruncatedHeader {
                need: pos + 4,
                have: buf.len(),
            });
        }
        let command = Command::try_from(buf[pos])?;
        let port = u16::from_be_bytes([buf[pos + 1], buf[pos + 2]]);
        let addr_type = buf[pos + 3];
        pos += 4;

        let addr = match addr_type {
            1 => {
                if buf.len() < pos + 4 {
                    return Err(TunnelError::TruncatedHeader {
                        need: pos + 4,
                        have: buf.len(),
                    });
                }
                let ip = Ipv4Addr::new(buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]);
                pos += 4;
                TargetAddr::Ipv4(ip)
            }
            2 => {
                let len = buf[pos] as usize;
                pos += 1;
                if len == 0 {
                    return Err(TunnelError::MalformedHeader("empty domain".to_string()));
                }
                if buf.len() < pos + len {
                    return Err(TunnelError::TruncatedHeader {
                        need: pos + len,
                        have: buf.len(),
                    });
                }
                let name = std::str::from_utf8(&buf[pos..pos + len])
                    .map_err(|e| TunnelError::MalformedHeader(format!("domain not utf-8: {e}")))?;
                pos += len;
                TargetAddr::Domain(name.to_string())
            }
            3 => {
                if buf.len() < pos + 16 {
                    return Err(TunnelError::TruncatedHeader {
                        need: pos + 16,
                        have: buf.len(),
                    });
                }
                let mut groups = [0u16; 8];
                for (i, group) in groups.iter_mut().enumerate() {
                    *group = u16::from_be_bytes([buf[pos + i * 2], buf[pos + i * 2 + 1]]);
                }
                pos += 16;
                TargetAddr::Ipv6(groups)
            }
            other => return Err(TunnelError::UnsupportedAddressType(other)),
        };

        Ok((
            Self {
                version,
                identity,
                command,
                port,
                addr,
            },
            pos,
        ))
    }

    /// Two-byte header prepended to the first response chunk of a session.
    pub fn response_header(&self) -> [u8; 2] {
        [self.version, 0]
    }

    /// `host:port` connect authority for the target (IPv6 bracketed).
    pub fn authority(&self) -> String {
        match &self.addr {
            TargetAddr::Ipv6(_) => format!("[{}]:{}", self.addr, self.port),
            _ => format!("{}:{}", self.addr, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_IDENTITY: Uuid = Uuid::from_bytes([
        0xd3, 0x42, 0xd1, 0x1e, 0xd4, 0x24, 0x4c, 0xd3, 0x9d, 0xe9, 0x9f, 0x07, 0xcd, 0x1d,
        0xf2, 0x17,
    ]);

    fn encode(
        version: u8,
        options: &[u8],
        command: u8,
        port: u16,
        addr_type: u8,
        addr: &[u8],
        payload: &[u8],
    ) -> Vec<u8> {
        let mut buf = vec![version];
        buf.extend_from_slice(TEST_IDENTITY.as_bytes());
        buf.push(options.len() as u8);
        buf.extend_from_slice(options);
        buf.push(command);
        buf.extend_from_slice(&port.to_be_bytes());
        buf.push(addr_type);
        buf.extend_from_slice(addr);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn undersized_input_never_parses() {
        for len in 0..MIN_HEADER_LEN {
            let buf = vec![0xab; len];
            assert!(
                matches!(
                    TunnelHeader::parse(&buf),
                    Err(TunnelError::TruncatedHeader { .. })
                ),
                "length {len} should be rejected as truncated"
            );
        }
    }

    #[test]
    fn parses_domain_header_with_payload() {
        let mut addr = vec![11u8];
        addr.extend_from_slice(b"example.com");
        let buf = encode(0, &[], 1, 443, 2, &addr, b"GET / ");

        let (header, offset) = TunnelHeader::parse(&buf).unwrap();
        assert_eq!(header.version, 0);
        assert_eq!(header.identity, TEST_IDENTITY);
        assert_eq!(header.command, Command::Tcp);
        assert_eq!(header.port, 443);
        assert_eq!(header.addr, TargetAddr::Domain("example.com".to_string()));
        assert_eq!(&buf[offset..], b"GET / ");
        assert_eq!(header.authority(), "example.com:443");
    }

    #[test]
    fn parses_ipv4_header() {
        let buf = encode(0, &[], 1, 80, 1, &[10, 0, 0, 1], &[]);
        let (header, offset) = TunnelHeader::parse(&buf).unwrap();
        assert_eq!(header.addr, TargetAddr::Ipv4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(header.authority(), "10.0.0.1:80");
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn ipv6_round_trips_to_canonical_groups() {
        let groups: [u16; 8] = [0x2606, 0x4700, 0, 0, 0, 0, 0, 0x6810];
        let mut addr = Vec::new();
        for group in groups {
            addr.extend_from_slice(&group.to_be_bytes());
        }
        let buf = encode(0, &[], 1, 443, 3, &addr, &[]);

        let (header, _) = TunnelHeader::parse(&buf).unwrap();
        assert_eq!(header.addr.to_string(), "2606:4700:0:0:0:0:0:6810");
        assert_eq!(header.authority(), "[2606:4700:0:0:0:0:0:6810]:443");
    }

    #[test]
    fn option_block_is_skipped() {
        let buf = encode(0, &[0xde, 0xad, 0xbe], 2, 53, 1, &[1, 1, 1, 1], b"q");
        let (header, offset) = TunnelHeader::parse(&buf).unwrap();
        assert_eq!(header.command, Command::Udp);
        assert_eq!(header.port, 53);
        assert_eq!(&buf[offset..], b"q");
    }

    #[test]
    fn version_byte_is_not_validated() {
        let buf = encode(7, &[], 1, 80, 1, &[127, 0, 0, 1], &[]);
        let (header, _) = TunnelHeader::parse(&buf).unwrap();
        assert_eq!(header.version, 7);
        assert_eq!(header.response_header(), [7, 0]);
    }

    #[test]
    fn rejects_unknown_command() {
        let buf = encode(0, &[], 5, 80, 1, &[127, 0, 0, 1], &[]);
        assert!(matches!(
            TunnelHeader::parse(&buf),
            Err(TunnelError::UnsupportedCommand(5))
        ));
    }

    #[test]
    fn rejects_unknown_address_type() {
        let buf = encode(0, &[], 1, 80, 4, &[0; 16], &[]);
        assert!(matches!(
            TunnelHeader::parse(&buf),
            Err(TunnelError::UnsupportedAddressType(4))
        ));
    }

    #[test]
    fn rejects_domain_length_overflowing_buffer() {
        // Claims a 200-byte domain but supplies 11 bytes.
        let mut addr = vec![200u8];
        addr.extend_from_slice(b"example.com");
        let buf = encode(0, &[], 1, 443, 2, &addr, &[]);
        assert!(matches!(
            TunnelHeader::parse(&buf),
            Err(TunnelError::TruncatedHeader { .. })
        ));
    }

    #[test]
    fn rejects_option_length_overflowing_buffer() {
        let mut buf = encode(0, &[], 1, 443, 1, &[127, 0, 0, 1], &[]);
        buf[17] = 250; // option block runs past the end
        assert!(matches!(
            TunnelHeader::parse(&buf),
            Err(TunnelError::TruncatedHeader { .. })
        ));
    }

    #[test]
    fn rejects_empty_domain() {
        let buf = encode(0, &[], 1, 443, 2, &[0, 0, 0], &[]);
        assert!(matches!(
            TunnelHeader::parse(&buf),
            Err(TunnelError::MalformedHeader(_))
        ));
    }
}
