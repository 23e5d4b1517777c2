//! SOCKS5 client-side wire format (RFC 1928), no-auth + CONNECT only.

use bytes::BufMut;
use num_enum::{FromPrimitive, IntoPrimitive};
use tokio_util::codec::Encoder;
use tunprobe_core::TargetHost;

use crate::{Error, InvalidTargetSnafu};

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
pub const CMD_CONNECT: u8 = 0x01;
pub const RESERVED: u8 = 0x00;

/// Smallest possible CONNECT reply: header + IPv4 bound address + port.
pub const MIN_REPLY_LEN: usize = 4 + 4 + 2;

#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
	IPv4   = 0x01,
	Domain = 0x03,
	IPv6   = 0x04,
	#[num_enum(catch_all)]
	Other(u8),
}

impl AddressType {
	/// Bytes following the address-type byte in a reply, bound port included.
	/// `domain_len` is only consulted for [`AddressType::Domain`]. Unknown types
	/// are sized like IPv4 since the bound address is never interpreted.
	pub fn remaining_len(self, domain_len: u8) -> usize {
		match self {
			AddressType::IPv4 | AddressType::Other(_) => 4 + 2,
			AddressType::IPv6 => 16 + 2,
			AddressType::Domain => 1 + domain_len as usize + 2,
		}
	}
}

#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
	Succeeded               = 0x00,
	GeneralFailure          = 0x01,
	NotAllowed              = 0x02,
	NetworkUnreachable      = 0x03,
	HostUnreachable         = 0x04,
	ConnectionRefused       = 0x05,
	TtlExpired              = 0x06,
	CommandNotSupported     = 0x07,
	AddressTypeNotSupported = 0x08,
	#[num_enum(catch_all)]
	Unassigned(u8),
}

impl std::fmt::Display for ReplyCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let text = match self {
			ReplyCode::Succeeded => "succeeded",
			ReplyCode::GeneralFailure => "general SOCKS server failure",
			ReplyCode::NotAllowed => "connection not allowed by ruleset",
			ReplyCode::NetworkUnreachable => "network unreachable",
			ReplyCode::HostUnreachable => "host unreachable",
			ReplyCode::ConnectionRefused => "connection refused",
			ReplyCode::TtlExpired => "TTL expired",
			ReplyCode::CommandNotSupported => "command not supported",
			ReplyCode::AddressTypeNotSupported => "address type not supported",
			ReplyCode::Unassigned(code) => return write!(f, "unassigned reply code {code:#04x}"),
		};
		f.write_str(text)
	}
}

/// Frames a client sends to the proxy.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
	/// `05 01 00`: one offered method, no authentication.
	Greeting,
	/// `05 01 00 <atyp> <addr> <port>`
	Connect { host: TargetHost, port: u16 },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClientCodec;

impl Encoder<ClientFrame> for ClientCodec {
	type Error = Error;

	fn encode(&mut self, item: ClientFrame, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
		match item {
			ClientFrame::Greeting => {
				dst.reserve(3);
				dst.put_u8(VERSION);
				dst.put_u8(1);
				dst.put_u8(METHOD_NO_AUTH);
			}
			ClientFrame::Connect { host, port } => {
				match host {
					TargetHost::IPv4(ip) => {
						dst.reserve(3 + 1 + 4 + 2);
						dst.put_slice(&[VERSION, CMD_CONNECT, RESERVED]);
						dst.put_u8(AddressType::IPv4.into());
						dst.put_slice(&ip.octets());
					}
					TargetHost::Domain(domain) => {
						if domain.is_empty() || domain.len() > u8::MAX as usize {
							return InvalidTargetSnafu {
								host:   domain,
								reason: "domain must be 1..=255 bytes",
							}
							.fail();
						}
						dst.reserve(3 + 1 + 1 + domain.len() + 2);
						dst.put_slice(&[VERSION, CMD_CONNECT, RESERVED]);
						dst.put_u8(AddressType::Domain.into());
						dst.put_u8(domain.len() as u8);
						dst.put_slice(domain.as_bytes());
					}
				}
				dst.put_u16(port);
			}
		}
		Ok(())
	}
}
