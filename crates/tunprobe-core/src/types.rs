use std::{
	fmt::Display,
	net::{Ipv4Addr, Ipv6Addr, SocketAddr},
	str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A `(host, port)` pair naming a listening service, such as the SOCKS5 port
/// of the proxy under test or a published container port.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
	host: String,
	port: u16,
}

impl Endpoint {
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		Self {
			host: host.into(),
			port,
		}
	}

	pub fn host(&self) -> &str {
		&self.host
	}

	pub fn port(&self) -> u16 {
		self.port
	}
}

impl From<SocketAddr> for Endpoint {
	fn from(addr: SocketAddr) -> Self {
		Self::new(addr.ip().to_string(), addr.port())
	}
}

impl Display for Endpoint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		if self.host.parse::<Ipv6Addr>().is_ok() {
			write!(f, "[{}]:{}", self.host, self.port)
		} else {
			write!(f, "{}:{}", self.host, self.port)
		}
	}
}

impl FromStr for Endpoint {
	type Err = &'static str;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		// [IPv6]:port
		if let Some(rest) = s.strip_prefix('[') {
			let end_bracket = rest
				.find(']')
				.ok_or("Invalid IPv6 address format, missing closing bracket")?;
			let port_str = rest[end_bracket + 1..]
				.strip_prefix(':')
				.ok_or("Invalid IPv6 address format, expected [IPv6]:port")?;
			let ip = rest[..end_bracket]
				.parse::<Ipv6Addr>()
				.map_err(|_| "Invalid IPv6 address")?;
			let port = port_str.parse::<u16>().map_err(|_| "Invalid port number")?;
			return Ok(Self::new(ip.to_string(), port));
		}

		let (host, port) = s
			.rsplit_once(':')
			.ok_or("Invalid address format, expected host:port")?;
		if host.is_empty() || host.contains(':') {
			return Err("Invalid address format, expected host:port");
		}
		let port = port.parse::<u16>().map_err(|_| "Invalid port number")?;
		Ok(Self::new(host, port))
	}
}

impl Serialize for Endpoint {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		self.to_string().serialize(serializer)
	}
}

impl<'de> Deserialize<'de> for Endpoint {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

/// Destination of a CONNECT request as it goes on the wire.
///
/// Only a literal dotted-quad becomes [`TargetHost::IPv4`]; everything else,
/// including IPv6 literals, is carried as a domain name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TargetHost {
	IPv4(Ipv4Addr),
	Domain(String),
}

impl TargetHost {
	pub fn parse(host: &str) -> Self {
		match host.parse::<Ipv4Addr>() {
			Ok(ip) => TargetHost::IPv4(ip),
			Err(_) => TargetHost::Domain(host.to_string()),
		}
	}
}

impl Display for TargetHost {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			TargetHost::IPv4(ip) => write!(f, "{ip}"),
			TargetHost::Domain(domain) => write!(f, "{domain}"),
		}
	}
}
