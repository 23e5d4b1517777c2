//! Generated configuration for the proxy under test.
//!
//! The proxy reads a TOML file with `[vpn]`, `[connection]` and `[retry]`
//! tables. The harness writes one into a host directory that the client role
//! mounts read-only, so the VPN addressing and the NAT hooks the checks look
//! for are pinned by the harness rather than by the image.

use std::{
	fs,
	io,
	net::Ipv4Addr,
	path::{Path, PathBuf},
};

use educe::Educe;
use ipnet::Ipv4Net;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::ResultExt;
use tunprobe_core::debug;

use crate::{Error, ProxyConfigSnafu};

pub const FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(default)]
pub struct X2sshConfig {
	pub vpn:        VpnSection,
	pub connection: ConnectionSection,
	pub retry:      RetrySection,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(default)]
pub struct VpnSection {
	#[educe(Default(expression = Ipv4Net::new_assert(Ipv4Addr::new(10, 8, 0, 2), 24)))]
	pub client_address: Ipv4Net,

	#[educe(Default(expression = Ipv4Net::new_assert(Ipv4Addr::new(10, 8, 0, 1), 24)))]
	pub server_address: Ipv4Net,

	#[educe(Default = "tun-x2ssh")]
	pub client_tun: String,

	#[educe(Default = 1400)]
	pub mtu: u16,

	/// Destinations routed around the tunnel.
	pub exclude: Vec<Ipv4Net>,

	/// Run on the server side after the tunnel comes up.
	#[educe(Default(expression = vec![
		"sysctl -w net.ipv4.ip_forward=1".to_string(),
		"iptables -t nat -I POSTROUTING -o eth0 -j MASQUERADE".to_string(),
	]))]
	pub post_up: Vec<String>,

	/// Run on the server side before the tunnel goes down.
	#[educe(Default(expression = vec!["iptables -t nat -D POSTROUTING -o eth0 -j MASQUERADE".to_string()]))]
	pub pre_down: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(default)]
pub struct ConnectionSection {
	#[educe(Default = 22)]
	pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(default)]
pub struct RetrySection {
	pub max_attempts: MaxAttempts,

	#[educe(Default = 1000)]
	pub initial_delay_ms: u64,

	#[educe(Default = 2.0)]
	pub backoff: f64,

	#[educe(Default = 30_000)]
	pub max_delay_ms: u64,

	#[educe(Default = 5000)]
	pub health_interval_ms: u64,
}

/// `"inf"` or a plain count on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Educe)]
#[educe(Default)]
pub enum MaxAttempts {
	#[educe(Default)]
	Unlimited,
	Count(u32),
}

impl Serialize for MaxAttempts {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		match self {
			MaxAttempts::Unlimited => serializer.serialize_str("inf"),
			MaxAttempts::Count(n) => serializer.serialize_u32(*n),
		}
	}
}

impl<'de> Deserialize<'de> for MaxAttempts {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum Raw {
			Count(u32),
			Text(String),
		}

		match Raw::deserialize(deserializer)? {
			Raw::Count(n) => Ok(MaxAttempts::Count(n)),
			Raw::Text(s) if s.eq_ignore_ascii_case("inf") => Ok(MaxAttempts::Unlimited),
			Raw::Text(s) => Err(serde::de::Error::custom(format!("expected \"inf\" or a number, got {s:?}"))),
		}
	}
}

impl X2sshConfig {
	pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
		toml::to_string_pretty(self)
	}

	/// Write `config.toml` into `dir`, creating it if needed.
	pub fn write_to(&self, dir: &Path) -> Result<PathBuf, Error> {
		let path = dir.join(FILE_NAME);
		let content = self
			.to_toml()
			.map_err(io::Error::other)
			.context(ProxyConfigSnafu { path: path.clone() })?;
		fs::create_dir_all(dir).context(ProxyConfigSnafu { path: path.clone() })?;
		fs::write(&path, content).context(ProxyConfigSnafu { path: path.clone() })?;
		debug!(target: "[CONF]", "wrote proxy config to {}", path.display());
		Ok(path)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_document() {
		let doc = X2sshConfig::default().to_toml().unwrap();
		assert!(doc.contains("client_address = \"10.8.0.2/24\""), "{doc}");
		assert!(doc.contains("server_address = \"10.8.0.1/24\""), "{doc}");
		assert!(doc.contains("client_tun = \"tun-x2ssh\""), "{doc}");
		assert!(doc.contains("max_attempts = \"inf\""), "{doc}");
		assert!(doc.contains("iptables -t nat -I POSTROUTING -o eth0 -j MASQUERADE"), "{doc}");
	}

	#[test]
	fn test_parse_proxy_style_document() {
		let config: X2sshConfig = toml::from_str(
			r#"
			[vpn]
			client_address = "10.9.0.2/24"
			exclude = ["192.168.0.0/16"]

			[retry]
			max_attempts = 5
			"#,
		)
		.unwrap();
		assert_eq!(config.vpn.client_address.addr(), Ipv4Addr::new(10, 9, 0, 2));
		assert_eq!(config.vpn.server_address.addr(), Ipv4Addr::new(10, 8, 0, 1));
		assert_eq!(config.vpn.exclude.len(), 1);
		assert_eq!(config.vpn.mtu, 1400);
		assert_eq!(config.retry.max_attempts, MaxAttempts::Count(5));
		assert_eq!(config.connection.port, 22);
	}

	#[test]
	fn test_max_attempts_rejects_words() {
		let err = toml::from_str::<RetrySection>("max_attempts = \"forever\"").unwrap_err();
		assert!(err.to_string().contains("forever"), "{err}");
		let inf: RetrySection = toml::from_str("max_attempts = \"INF\"").unwrap();
		assert_eq!(inf.max_attempts, MaxAttempts::Unlimited);
	}

	#[test]
	fn test_write_to_creates_directory() {
		let dir = std::env::temp_dir().join(format!("tunprobe-conf-{}", std::process::id())).join("nested");
		let path = X2sshConfig::default().write_to(&dir).unwrap();
		assert_eq!(path, dir.join(FILE_NAME));
		let read_back: X2sshConfig = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
		assert_eq!(read_back, X2sshConfig::default());
		fs::remove_dir_all(dir.parent().unwrap()).unwrap();
	}
}
