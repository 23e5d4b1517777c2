use std::{collections::HashSet, fmt::Display, net::Ipv4Addr, path::PathBuf, time::Duration};

use educe::Educe;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use snafu::ensure;
use tunprobe_core::{Endpoint, PollPolicy};

use crate::{Error, InvalidTopologySnafu, proxy_conf::X2sshConfig};

pub const SERVER_ROLE: &str = "server";
pub const CLIENT_ROLE: &str = "client";

#[derive(Debug, Clone, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(default)]
pub struct EnvOpts {
	pub network: NetworkOpts,

	/// Started in this order, stopped all together.
	#[educe(Default(expression = vec![RoleOpts::server(), RoleOpts::client()]))]
	pub roles: Vec<RoleOpts>,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_millis(500)))]
	pub poll_interval: Duration,

	/// Bound on each role's readiness marker.
	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(30)))]
	pub ready_timeout: Duration,

	/// Host directory the generated proxy config is written to before any
	/// container starts. Mount it into the client role.
	#[educe(Default(expression = Some(PathBuf::from("target/tunprobe/x2ssh"))))]
	pub proxy_config_dir: Option<PathBuf>,

	pub proxy_config: X2sshConfig,
}

impl EnvOpts {
	pub fn role(&self, name: &str) -> Option<&RoleOpts> {
		self.roles.iter().find(|role| role.name == name)
	}

	pub fn readiness_policy(&self) -> PollPolicy {
		PollPolicy::new(self.poll_interval, self.ready_timeout)
	}

	/// Role names unique, every address a usable host inside the subnet.
	pub fn validate(&self) -> Result<(), Error> {
		let subnet = self.network.subnet;
		let mut names = HashSet::new();
		let mut addrs = HashSet::new();
		for role in &self.roles {
			ensure!(!role.name.is_empty(), InvalidTopologySnafu {
				reason: "role name must not be empty",
			});
			ensure!(names.insert(role.name.as_str()), InvalidTopologySnafu {
				reason: format!("duplicate role {}", role.name),
			});
			ensure!(
				subnet.contains(&role.ipv4) && role.ipv4 != subnet.network() && role.ipv4 != subnet.broadcast(),
				InvalidTopologySnafu {
					reason: format!("{} address {} is not a host of {subnet}", role.name, role.ipv4),
				}
			);
			ensure!(addrs.insert(role.ipv4), InvalidTopologySnafu {
				reason: format!("{} reuses address {}", role.name, role.ipv4),
			});
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(default)]
pub struct NetworkOpts {
	#[educe(Default = "tunprobe-vpn")]
	pub name: String,

	#[educe(Default(expression = Ipv4Net::new_assert(Ipv4Addr::new(10, 10, 0, 0), 24)))]
	pub subnet: Ipv4Net,
}

impl NetworkOpts {
	/// Containers are named after the network so a rerun finds its leftovers.
	pub fn container_name(&self, role: &str) -> String {
		format!("{}-{role}", self.name)
	}
}

#[derive(Debug, Clone, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(default)]
pub struct RoleOpts {
	pub name: String,

	pub image: String,

	#[educe(Default(expression = Ipv4Addr::UNSPECIFIED))]
	pub ipv4: Ipv4Addr,

	#[educe(Default = false)]
	pub privileged: bool,

	pub mounts: Vec<MountOpts>,

	pub ports: Vec<PortOpts>,

	/// `KEY=VALUE` pairs.
	pub env: Vec<String>,

	pub command: Option<Vec<String>>,

	/// Log line that means the role is ready for the next one.
	pub ready_marker: Option<String>,
}

impl RoleOpts {
	/// SSH endpoint plus TCP and UDP echo services.
	pub fn server() -> Self {
		Self {
			name: SERVER_ROLE.to_string(),
			image: "x2ssh-vpn-server:latest".to_string(),
			ipv4: Ipv4Addr::new(10, 10, 0, 20),
			privileged: true,
			mounts: vec![MountOpts::read_only("tests/keys", "/tmp/keys")],
			ports: vec![
				PortOpts::tcp(2222, 22),
				PortOpts::tcp(8080, 8080),
				PortOpts::udp(8081, 8081),
			],
			ready_marker: Some("Server listening on".to_string()),
			..Default::default()
		}
	}

	/// Runs the proxy in VPN mode.
	pub fn client() -> Self {
		Self {
			name: CLIENT_ROLE.to_string(),
			image: "x2ssh-vpn-client:latest".to_string(),
			ipv4: Ipv4Addr::new(10, 10, 0, 10),
			privileged: true,
			mounts: vec![
				MountOpts::read_only("tests/keys", "/tmp/keys"),
				MountOpts::read_only("target/tunprobe/x2ssh", "/etc/x2ssh"),
				MountOpts::read_only("target/release/x2ssh", "/usr/local/bin/x2ssh"),
			],
			..Default::default()
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct MountOpts {
	/// Relative paths resolve against the working directory.
	pub source: PathBuf,

	pub target: PathBuf,

	#[educe(Default = true)]
	#[serde(default = "default_true")]
	pub read_only: bool,
}

fn default_true() -> bool {
	true
}

impl MountOpts {
	pub fn read_only(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
		Self {
			source:    source.into(),
			target:    target.into(),
			read_only: true,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	#[educe(Default)]
	Tcp,
	Udp,
}

impl Display for Protocol {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Protocol::Tcp => f.write_str("tcp"),
			Protocol::Udp => f.write_str("udp"),
		}
	}
}

/// A container port published on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct PortOpts {
	pub host:      u16,
	pub container: u16,
	#[serde(default)]
	pub protocol:  Protocol,
}

impl PortOpts {
	pub const fn tcp(host: u16, container: u16) -> Self {
		Self {
			host,
			container,
			protocol: Protocol::Tcp,
		}
	}

	pub const fn udp(host: u16, container: u16) -> Self {
		Self {
			host,
			container,
			protocol: Protocol::Udp,
		}
	}

	/// Engine-side key, e.g. `8081/udp`.
	pub fn container_key(&self) -> String {
		format!("{}/{}", self.container, self.protocol)
	}
}

/// How the proxy is run in VPN mode inside a role container.
#[derive(Debug, Clone, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(default)]
pub struct VpnOpts {
	#[educe(Default(expression = CLIENT_ROLE.to_string()))]
	pub role: String,

	/// Process name, also used for `pgrep -x` / `pkill -x`.
	#[educe(Default = "x2ssh")]
	pub binary: String,

	#[educe(Default(expression = PathBuf::from("/etc/x2ssh/config.toml")))]
	pub config_path: PathBuf,

	#[educe(Default(expression = PathBuf::from("/tmp/keys/id_ed25519")))]
	pub key_path: PathBuf,

	#[educe(Default = "root@10.10.0.20")]
	pub destination: String,

	#[educe(Default = 22)]
	pub port: u16,

	#[educe(Default = "tun-x2ssh")]
	pub tun_name: String,

	#[educe(Default(expression = PathBuf::from("/tmp/x2ssh.log")))]
	pub log_path: PathBuf,

	/// Value of `RUST_LOG` for the proxy.
	#[educe(Default = "info")]
	pub log_level: String,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_millis(500)))]
	pub poll_interval: Duration,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(2)))]
	pub grace_period: Duration,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(30)))]
	pub deadline: Duration,

	#[educe(Default(expression = Ipv4Addr::new(10, 8, 0, 1)))]
	pub server_tun_ip: Ipv4Addr,

	#[educe(Default(expression = Ipv4Addr::new(10, 8, 0, 2)))]
	pub client_tun_ip: Ipv4Addr,
}

/// How the proxy is run locally in forward (SOCKS5) mode.
#[derive(Debug, Clone, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(default)]
pub struct ForwardOpts {
	#[educe(Default(expression = PathBuf::from("target/release/x2ssh")))]
	pub binary: PathBuf,

	#[educe(Default(expression = Endpoint::new("127.0.0.1", 1080)))]
	pub listen: Endpoint,

	/// SSH port the server role publishes on the host.
	#[educe(Default = 2222)]
	pub ssh_port: u16,

	#[educe(Default(expression = PathBuf::from("tests/keys/id_ed25519")))]
	pub key_path: PathBuf,

	#[educe(Default = "root@127.0.0.1")]
	pub destination: String,

	#[educe(Default = "info")]
	pub log_level: String,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_millis(100)))]
	pub poll_interval: Duration,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(10)))]
	pub ready_timeout: Duration,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(2)))]
	pub grace_period: Duration,
}
