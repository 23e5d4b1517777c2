use tunprobe_env::{EnvOpts, ForwardOpts, VpnOpts};
use tunprobe_socks::{Socks5Client, Socks5ClientOpts};

use super::persistent::{PersistentConfig, SocksOpts};

pub struct Config {
	pub env:     EnvOpts,
	pub vpn:     VpnOpts,
	pub forward: ForwardOpts,
	pub socks:   SocksOpts,
}

impl Config {
	pub fn from_persist(config: PersistentConfig) -> Self {
		Self {
			env:     config.env,
			vpn:     config.vpn,
			forward: config.forward,
			socks:   config.socks,
		}
	}

	pub fn socks_client(&self) -> Socks5Client {
		Socks5Client::with_opts(self.socks.proxy.clone(), Socks5ClientOpts {
			connect_timeout:   self.socks.connect_timeout,
			handshake_timeout: self.socks.handshake_timeout,
		})
	}
}
