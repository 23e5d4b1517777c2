use std::{
	path::{Path, PathBuf},
	time::Duration,
};

use educe::Educe;
use figment::{
	Figment,
	providers::{Env, Format, Serialized, Toml, Yaml},
};
use serde::{Deserialize, Serialize};
use tunprobe_core::Endpoint;
use tunprobe_env::{EnvOpts, ForwardOpts, VpnOpts};

use crate::cli::ConfigFormat;

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(default)]
pub struct PersistentConfig {
	pub env:     EnvOpts,
	pub vpn:     VpnOpts,
	pub forward: ForwardOpts,
	pub socks:   SocksOpts,
}

/// Where `socks-echo` finds the proxy and the echo service behind it.
#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(default)]
pub struct SocksOpts {
	#[educe(Default(expression = Endpoint::new("127.0.0.1", 1080)))]
	pub proxy: Endpoint,

	/// Resolved on the far side of the tunnel.
	#[educe(Default = "127.0.0.1")]
	pub echo_host: String,

	#[educe(Default = 8080)]
	pub echo_port: u16,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(10)))]
	pub connect_timeout: Duration,

	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(10)))]
	pub handshake_timeout: Duration,

	/// Bound on a whole echo round trip.
	#[serde(with = "humantime_serde")]
	#[educe(Default(expression = Duration::from_secs(30)))]
	pub deadline: Duration,
}

impl PersistentConfig {
	pub fn export_to_file(&self, file_path: &Path, format: ConfigFormat) -> eyre::Result<()> {
		let content = match format {
			ConfigFormat::Yaml => serde_yaml::to_string(&self)?,
			ConfigFormat::Toml => toml::to_string_pretty(&self)?,
		};
		if let Some(parent) = file_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
			std::fs::create_dir_all(parent)?;
		}
		std::fs::write(file_path, content)?;
		Ok(())
	}

	/// Defaults, then `config.toml` / `config.yaml` from `config_dir` (or the
	/// working directory), then `config_path`, then `TUNPROBE_*` variables
	/// with `__` between nesting levels.
	pub fn load(config_path: Option<String>, config_dir: Option<PathBuf>) -> eyre::Result<Self> {
		let mut figment = Figment::from(Serialized::defaults(PersistentConfig::default()));

		let dir = config_dir.unwrap_or_default();
		let config_toml = dir.join("config.toml");
		if config_toml.exists() {
			figment = figment.merge(Toml::file(config_toml));
		}
		let config_yaml = dir.join("config.yaml");
		if config_yaml.exists() {
			figment = figment.merge(Yaml::file(config_yaml));
		}

		if let Some(config_path) = config_path {
			if config_path.ends_with(".yaml") || config_path.ends_with(".yml") {
				figment = figment.merge(Yaml::file_exact(config_path));
			} else {
				figment = figment.merge(Toml::file_exact(config_path));
			}
		}

		figment = figment.merge(Env::prefixed("TUNPROBE_").split("__"));

		let config: PersistentConfig = figment.extract()?;
		Ok(config)
	}
}
