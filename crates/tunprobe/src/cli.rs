use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use tracing::Level;

#[derive(Parser)]
#[command(about, long_about = None)]
pub struct Cli {
	/// Set a custom config
	#[arg(short, visible_short_alias = 'f', long, value_name = "FILE")]
	pub config: Option<String>,

	/// Set configuration directory
	#[arg(short = 'C', visible_short_alias = 'd', long, value_name = "PATH")]
	pub config_dir: Option<PathBuf>,

	/// Set working directory, against which relative mount sources resolve
	#[arg(short = 'D', long, value_name = "PATH")]
	pub work_dir: Option<PathBuf>,

	/// Log level of the tunprobe crates
	#[arg(short, long, default_value = "info")]
	pub log_level: Level,

	/// Show current version
	#[arg(short = 'v', visible_short_alias = 'V', long, action = ArgAction::SetTrue)]
	pub version: bool,

	#[command(subcommand)]
	pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
	/// Initialize a new default configuration file
	Init {
		/// Specify the configuration file format (yaml or toml)
		#[arg(short, long, value_enum, default_value = "yaml")]
		format: ConfigFormat,

		/// Defaults to `config.<format>` in the configuration directory
		#[arg(short, long, value_name = "FILE")]
		output: Option<PathBuf>,
	},

	/// Create the test network and start every role container
	Up,

	/// Remove the role containers and the test network
	Down,

	/// Run a command inside a role container
	Exec {
		role: String,

		/// Hand the command to `sh -c` as one script
		#[arg(long)]
		shell: bool,

		#[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
		command: Vec<String>,
	},

	/// Print the container output of a role
	Logs { role: String },

	/// Launch the proxy in VPN mode and wait for the tunnel
	VpnUp {
		/// Override the configured tunnel deadline, in seconds
		#[arg(long, value_name = "SECS")]
		deadline: Option<u64>,
	},

	/// Interrupt the VPN-mode proxy
	VpnDown {
		/// Also wait until the process is gone, up to SECS
		#[arg(long, value_name = "SECS")]
		wait: Option<u64>,
	},

	/// Report process, interface, route and NAT state
	VpnStatus,

	/// Print the VPN-mode proxy log
	VpnLogs,

	/// Echo random bytes through the SOCKS5 proxy
	SocksEcho {
		/// Echo service host, as resolved by the proxy
		#[arg(long)]
		host: Option<String>,

		#[arg(long)]
		port: Option<u16>,

		/// Payload size in bytes
		#[arg(short, long, default_value_t = 1024)]
		size: usize,

		/// Concurrent connections, each with its own payload
		#[arg(short = 'n', long, default_value_t = 1)]
		clients: usize,
	},

	/// Run the proxy locally in forward mode until interrupted
	Forward,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
	Yaml,
	Toml,
}

impl ConfigFormat {
	pub fn extension(self) -> &'static str {
		match self {
			ConfigFormat::Yaml => "yaml",
			ConfigFormat::Toml => "toml",
		}
	}
}
