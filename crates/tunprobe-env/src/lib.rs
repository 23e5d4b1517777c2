use std::{backtrace::Backtrace, path::PathBuf, time::Duration};

use snafu::Snafu;

pub mod docker;
pub mod engine;
pub mod env;
pub mod exec;
pub mod forward;
pub mod opts;
pub mod proxy_conf;
pub mod session;
pub mod teardown;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use docker::DockerEngine;
pub use engine::{ContainerEngine, EngineError};
pub use env::{ContainerHandle, Environment, Expect};
pub use exec::{ExecCommand, ExecOutput};
pub use forward::ForwardProxy;
pub use opts::{EnvOpts, ForwardOpts, MountOpts, NetworkOpts, PortOpts, Protocol, RoleOpts, VpnOpts};
pub use session::VpnSession;
pub use teardown::TeardownReport;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
	#[snafu(display("Container engine failed to {op}"))]
	Engine {
		op:        String,
		source:    EngineError,
		backtrace: Backtrace,
	},
	/// A role's readiness marker never showed up in its logs.
	#[snafu(display("Role {role} did not log {marker:?} within {timeout:?}"))]
	EnvironmentNotReady {
		role:      String,
		marker:    String,
		timeout:   Duration,
		logs:      String,
		backtrace: Backtrace,
	},
	#[snafu(display(
		"VPN tunnel not established within {deadline:?} (process running: {process_running}, interface present: {interface_present})"
	))]
	TunnelEstablishFailed {
		deadline:          Duration,
		process_running:   bool,
		interface_present: bool,
		/// Proxy log captured when the deadline passed.
		logs:              String,
		backtrace:         Backtrace,
	},
	#[snafu(display("`{command}` in {role} did not reach {expect:?} within {timeout:?} (last exit code {last_exit_code:?})"))]
	ConditionNotMet {
		role:           String,
		command:        String,
		expect:         Expect,
		timeout:        Duration,
		last_exit_code: Option<i64>,
		last_output:    String,
		backtrace:      Backtrace,
	},
	#[snafu(display("Role {role} has no running container"))]
	ContainerNotRunning { role: String, backtrace: Backtrace },
	#[snafu(display("Invalid topology: {reason}"))]
	InvalidTopology { reason: String, backtrace: Backtrace },
	#[snafu(display("Teardown incomplete: {report}"))]
	Teardown {
		report:    TeardownReport,
		backtrace: Backtrace,
	},
	#[snafu(display("Cannot write proxy config to {}", path.display()))]
	ProxyConfig {
		path:      PathBuf,
		source:    std::io::Error,
		backtrace: Backtrace,
	},
	#[snafu(display("Forward proxy failed: {detail}"))]
	ForwardProxy {
		detail:    String,
		source:    std::io::Error,
		backtrace: Backtrace,
	},
}
