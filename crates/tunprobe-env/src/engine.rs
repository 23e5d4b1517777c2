//! The seam between the environment controller and a container runtime.
//!
//! [`ContainerEngine`] covers only what the harness needs: one bridge network,
//! a handful of long-lived containers on it, and exec into them. Absence and
//! "in use" are reported as distinct errors so best-effort cleanup can ignore
//! exactly those and nothing else.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use snafu::Snafu;

use crate::{exec::ExecOutput, opts::PortOpts};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EngineError {
	#[snafu(display("not found: {message}"))]
	NotFound { message: String },
	#[snafu(display("conflict: {message}"))]
	Conflict { message: String },
	#[snafu(display("docker: {source}"))]
	Docker { source: bollard::errors::Error },
	#[snafu(display("{message}"))]
	Other { message: String },
}

impl EngineError {
	pub fn is_not_found(&self) -> bool {
		matches!(self, EngineError::NotFound { .. })
	}

	pub fn is_conflict(&self) -> bool {
		matches!(self, EngineError::Conflict { .. })
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
	pub name:   String,
	pub subnet: Ipv4Net,
}

/// Everything needed to create one role container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
	pub name:       String,
	pub image:      String,
	pub network:    String,
	pub ipv4:       Ipv4Addr,
	pub privileged: bool,
	/// `host:container[:ro]` bind strings.
	pub binds:      Vec<String>,
	pub ports:      Vec<PortOpts>,
	/// `KEY=VALUE` pairs.
	pub env:        Vec<String>,
	/// Overrides the image's default command when set.
	pub command:    Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
	pub id:      String,
	pub running: bool,
	pub ipv4:    Option<Ipv4Addr>,
}

pub trait ContainerEngine: Send + Sync {
	/// Containers attached to `name`, or `None` if the network does not exist.
	fn network_members(&self, name: &str) -> impl Future<Output = Result<Option<Vec<String>>, EngineError>> + Send;

	fn create_network(&self, spec: &NetworkSpec) -> impl Future<Output = Result<(), EngineError>> + Send;

	fn disconnect_network(&self, network: &str, container: &str) -> impl Future<Output = Result<(), EngineError>> + Send;

	fn remove_network(&self, name: &str) -> impl Future<Output = Result<(), EngineError>> + Send;

	/// Create (not start) a container and return its id.
	fn create_container(&self, spec: &ContainerSpec) -> impl Future<Output = Result<String, EngineError>> + Send;

	fn start_container(&self, id: &str) -> impl Future<Output = Result<(), EngineError>> + Send;

	/// Force-remove, killing the container if it still runs.
	fn remove_container(&self, name: &str) -> impl Future<Output = Result<(), EngineError>> + Send;

	fn inspect_container(&self, name: &str) -> impl Future<Output = Result<ContainerState, EngineError>> + Send;

	/// Combined stdout and stderr collected so far.
	fn container_logs(&self, id: &str) -> impl Future<Output = Result<String, EngineError>> + Send;

	/// Run `argv` to completion and collect its output.
	fn exec(&self, id: &str, argv: &[String], env: &[String]) -> impl Future<Output = Result<ExecOutput, EngineError>> + Send;

	/// Start `argv` and return without waiting for it.
	fn exec_detached(&self, id: &str, argv: &[String], env: &[String]) -> impl Future<Output = Result<(), EngineError>> + Send;
}
