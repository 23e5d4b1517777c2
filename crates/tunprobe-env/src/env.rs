//! Lifecycle of the containerized test topology.
//!
//! An [`Environment`] owns one bridge network and one container per
//! configured role. Containers are named `<network>-<role>`, which lets a
//! fresh controller find (and remove) whatever an earlier run left behind and
//! lets a separate process [`attach`](Environment::attach) to a running
//! topology.

use std::{collections::HashMap, net::Ipv4Addr, ops::ControlFlow, path::Path, time::Duration};

use snafu::{OptionExt, ResultExt};
use tunprobe_core::{PollPolicy, debug, info, poll_until, warn};

use crate::{
	ConditionNotMetSnafu, ContainerNotRunningSnafu, EngineSnafu, EnvironmentNotReadySnafu, Error, InvalidTopologySnafu,
	docker::DockerEngine,
	engine::{ContainerEngine, ContainerSpec, NetworkSpec},
	exec::{ExecCommand, ExecOutput},
	opts::{EnvOpts, MountOpts, RoleOpts},
	teardown::TeardownReport,
};

const NETWORK_REMOVE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
	pub id:   String,
	pub name: String,
	pub ipv4: Ipv4Addr,
}

/// Exit status a [`Environment::wait_for`] condition waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
	Success,
	Failure,
}

impl Expect {
	pub fn matches(self, output: &ExecOutput) -> bool {
		match self {
			Expect::Success => output.success(),
			Expect::Failure => !output.success(),
		}
	}
}

pub struct Environment<E = DockerEngine> {
	engine:  E,
	opts:    EnvOpts,
	handles: HashMap<String, ContainerHandle>,
	live:    bool,
}

impl Environment<DockerEngine> {
	/// Controller over the local Docker daemon.
	pub fn docker(opts: EnvOpts) -> Result<Self, Error> {
		let engine = DockerEngine::connect().context(EngineSnafu { op: "connect" })?;
		Ok(Self::new(engine, opts))
	}
}

impl<E: ContainerEngine> Environment<E> {
	pub fn new(engine: E, opts: EnvOpts) -> Self {
		Self {
			engine,
			opts,
			handles: HashMap::new(),
			live: false,
		}
	}

	pub fn opts(&self) -> &EnvOpts {
		&self.opts
	}

	pub fn engine(&self) -> &E {
		&self.engine
	}

	/// True between a completed [`start`](Self::start) or
	/// [`attach`](Self::attach) and the next [`stop`](Self::stop).
	pub fn is_live(&self) -> bool {
		self.live
	}

	pub fn handle(&self, role: &str) -> Option<&ContainerHandle> {
		self.handles.get(role)
	}

	/// Static address of `role` on the test network.
	pub fn role_ip(&self, role: &str) -> Option<Ipv4Addr> {
		self.opts.role(role).map(|role| role.ipv4)
	}

	/// Bring the topology up from scratch.
	///
	/// Leftovers from an earlier run are removed first. Roles start in
	/// declaration order and a role with a readiness marker must log it before
	/// the next one is created. On error, call [`stop`](Self::stop) to release
	/// whatever was already created.
	pub async fn start(&mut self) -> Result<(), Error> {
		self.opts.validate()?;
		self.live = false;
		self.handles.clear();

		info!(target: "[ENV] START", "starting network {} ({})", self.opts.network.name, self.opts.network.subnet);
		self.remove_leftovers().await?;

		if let Some(dir) = &self.opts.proxy_config_dir {
			self.opts.proxy_config.write_to(dir)?;
		}

		let network = NetworkSpec {
			name:   self.opts.network.name.clone(),
			subnet: self.opts.network.subnet,
		};
		self.engine
			.create_network(&network)
			.await
			.context(EngineSnafu {
				op: format!("create network {}", network.name),
			})?;

		for role in self.opts.roles.clone() {
			self.start_role(&role).await?;
		}

		self.live = true;
		info!(target: "[ENV] START", "environment ready with {} role(s)", self.handles.len());
		Ok(())
	}

	async fn start_role(&mut self, role: &RoleOpts) -> Result<(), Error> {
		let spec = ContainerSpec {
			name:       self.opts.network.container_name(&role.name),
			image:      role.image.clone(),
			network:    self.opts.network.name.clone(),
			ipv4:       role.ipv4,
			privileged: role.privileged,
			binds:      role.mounts.iter().map(bind_string).collect(),
			ports:      role.ports.clone(),
			env:        role.env.clone(),
			command:    role.command.clone(),
		};

		let id = self
			.engine
			.create_container(&spec)
			.await
			.context(EngineSnafu {
				op: format!("create container {}", spec.name),
			})?;
		self.handles.insert(role.name.clone(), ContainerHandle {
			id:   id.clone(),
			name: spec.name.clone(),
			ipv4: role.ipv4,
		});

		self.engine
			.start_container(&id)
			.await
			.context(EngineSnafu {
				op: format!("start container {}", spec.name),
			})?;
		debug!(target: "[ENV] START", "{} started as {} at {}", role.name, spec.name, role.ipv4);

		if let Some(marker) = &role.ready_marker {
			self.wait_ready(&role.name, &id, marker).await?;
		}
		Ok(())
	}

	async fn wait_ready(&self, role: &str, id: &str, marker: &str) -> Result<(), Error> {
		let policy = self.opts.readiness_policy();
		let engine = &self.engine;
		let res = poll_until(policy, move || async move {
			match engine.container_logs(id).await {
				Ok(logs) if logs.contains(marker) => ControlFlow::Break(()),
				Ok(logs) => ControlFlow::Continue(logs),
				Err(err) => {
					debug!(target: "[ENV] READY", "cannot read logs of {role}: {err}");
					ControlFlow::Continue(String::new())
				}
			}
		})
		.await;

		match res {
			Ok(()) => {
				debug!(target: "[ENV] READY", "{role} logged {marker:?}");
				Ok(())
			}
			Err(elapsed) => EnvironmentNotReadySnafu {
				role,
				marker,
				timeout: policy.timeout,
				logs: elapsed.last.unwrap_or_default(),
			}
			.fail(),
		}
	}

	/// Remove role containers and the network left by an earlier run.
	async fn remove_leftovers(&self) -> Result<(), Error> {
		for role in &self.opts.roles {
			let name = self.opts.network.container_name(&role.name);
			match self.engine.remove_container(&name).await {
				Ok(()) => debug!(target: "[ENV] START", "removed stale container {name}"),
				Err(err) if err.is_not_found() => {}
				Err(err) => {
					return Err(err).context(EngineSnafu {
						op: format!("remove stale container {name}"),
					});
				}
			}
		}

		let network = &self.opts.network.name;
		let members = self
			.engine
			.network_members(network)
			.await
			.context(EngineSnafu {
				op: format!("inspect network {network}"),
			})?;
		let Some(members) = members else {
			return Ok(());
		};
		for member in members {
			match self.engine.disconnect_network(network, &member).await {
				Ok(()) => {}
				Err(err) if err.is_not_found() => {}
				Err(err) => {
					return Err(err).context(EngineSnafu {
						op: format!("disconnect {member} from {network}"),
					});
				}
			}
		}
		match self.engine.remove_network(network).await {
			Ok(()) => {
				debug!(target: "[ENV] START", "removed stale network {network}");
				Ok(())
			}
			Err(err) if err.is_not_found() => Ok(()),
			Err(err) => Err(err).context(EngineSnafu {
				op: format!("remove stale network {network}"),
			}),
		}
	}

	/// Release every container and the network.
	///
	/// Never fails: each resource is attempted and whatever could not be
	/// released is listed in the returned report. Safe to call on an
	/// environment that was never started, and more than once.
	pub async fn stop(&mut self) -> TeardownReport {
		self.live = false;
		self.handles.clear();
		let mut report = TeardownReport::default();

		for role in self.opts.roles.iter().rev() {
			let name = self.opts.network.container_name(&role.name);
			match self.engine.remove_container(&name).await {
				Ok(()) => debug!(target: "[ENV] STOP", "removed container {name}"),
				Err(err) if err.is_not_found() => {}
				Err(err) => report.record(format!("container {name}"), err),
			}
		}

		let network = &self.opts.network.name;
		for attempt in 1..=NETWORK_REMOVE_ATTEMPTS {
			match self.engine.remove_network(network).await {
				Ok(()) => {
					debug!(target: "[ENV] STOP", "removed network {network}");
					break;
				}
				Err(err) if err.is_not_found() => break,
				Err(err) if err.is_conflict() => {
					if attempt == NETWORK_REMOVE_ATTEMPTS {
						warn!(target: "[ENV] STOP", "network {network} still in use, leaving it: {err}");
					} else {
						tokio::time::sleep(self.opts.poll_interval).await;
					}
				}
				Err(err) => {
					report.record(format!("network {network}"), err);
					break;
				}
			}
		}

		if report.is_clean() {
			info!(target: "[ENV] STOP", "environment {network} torn down");
		} else {
			warn!(target: "[ENV] STOP", "teardown incomplete: {report}");
		}
		report
	}

	/// Adopt role containers that are already running, e.g. started by an
	/// earlier `start()` in another process.
	pub async fn attach(&mut self) -> Result<(), Error> {
		self.opts.validate()?;
		let mut handles = HashMap::new();
		for role in &self.opts.roles {
			let name = self.opts.network.container_name(&role.name);
			let state = match self.engine.inspect_container(&name).await {
				Ok(state) => state,
				Err(err) if err.is_not_found() => return ContainerNotRunningSnafu { role: &role.name }.fail(),
				Err(err) => {
					return Err(err).context(EngineSnafu {
						op: format!("inspect container {name}"),
					});
				}
			};
			if !state.running {
				return ContainerNotRunningSnafu { role: &role.name }.fail();
			}
			handles.insert(role.name.clone(), ContainerHandle {
				id: state.id,
				name,
				ipv4: state.ipv4.unwrap_or(role.ipv4),
			});
		}
		self.handles = handles;
		self.live = true;
		debug!(target: "[ENV] ATTACH", "attached to {} role(s) on {}", self.handles.len(), self.opts.network.name);
		Ok(())
	}

	fn live_handle(&self, role: &str) -> Result<&ContainerHandle, Error> {
		if !self.live {
			return ContainerNotRunningSnafu { role }.fail();
		}
		self.handles
			.get(role)
			.context(ContainerNotRunningSnafu { role })
	}

	/// Run `command` in `role` and wait for it to exit.
	pub async fn exec_in(&self, role: &str, command: impl Into<ExecCommand>) -> Result<ExecOutput, Error> {
		self.exec_with_env(role, command, &[]).await
	}

	/// [`exec_in`](Self::exec_in) with extra `KEY=VALUE` environment.
	pub async fn exec_with_env(&self, role: &str, command: impl Into<ExecCommand>, env: &[String]) -> Result<ExecOutput, Error> {
		let command = command.into();
		let handle = self.live_handle(role)?;
		let output = self
			.engine
			.exec(&handle.id, &command.to_argv(), env)
			.await
			.context(EngineSnafu {
				op: format!("exec in {role}"),
			})?;
		debug!(target: "[ENV] EXEC", "{role}$ {command} -> {}", output.exit_code);
		Ok(output)
	}

	/// Start `command` in `role` without waiting for it.
	pub async fn exec_detached(&self, role: &str, command: impl Into<ExecCommand>, env: &[String]) -> Result<(), Error> {
		let command = command.into();
		let handle = self.live_handle(role)?;
		self.engine
			.exec_detached(&handle.id, &command.to_argv(), env)
			.await
			.context(EngineSnafu {
				op: format!("detached exec in {role}"),
			})?;
		debug!(target: "[ENV] EXEC", "{role}$ {command} &");
		Ok(())
	}

	/// Poll `command` in `role` until its exit status matches `expect`.
	pub async fn wait_for(
		&self,
		role: &str,
		command: impl Into<ExecCommand>,
		expect: Expect,
		timeout: Duration,
	) -> Result<ExecOutput, Error> {
		let command = command.into();
		let policy = PollPolicy::new(self.opts.poll_interval, timeout);
		let probe_command = &command;
		let res = poll_until(policy, move || async move {
			match self.exec_in(role, probe_command.clone()).await {
				Ok(output) if expect.matches(&output) => ControlFlow::Break(Ok(output)),
				Ok(output) => ControlFlow::Continue(output),
				Err(err) => ControlFlow::Break(Err(err)),
			}
		})
		.await;

		match res {
			Ok(outcome) => outcome,
			Err(elapsed) => ConditionNotMetSnafu {
				role,
				command: command.to_string(),
				expect,
				timeout,
				last_exit_code: elapsed.last.as_ref().map(|output| output.exit_code),
				last_output: elapsed.last.map(|output| output.output).unwrap_or_default(),
			}
			.fail(),
		}
	}

	/// Container output of `role` so far. Works after the container exited.
	pub async fn logs(&self, role: &str) -> Result<String, Error> {
		let name = match self.handles.get(role) {
			Some(handle) => handle.id.clone(),
			None => {
				self.opts.role(role).context(InvalidTopologySnafu {
					reason: format!("unknown role {role}"),
				})?;
				self.opts.network.container_name(role)
			}
		};
		self.engine
			.container_logs(&name)
			.await
			.context(EngineSnafu {
				op: format!("read logs of {role}"),
			})
	}
}

fn bind_string(mount: &MountOpts) -> String {
	let source = absolute(&mount.source);
	let mode = if mount.read_only { ":ro" } else { "" };
	format!("{}:{}{mode}", source.display(), mount.target.display())
}

fn absolute(path: &Path) -> std::path::PathBuf {
	std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
