//! In-memory [`ContainerEngine`] that records every call, for tests.

use std::{
	collections::HashMap,
	net::Ipv4Addr,
	sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
	engine::{ContainerEngine, ContainerSpec, ContainerState, EngineError, NetworkSpec},
	exec::ExecOutput,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
	NetworkMembers(String),
	CreateNetwork(NetworkSpec),
	DisconnectNetwork(String, String),
	RemoveNetwork(String),
	CreateContainer(ContainerSpec),
	StartContainer(String),
	RemoveContainer(String),
	Inspect(String),
	Logs(String),
	Exec { container: String, argv: Vec<String>, env: Vec<String> },
	ExecDetached { container: String, argv: Vec<String>, env: Vec<String> },
}

type ExecHandler = Box<dyn FnMut(&str, &[String]) -> ExecOutput + Send>;

struct Container {
	id:      String,
	spec:    ContainerSpec,
	running: bool,
}

#[derive(Default)]
struct State {
	calls:              Vec<Call>,
	networks:           HashMap<String, Vec<String>>,
	containers:         HashMap<String, Container>,
	logs:               HashMap<String, String>,
	removal_failures:   HashMap<String, EngineError>,
	network_conflicts:  u32,
	exec_handler:       Option<ExecHandler>,
	stalled_programs:   Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockEngine {
	state: Arc<Mutex<State>>,
}

impl MockEngine {
	fn lock(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn calls(&self) -> Vec<Call> {
		self.lock().calls.clone()
	}

	pub fn set_logs(&self, container: &str, logs: &str) {
		self.lock().logs.insert(container.to_string(), logs.to_string());
	}

	pub fn seed_network(&self, name: &str, members: &[&str]) {
		self.lock()
			.networks
			.insert(name.to_string(), members.iter().map(|m| m.to_string()).collect());
	}

	/// A running container left over from an earlier run.
	pub fn seed_container(&self, name: &str) {
		self.lock().containers.insert(name.to_string(), Container {
			id:      format!("id-{name}"),
			spec:    ContainerSpec {
				name:       name.to_string(),
				image:      "stale:latest".to_string(),
				network:    String::new(),
				ipv4:       Ipv4Addr::UNSPECIFIED,
				privileged: false,
				binds:      Vec::new(),
				ports:      Vec::new(),
				env:        Vec::new(),
				command:    None,
			},
			running: true,
		});
	}

	pub fn container(&self, name: &str) -> Option<ContainerSpec> {
		self.lock().containers.get(name).map(|c| c.spec.clone())
	}

	pub fn has_network(&self, name: &str) -> bool {
		self.lock().networks.contains_key(name)
	}

	/// The next removal of `container` fails with `err`.
	pub fn fail_removal(&self, container: &str, err: EngineError) {
		self.lock().removal_failures.insert(container.to_string(), err);
	}

	/// The next `count` network removals report the network as in use.
	pub fn network_conflicts(&self, count: u32) {
		self.lock().network_conflicts = count;
	}

	/// Answer execs (attached and detached) with `handler(container, argv)`.
	pub fn on_exec(&self, handler: impl FnMut(&str, &[String]) -> ExecOutput + Send + 'static) {
		self.lock().exec_handler = Some(Box::new(handler));
	}

	/// Attached execs of `program` never complete.
	pub fn stall_exec(&self, program: &str) {
		self.lock().stalled_programs.push(program.to_string());
	}
}

impl State {
	fn name_of(&self, id_or_name: &str) -> Option<String> {
		if self.containers.contains_key(id_or_name) {
			return Some(id_or_name.to_string());
		}
		self.containers
			.iter()
			.find(|(_, c)| c.id == id_or_name)
			.map(|(name, _)| name.clone())
	}

	fn run(&mut self, id: &str, argv: &[String]) -> Result<ExecOutput, EngineError> {
		let name = self.name_of(id).ok_or_else(|| EngineError::NotFound {
			message: format!("no such container {id}"),
		})?;
		if !self.containers[&name].running {
			return Err(EngineError::Conflict {
				message: format!("container {name} is not running"),
			});
		}
		Ok(match self.exec_handler.as_mut() {
			Some(handler) => handler(&name, argv),
			None => ExecOutput {
				exit_code: 0,
				output:    String::new(),
			},
		})
	}
}

impl ContainerEngine for MockEngine {
	async fn network_members(&self, name: &str) -> Result<Option<Vec<String>>, EngineError> {
		let mut state = self.lock();
		state.calls.push(Call::NetworkMembers(name.to_string()));
		Ok(state.networks.get(name).cloned())
	}

	async fn create_network(&self, spec: &NetworkSpec) -> Result<(), EngineError> {
		let mut state = self.lock();
		state.calls.push(Call::CreateNetwork(spec.clone()));
		if state.networks.contains_key(&spec.name) {
			return Err(EngineError::Conflict {
				message: format!("network {} exists", spec.name),
			});
		}
		state.networks.insert(spec.name.clone(), Vec::new());
		Ok(())
	}

	async fn disconnect_network(&self, network: &str, container: &str) -> Result<(), EngineError> {
		let mut state = self.lock();
		state
			.calls
			.push(Call::DisconnectNetwork(network.to_string(), container.to_string()));
		let members = state.networks.get_mut(network).ok_or_else(|| EngineError::NotFound {
			message: format!("no such network {network}"),
		})?;
		members.retain(|member| member != container);
		Ok(())
	}

	async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
		let mut state = self.lock();
		state.calls.push(Call::RemoveNetwork(name.to_string()));
		let Some(members) = state.networks.get(name) else {
			return Err(EngineError::NotFound {
				message: format!("no such network {name}"),
			});
		};
		if state.network_conflicts > 0 || !members.is_empty() {
			state.network_conflicts = state.network_conflicts.saturating_sub(1);
			return Err(EngineError::Conflict {
				message: format!("network {name} has active endpoints"),
			});
		}
		state.networks.remove(name);
		Ok(())
	}

	async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
		let mut state = self.lock();
		state.calls.push(Call::CreateContainer(spec.clone()));
		if state.containers.contains_key(&spec.name) {
			return Err(EngineError::Conflict {
				message: format!("name {} in use", spec.name),
			});
		}
		let members = state.networks.get_mut(&spec.network).ok_or_else(|| EngineError::NotFound {
			message: format!("no such network {}", spec.network),
		})?;
		members.push(spec.name.clone());
		let id = format!("id-{}", spec.name);
		state.containers.insert(spec.name.clone(), Container {
			id:      id.clone(),
			spec:    spec.clone(),
			running: false,
		});
		Ok(id)
	}

	async fn start_container(&self, id: &str) -> Result<(), EngineError> {
		let mut state = self.lock();
		state.calls.push(Call::StartContainer(id.to_string()));
		let name = state.name_of(id).ok_or_else(|| EngineError::NotFound {
			message: format!("no such container {id}"),
		})?;
		if let Some(container) = state.containers.get_mut(&name) {
			container.running = true;
		}
		Ok(())
	}

	async fn remove_container(&self, name: &str) -> Result<(), EngineError> {
		let mut state = self.lock();
		state.calls.push(Call::RemoveContainer(name.to_string()));
		if let Some(err) = state.removal_failures.remove(name) {
			return Err(err);
		}
		if state.containers.remove(name).is_none() {
			return Err(EngineError::NotFound {
				message: format!("no such container {name}"),
			});
		}
		for members in state.networks.values_mut() {
			members.retain(|member| member != name);
		}
		Ok(())
	}

	async fn inspect_container(&self, name: &str) -> Result<ContainerState, EngineError> {
		let mut state = self.lock();
		state.calls.push(Call::Inspect(name.to_string()));
		let container = state.containers.get(name).ok_or_else(|| EngineError::NotFound {
			message: format!("no such container {name}"),
		})?;
		Ok(ContainerState {
			id:      container.id.clone(),
			running: container.running,
			ipv4:    Some(container.spec.ipv4),
		})
	}

	async fn container_logs(&self, id: &str) -> Result<String, EngineError> {
		let mut state = self.lock();
		state.calls.push(Call::Logs(id.to_string()));
		let name = state.name_of(id).unwrap_or_else(|| id.to_string());
		match state.logs.get(&name) {
			Some(logs) => Ok(logs.clone()),
			None if state.containers.contains_key(&name) => Ok(String::new()),
			None => Err(EngineError::NotFound {
				message: format!("no such container {id}"),
			}),
		}
	}

	async fn exec(&self, id: &str, argv: &[String], env: &[String]) -> Result<ExecOutput, EngineError> {
		let answer = {
			let mut state = self.lock();
			state.calls.push(Call::Exec {
				container: id.to_string(),
				argv:      argv.to_vec(),
				env:       env.to_vec(),
			});
			let stalled = argv
				.first()
				.is_some_and(|program| state.stalled_programs.contains(program));
			(!stalled).then(|| state.run(id, argv))
		};
		match answer {
			Some(res) => res,
			None => std::future::pending().await,
		}
	}

	async fn exec_detached(&self, id: &str, argv: &[String], env: &[String]) -> Result<(), EngineError> {
		let mut state = self.lock();
		state.calls.push(Call::ExecDetached {
			container: id.to_string(),
			argv:      argv.to_vec(),
			env:       env.to_vec(),
		});
		state.run(id, argv).map(|_| ())
	}
}
