//! [`ContainerEngine`] over the local Docker daemon.

use std::{collections::HashMap, net::Ipv4Addr, ops::ControlFlow, pin::pin, time::Duration};

use bollard::{
	Docker,
	container::{
		Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions, NetworkingConfig, RemoveContainerOptions,
		StartContainerOptions,
	},
	errors::Error as DockerError,
	exec::{CreateExecOptions, StartExecOptions, StartExecResults},
	models::{EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig, PortBinding},
	network::{CreateNetworkOptions, DisconnectNetworkOptions, InspectNetworkOptions},
};
use futures_util::StreamExt as _;
use tunprobe_core::{PollPolicy, poll_until, warn};

use crate::{
	engine::{ContainerEngine, ContainerSpec, ContainerState, EngineError, NetworkSpec},
	exec::ExecOutput,
};

#[derive(Debug, Clone)]
pub struct DockerEngine {
	docker: Docker,
}

impl DockerEngine {
	/// Socket or named pipe from `DOCKER_HOST`, else the platform default.
	pub fn connect() -> Result<Self, EngineError> {
		let docker = Docker::connect_with_local_defaults().map_err(classify)?;
		Ok(Self { docker })
	}

	pub fn from_client(docker: Docker) -> Self {
		Self { docker }
	}
}

fn classify(err: DockerError) -> EngineError {
	match err {
		DockerError::DockerResponseServerError {
			status_code: 404,
			message,
		} => EngineError::NotFound { message },
		DockerError::DockerResponseServerError {
			status_code: 409,
			message,
		} => EngineError::Conflict { message },
		source => EngineError::Docker { source },
	}
}

const EXIT_CODE_POLICY: PollPolicy = PollPolicy::new(Duration::from_millis(50), Duration::from_secs(1));

/// Exit code of a finished exec, `None` while the daemon still reports it
/// running. A stopped exec without a code was lost by the daemon.
fn settled_exit_code(running: Option<bool>, exit_code: Option<i64>) -> Option<i64> {
	match (running, exit_code) {
		(_, Some(code)) => Some(code),
		(Some(true), None) => None,
		(_, None) => Some(-1),
	}
}

impl ContainerEngine for DockerEngine {
	async fn network_members(&self, name: &str) -> Result<Option<Vec<String>>, EngineError> {
		match self
			.docker
			.inspect_network(name, None::<InspectNetworkOptions<String>>)
			.await
		{
			Ok(network) => {
				let members = network
					.containers
					.unwrap_or_default()
					.into_iter()
					.map(|(id, container)| container.name.unwrap_or(id))
					.collect();
				Ok(Some(members))
			}
			Err(err) => match classify(err) {
				EngineError::NotFound { .. } => Ok(None),
				other => Err(other),
			},
		}
	}

	async fn create_network(&self, spec: &NetworkSpec) -> Result<(), EngineError> {
		let options = CreateNetworkOptions {
			name: spec.name.clone(),
			driver: "bridge".to_string(),
			ipam: Ipam {
				config: Some(vec![IpamConfig {
					subnet: Some(spec.subnet.to_string()),
					..Default::default()
				}]),
				..Default::default()
			},
			..Default::default()
		};
		self.docker.create_network(options).await.map_err(classify)?;
		Ok(())
	}

	async fn disconnect_network(&self, network: &str, container: &str) -> Result<(), EngineError> {
		self.docker
			.disconnect_network(network, DisconnectNetworkOptions {
				container: container.to_string(),
				force:     true,
			})
			.await
			.map_err(classify)
	}

	async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
		self.docker.remove_network(name).await.map_err(classify)
	}

	async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
		let mut exposed_ports = HashMap::new();
		let mut port_bindings = HashMap::new();
		for port in &spec.ports {
			exposed_ports.insert(port.container_key(), HashMap::new());
			port_bindings.insert(
				port.container_key(),
				Some(vec![PortBinding {
					host_ip:   None,
					host_port: Some(port.host.to_string()),
				}]),
			);
		}

		let endpoint = EndpointSettings {
			ipam_config: Some(EndpointIpamConfig {
				ipv4_address: Some(spec.ipv4.to_string()),
				..Default::default()
			}),
			..Default::default()
		};

		let config = Config {
			image: Some(spec.image.clone()),
			env: Some(spec.env.clone()),
			cmd: spec.command.clone(),
			exposed_ports: Some(exposed_ports),
			host_config: Some(HostConfig {
				privileged: Some(spec.privileged),
				binds: Some(spec.binds.clone()),
				port_bindings: Some(port_bindings),
				network_mode: Some(spec.network.clone()),
				..Default::default()
			}),
			networking_config: Some(NetworkingConfig {
				endpoints_config: HashMap::from([(spec.network.clone(), endpoint)]),
			}),
			..Default::default()
		};

		let response = self
			.docker
			.create_container(
				Some(CreateContainerOptions {
					name:     spec.name.clone(),
					platform: None,
				}),
				config,
			)
			.await
			.map_err(classify)?;
		Ok(response.id)
	}

	async fn start_container(&self, id: &str) -> Result<(), EngineError> {
		self.docker
			.start_container(id, None::<StartContainerOptions<String>>)
			.await
			.map_err(classify)
	}

	async fn remove_container(&self, name: &str) -> Result<(), EngineError> {
		self.docker
			.remove_container(
				name,
				Some(RemoveContainerOptions {
					force: true,
					..Default::default()
				}),
			)
			.await
			.map_err(classify)
	}

	async fn inspect_container(&self, name: &str) -> Result<ContainerState, EngineError> {
		let info = self
			.docker
			.inspect_container(name, None::<InspectContainerOptions>)
			.await
			.map_err(classify)?;
		let running = info.state.and_then(|state| state.running).unwrap_or(false);
		let ipv4 = info
			.network_settings
			.and_then(|settings| settings.networks)
			.and_then(|networks| {
				networks
					.into_values()
					.filter_map(|endpoint| endpoint.ip_address)
					.find_map(|ip| ip.parse::<Ipv4Addr>().ok())
			});
		Ok(ContainerState {
			id: info.id.unwrap_or_else(|| name.to_string()),
			running,
			ipv4,
		})
	}

	async fn container_logs(&self, id: &str) -> Result<String, EngineError> {
		let mut stream = pin!(self.docker.logs(
			id,
			Some(LogsOptions::<String> {
				stdout: true,
				stderr: true,
				..Default::default()
			}),
		));
		let mut logs = String::new();
		while let Some(chunk) = stream.next().await {
			let chunk = chunk.map_err(classify)?;
			logs.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
		}
		Ok(logs)
	}

	async fn exec(&self, id: &str, argv: &[String], env: &[String]) -> Result<ExecOutput, EngineError> {
		let exec = self
			.docker
			.create_exec(id, CreateExecOptions {
				cmd: Some(argv.to_vec()),
				env: Some(env.to_vec()),
				attach_stdout: Some(true),
				attach_stderr: Some(true),
				..Default::default()
			})
			.await
			.map_err(classify)?;

		let mut output = String::new();
		match self
			.docker
			.start_exec(&exec.id, Some(StartExecOptions {
				detach: false,
				..Default::default()
			}))
			.await
			.map_err(classify)?
		{
			StartExecResults::Attached { output: mut stream, .. } => {
				while let Some(chunk) = stream.next().await {
					match chunk.map_err(classify)? {
						LogOutput::StdOut { message } | LogOutput::StdErr { message } | LogOutput::Console { message } => {
							output.push_str(&String::from_utf8_lossy(&message));
						}
						LogOutput::StdIn { .. } => {}
					}
				}
			}
			StartExecResults::Detached => {}
		}

		// the daemon may still report the exec running right after its output closes
		let docker = &self.docker;
		let exec_id = exec.id.as_str();
		let settled = poll_until(EXIT_CODE_POLICY, move || async move {
			match docker.inspect_exec(exec_id).await {
				Ok(inspect) => match settled_exit_code(inspect.running, inspect.exit_code) {
					Some(code) => ControlFlow::Break(Ok(code)),
					None => ControlFlow::Continue(()),
				},
				Err(err) => ControlFlow::Break(Err(classify(err))),
			}
		})
		.await;
		let exit_code = match settled {
			Ok(code) => code?,
			Err(elapsed) => {
				warn!(target: "[DOCKER] EXEC", "exec {exec_id} in {id} still running after {:?}", elapsed.waited);
				-1
			}
		};
		Ok(ExecOutput { exit_code, output })
	}

	async fn exec_detached(&self, id: &str, argv: &[String], env: &[String]) -> Result<(), EngineError> {
		let exec = self
			.docker
			.create_exec(id, CreateExecOptions {
				cmd: Some(argv.to_vec()),
				env: Some(env.to_vec()),
				attach_stdout: Some(false),
				attach_stderr: Some(false),
				..Default::default()
			})
			.await
			.map_err(classify)?;
		self.docker
			.start_exec(&exec.id, Some(StartExecOptions {
				detach: true,
				..Default::default()
			}))
			.await
			.map_err(classify)?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_exit_code_waits_while_running() {
		assert_eq!(settled_exit_code(Some(true), None), None);
		assert_eq!(settled_exit_code(Some(false), Some(3)), Some(3));
		assert_eq!(settled_exit_code(None, Some(0)), Some(0));
	}

	#[test]
	fn test_lost_exec_reports_minus_one() {
		assert_eq!(settled_exit_code(Some(false), None), Some(-1));
		assert_eq!(settled_exit_code(None, None), Some(-1));
	}
}
