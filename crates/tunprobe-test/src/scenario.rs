//! Checks shared by the end-to-end tests and the CLI.
//!
//! Forward-mode checks talk SOCKS5 from the host. VPN-mode checks run shell
//! one-liners inside a role container and interpret the exit status.

use std::{net::Ipv4Addr, time::Duration};

use eyre::{Context as _, ensure};
use futures_util::future::try_join;
use rand::Rng as _;
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	task::JoinSet,
	time::timeout,
};
use tunprobe_core::{debug, info};
use tunprobe_env::{ContainerEngine, Environment, ExecCommand, VpnOpts, exec::shell_quote};
use tunprobe_socks::Socks5Client;

pub fn random_payload(len: usize) -> Vec<u8> {
	let mut payload = vec![0u8; len];
	rand::rng().fill(payload.as_mut_slice());
	payload
}

/// Send `payload` through a CONNECT tunnel to an echo service and return
/// what came back. Writing and reading overlap so large payloads cannot
/// stall on full socket buffers.
pub async fn echo_round_trip(
	client: &Socks5Client,
	target_host: &str,
	target_port: u16,
	payload: &[u8],
	deadline: Duration,
) -> eyre::Result<Vec<u8>> {
	let stream = client.connect(target_host, target_port).await?;
	let (mut reader, mut writer) = stream.into_split();

	let write = async {
		writer.write_all(payload).await?;
		writer.flush().await
	};
	let read = async {
		let mut echoed = vec![0u8; payload.len()];
		reader.read_exact(&mut echoed).await?;
		std::io::Result::Ok(echoed)
	};
	let ((), echoed) = timeout(deadline, try_join(write, read))
		.await
		.wrap_err_with(|| format!("echo of {} bytes not complete within {deadline:?}", payload.len()))?
		.wrap_err("echo stream failed")?;

	debug!(target: "[SCENARIO] ECHO", "{} bytes echoed by {target_host}:{target_port}", echoed.len());
	Ok(echoed)
}

/// Run `clients` round trips at once, each with its own tagged payload of
/// `payload_len` random bytes, and check that every connection got exactly
/// its own bytes back.
pub async fn concurrent_echo(
	client: &Socks5Client,
	target_host: &str,
	target_port: u16,
	clients: usize,
	payload_len: usize,
	deadline: Duration,
) -> eyre::Result<()> {
	let mut set = JoinSet::new();
	for i in 0..clients {
		let client = client.clone();
		let target_host = target_host.to_string();
		set.spawn(async move {
			let mut payload = format!("client-{i}:").into_bytes();
			payload.extend(random_payload(payload_len));
			let echoed = echo_round_trip(&client, &target_host, target_port, &payload, deadline).await?;
			ensure!(echoed == payload, "client {i} received another connection's bytes");
			eyre::Ok(i)
		});
	}

	let mut finished = 0;
	while let Some(res) = set.join_next().await {
		let i = res.wrap_err("echo task panicked")??;
		debug!(target: "[SCENARIO] ECHO", "client {i} verified");
		finished += 1;
	}
	ensure!(finished == clients, "{finished} of {clients} clients finished");
	info!(target: "[SCENARIO] ECHO", "{clients} concurrent tunnels isolated");
	Ok(())
}

/// `text` through the TCP echo service at `host:port`, sent from `role`.
pub async fn tcp_echo_in<E: ContainerEngine>(
	env: &Environment<E>,
	role: &str,
	host: Ipv4Addr,
	port: u16,
	text: &str,
) -> eyre::Result<String> {
	let script = format!("printf '%s\\n' {} | nc -w 2 {host} {port}", shell_quote(text));
	let output = env.exec_in(role, script).await?;
	ensure!(output.success(), "nc to {host}:{port} exited with {}: {}", output.exit_code, output.output);
	Ok(output.output)
}

/// One UDP datagram to `host:port` from `role`; returns whatever arrived
/// back within two seconds.
pub async fn vpn_udp_echo<E: ContainerEngine>(
	env: &Environment<E>,
	role: &str,
	host: Ipv4Addr,
	port: u16,
	payload: &str,
) -> eyre::Result<String> {
	let script = format!("printf '%s' {} | nc -u -w 2 {host} {port}", shell_quote(payload));
	let output = env.exec_in(role, script).await?;
	ensure!(output.success(), "nc -u to {host}:{port} exited with {}: {}", output.exit_code, output.output);
	Ok(output.output)
}

/// Whether the NAT table of `role` holds a MASQUERADE rule.
pub async fn masquerade_present<E: ContainerEngine>(env: &Environment<E>, role: &str) -> eyre::Result<bool> {
	let output = env
		.exec_in(role, "iptables -t nat -S POSTROUTING | grep -q MASQUERADE")
		.await?;
	Ok(output.success())
}

/// Whether the default route of `role` leaves through `tun`.
pub async fn default_route_via_tun<E: ContainerEngine>(env: &Environment<E>, role: &str, tun: &str) -> eyre::Result<bool> {
	let output = env.exec_in(role, "ip route show default").await?;
	ensure!(output.success(), "ip route failed: {}", output.output);
	let device = format!("dev {tun}");
	Ok(output
		.output
		.lines()
		.any(|line| line.split_whitespace().collect::<Vec<_>>().join(" ").contains(&device)))
}

pub async fn ip_forward_enabled<E: ContainerEngine>(env: &Environment<E>, role: &str) -> eyre::Result<bool> {
	let output = env.exec_in(role, "sysctl -n net.ipv4.ip_forward").await?;
	ensure!(output.success(), "sysctl failed: {}", output.output);
	Ok(output.output.trim() == "1")
}

/// Whether every one of `tools` resolves on the `PATH` of `role`.
pub async fn tools_present<E: ContainerEngine>(env: &Environment<E>, role: &str, tools: &[&str]) -> eyre::Result<bool> {
	let argv = std::iter::once("which").chain(tools.iter().copied());
	let output = env.exec_in(role, ExecCommand::argv(argv)).await?;
	if !output.success() {
		debug!(target: "[SCENARIO] TOOLS", "which in {role} exited with {}: {}", output.exit_code, output.output);
	}
	Ok(output.success())
}

pub async fn sshd_running<E: ContainerEngine>(env: &Environment<E>, role: &str) -> eyre::Result<bool> {
	let output = env.exec_in(role, ExecCommand::argv(["pgrep", "sshd"])).await?;
	Ok(output.success())
}

/// Whether `role` logs into the proxy's SSH destination with the proxy's key,
/// non-interactively.
pub async fn ssh_reachable<E: ContainerEngine>(env: &Environment<E>, role: &str, vpn: &VpnOpts) -> eyre::Result<bool> {
	let port = vpn.port.to_string();
	let key = vpn.key_path.to_string_lossy();
	let argv: [&str; 13] = [
		"ssh",
		"-i",
		&key,
		"-p",
		&port,
		"-o",
		"StrictHostKeyChecking=no",
		"-o",
		"BatchMode=yes",
		"-o",
		"ConnectTimeout=5",
		&vpn.destination,
		"echo ssh_ok",
	];
	let output = env.exec_in(role, ExecCommand::argv(argv)).await?;
	let reachable = output.success() && output.output.contains("ssh_ok");
	if !reachable {
		debug!(target: "[SCENARIO] SSH", "ssh from {role} to {} failed: {}", vpn.destination, output.output);
	}
	Ok(reachable)
}

/// Whether `/dev/net/tun` exists in `role` as a character device.
pub async fn tun_device_accessible<E: ContainerEngine>(env: &Environment<E>, role: &str) -> eyre::Result<bool> {
	let output = env
		.exec_in(role, ExecCommand::argv(["test", "-c", "/dev/net/tun"]))
		.await?;
	Ok(output.success())
}

pub async fn binary_executable<E: ContainerEngine>(env: &Environment<E>, role: &str, path: &str) -> eyre::Result<bool> {
	let output = env.exec_in(role, ExecCommand::argv(["test", "-x", path])).await?;
	Ok(output.success())
}
