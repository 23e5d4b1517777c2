//! VPN-mode lifecycle of the proxy inside the client role.
//!
//! The session keeps no process handle. Whether the proxy runs and whether the
//! tunnel exists is asked of the container every time, so a session can
//! inspect or stop a proxy it did not launch.

use std::{ops::ControlFlow, time::Duration};

use tunprobe_core::{PollPolicy, error, info, poll_until};

use crate::{
	Error, TunnelEstablishFailedSnafu,
	docker::DockerEngine,
	engine::ContainerEngine,
	env::{Environment, Expect},
	exec::{ExecCommand, shell_quote},
	opts::VpnOpts,
};

pub struct VpnSession<'env, E = DockerEngine> {
	env:      &'env Environment<E>,
	opts:     VpnOpts,
	launched: bool,
}

impl<'env, E: ContainerEngine> VpnSession<'env, E> {
	pub fn new(env: &'env Environment<E>, opts: VpnOpts) -> Self {
		Self {
			env,
			opts,
			launched: false,
		}
	}

	pub fn opts(&self) -> &VpnOpts {
		&self.opts
	}

	/// Whether this session issued a start.
	pub fn launched(&self) -> bool {
		self.launched
	}

	fn launch_script(&self) -> String {
		let opts = &self.opts;
		format!(
			"exec {} --vpn --config {} -i {} -p {} {} >> {} 2>&1",
			shell_quote(&opts.binary),
			shell_quote(&opts.config_path.to_string_lossy()),
			shell_quote(&opts.key_path.to_string_lossy()),
			opts.port,
			shell_quote(&opts.destination),
			shell_quote(&opts.log_path.to_string_lossy()),
		)
	}

	fn interrupt_script(&self) -> String {
		format!("pkill -INT -x {} || true", shell_quote(&self.opts.binary))
	}

	fn pgrep(&self) -> ExecCommand {
		ExecCommand::argv(["pgrep", "-x", self.opts.binary.as_str()])
	}

	/// Launch the proxy and wait until both the process and the tunnel
	/// interface are present.
	///
	/// Any instance already running in the role is interrupted first.
	pub async fn start_vpn(&mut self, deadline: Duration) -> Result<(), Error> {
		let role = self.opts.role.as_str();
		self.env.exec_in(role, self.interrupt_script()).await?;

		let log_env = [format!("RUST_LOG={}", self.opts.log_level)];
		self.env
			.exec_detached(role, self.launch_script(), &log_env)
			.await?;
		info!(target: "[VPN] START", "launched {} in {role}, waiting up to {deadline:?} for {}", self.opts.binary, self.opts.tun_name);
		self.launched = true;

		let this = &*self;
		let policy = PollPolicy::new(this.opts.poll_interval, deadline);
		let res = poll_until(policy, move || async move {
			let process_running = match this.is_running().await {
				Ok(running) => running,
				Err(err) => return ControlFlow::Break(Err(err)),
			};
			let interface_present = match this.tunnel_ready().await {
				Ok(present) => present,
				Err(err) => return ControlFlow::Break(Err(err)),
			};
			if process_running && interface_present {
				ControlFlow::Break(Ok(()))
			} else {
				ControlFlow::Continue((process_running, interface_present))
			}
		})
		.await;

		match res {
			Ok(outcome) => {
				if outcome.is_ok() {
					info!(target: "[VPN] START", "tunnel {} is up", this.opts.tun_name);
				}
				outcome
			}
			Err(elapsed) => {
				let (process_running, interface_present) = elapsed.last.unwrap_or((false, false));
				let logs = match tokio::time::timeout(this.opts.poll_interval, this.get_logs()).await {
					Ok(Ok(logs)) => logs,
					Ok(Err(err)) => format!("<proxy log unavailable: {err}>"),
					Err(_) => format!("<proxy log not read within {:?}>", this.opts.poll_interval),
				};
				error!(
					target: "[VPN] START",
					"tunnel not established after {} checks (process running: {process_running}, interface present: {interface_present})",
					elapsed.attempts
				);
				TunnelEstablishFailedSnafu {
					deadline,
					process_running,
					interface_present,
					logs,
				}
				.fail()
			}
		}
	}

	/// Interrupt the proxy and give it the grace period to run its shutdown
	/// hooks. Whether they ran is for the caller to check.
	pub async fn stop_vpn(&mut self) -> Result<(), Error> {
		self.env
			.exec_in(&self.opts.role, self.interrupt_script())
			.await?;
		tokio::time::sleep(self.opts.grace_period).await;
		self.launched = false;
		info!(target: "[VPN] STOP", "interrupted {} in {}", self.opts.binary, self.opts.role);
		Ok(())
	}

	/// Whether a process with exactly the proxy's name runs in the role.
	pub async fn is_running(&self) -> Result<bool, Error> {
		let output = self.env.exec_in(&self.opts.role, self.pgrep()).await?;
		Ok(output.success())
	}

	/// Whether the tunnel interface exists in the role.
	pub async fn tunnel_ready(&self) -> Result<bool, Error> {
		let output = self
			.env
			.exec_in(
				&self.opts.role,
				ExecCommand::argv(["ip", "link", "show", self.opts.tun_name.as_str()]),
			)
			.await?;
		Ok(output.success())
	}

	/// Everything the proxy has logged so far; empty if it never wrote a line.
	pub async fn get_logs(&self) -> Result<String, Error> {
		let script = format!("cat {} 2>/dev/null || true", shell_quote(&self.opts.log_path.to_string_lossy()));
		let output = self.env.exec_in(&self.opts.role, script).await?;
		Ok(output.output)
	}

	/// Poll until no proxy process is left in the role.
	pub async fn wait_stopped(&self, timeout: Duration) -> Result<(), Error> {
		self.env
			.wait_for(&self.opts.role, self.pgrep(), Expect::Failure, timeout)
			.await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		Arc,
		atomic::{AtomicBool, AtomicU32, Ordering},
	};

	use tokio::time::Instant;

	use super::*;
	use crate::{
		exec::ExecOutput,
		mock::{Call, MockEngine},
		opts::EnvOpts,
	};

	/// A pretend proxy: starts on launch, creates the tunnel after
	/// `tun_after` interface checks, exits on interrupt.
	#[derive(Default)]
	struct FakeProxy {
		running:      AtomicBool,
		dies_on_start: bool,
		tun_after:    Option<u32>,
		tun_checks:   AtomicU32,
	}

	impl FakeProxy {
		fn answer(&self, argv: &[String]) -> ExecOutput {
			let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
			let status = |ok: bool| if ok { 0 } else { 1 };
			let (exit_code, output) = match argv.as_slice() {
				["sh", "-c", script] if script.starts_with("pkill") => {
					self.running.store(false, Ordering::SeqCst);
					(0, String::new())
				}
				["sh", "-c", script] if script.starts_with("exec x2ssh") => {
					self.running.store(!self.dies_on_start, Ordering::SeqCst);
					(0, String::new())
				}
				["sh", "-c", script] if script.starts_with("cat") => (0, "INFO x2ssh: connecting to 10.10.0.20:22\n".to_string()),
				["pgrep", "-x", "x2ssh"] => (status(self.running.load(Ordering::SeqCst)), String::new()),
				["ip", "link", "show", "tun-x2ssh"] => {
					let checks = self.tun_checks.fetch_add(1, Ordering::SeqCst) + 1;
					let up = self.running.load(Ordering::SeqCst) && self.tun_after.is_some_and(|after| checks >= after);
					(status(up), String::new())
				}
				other => panic!("unexpected exec {other:?}"),
			};
			ExecOutput { exit_code, output }
		}
	}

	async fn started_env(proxy: Arc<FakeProxy>) -> Environment<MockEngine> {
		let engine = MockEngine::default();
		engine.set_logs("tunprobe-vpn-server", "Server listening on");
		engine.on_exec(move |_, argv| proxy.answer(argv));
		let mut env = Environment::new(engine, EnvOpts {
			proxy_config_dir: None,
			..Default::default()
		});
		env.start().await.unwrap();
		env
	}

	#[test_log::test(tokio::test(start_paused = true))]
	async fn test_start_vpn_waits_for_tunnel() -> eyre::Result<()> {
		let proxy = Arc::new(FakeProxy {
			tun_after: Some(3),
			..Default::default()
		});
		let env = started_env(proxy.clone()).await;
		let mut session = VpnSession::new(&env, VpnOpts::default());

		let started = Instant::now();
		session.start_vpn(Duration::from_secs(30)).await?;
		assert!(session.launched());
		assert_eq!(started.elapsed(), Duration::from_secs(1));

		let launch = env
			.engine()
			.calls()
			.into_iter()
			.find_map(|call| match call {
				Call::ExecDetached { argv, env, .. } => Some((argv, env)),
				_ => None,
			})
			.unwrap();
		assert_eq!(launch.0, [
			"sh",
			"-c",
			"exec x2ssh --vpn --config /etc/x2ssh/config.toml -i /tmp/keys/id_ed25519 -p 22 root@10.10.0.20 >> /tmp/x2ssh.log 2>&1"
		]);
		assert_eq!(launch.1, ["RUST_LOG=info"]);
		Ok(())
	}

	#[test_log::test(tokio::test(start_paused = true))]
	async fn test_start_vpn_interrupts_previous_instance() -> eyre::Result<()> {
		let proxy = Arc::new(FakeProxy {
			tun_after: Some(1),
			..Default::default()
		});
		let env = started_env(proxy).await;
		VpnSession::new(&env, VpnOpts::default())
			.start_vpn(Duration::from_secs(5))
			.await?;

		let scripts: Vec<String> = env
			.engine()
			.calls()
			.into_iter()
			.filter_map(|call| match call {
				Call::Exec { argv, .. } | Call::ExecDetached { argv, .. } if argv[0] == "sh" => Some(argv[2].clone()),
				_ => None,
			})
			.collect();
		assert_eq!(scripts[0], "pkill -INT -x x2ssh || true");
		assert!(scripts[1].starts_with("exec x2ssh --vpn"));
		Ok(())
	}

	#[test_log::test(tokio::test(start_paused = true))]
	async fn test_missing_interface_fails_at_deadline() {
		let proxy = Arc::new(FakeProxy::default());
		let env = started_env(proxy).await;
		let mut session = VpnSession::new(&env, VpnOpts::default());

		let deadline = Duration::from_secs(5);
		let started = Instant::now();
		let err = session.start_vpn(deadline).await.unwrap_err();
		assert!(started.elapsed() <= deadline + session.opts().poll_interval);
		match err {
			Error::TunnelEstablishFailed {
				process_running,
				interface_present,
				logs,
				..
			} => {
				assert!(process_running);
				assert!(!interface_present);
				assert!(logs.contains("connecting to 10.10.0.20:22"));
			}
			other => panic!("unexpected {other:?}"),
		}
	}

	#[test_log::test(tokio::test(start_paused = true))]
	async fn test_wedged_interface_check_fails_at_deadline() {
		let proxy = Arc::new(FakeProxy {
			tun_after: Some(1),
			..Default::default()
		});
		let env = started_env(proxy).await;
		env.engine().stall_exec("ip");
		let mut session = VpnSession::new(&env, VpnOpts::default());

		let deadline = Duration::from_secs(5);
		let started = Instant::now();
		let err = session.start_vpn(deadline).await.unwrap_err();
		assert!(started.elapsed() <= deadline + 2 * session.opts().poll_interval);
		match err {
			Error::TunnelEstablishFailed {
				process_running,
				interface_present,
				..
			} => {
				// the only check never completed
				assert!(!process_running);
				assert!(!interface_present);
			}
			other => panic!("unexpected {other:?}"),
		}
	}

	#[test_log::test(tokio::test(start_paused = true))]
	async fn test_dead_process_is_reported() {
		let proxy = Arc::new(FakeProxy {
			dies_on_start: true,
			tun_after: Some(1),
			..Default::default()
		});
		let env = started_env(proxy).await;
		let err = VpnSession::new(&env, VpnOpts::default())
			.start_vpn(Duration::from_secs(2))
			.await
			.unwrap_err();
		assert!(matches!(
			err,
			Error::TunnelEstablishFailed {
				process_running: false,
				..
			}
		));
	}

	#[test_log::test(tokio::test(start_paused = true))]
	async fn test_stop_vpn_waits_grace_period() -> eyre::Result<()> {
		let proxy = Arc::new(FakeProxy {
			tun_after: Some(1),
			..Default::default()
		});
		let env = started_env(proxy).await;
		let mut session = VpnSession::new(&env, VpnOpts::default());
		session.start_vpn(Duration::from_secs(5)).await?;
		assert!(session.is_running().await?);

		let started = Instant::now();
		session.stop_vpn().await?;
		assert_eq!(started.elapsed(), Duration::from_secs(2));
		assert!(!session.launched());
		assert!(!session.is_running().await?);
		session.wait_stopped(Duration::from_secs(1)).await?;
		Ok(())
	}

	#[test_log::test(tokio::test(start_paused = true))]
	async fn test_probes_do_not_depend_on_launcher() -> eyre::Result<()> {
		let proxy = Arc::new(FakeProxy {
			tun_after: Some(1),
			..Default::default()
		});
		proxy.running.store(true, Ordering::SeqCst);
		let env = started_env(proxy).await;
		let session = VpnSession::new(&env, VpnOpts::default());
		assert!(!session.launched());
		assert!(session.is_running().await?);
		assert!(session.tunnel_ready().await?);
		assert!(session.get_logs().await?.contains("x2ssh"));
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn test_session_needs_live_environment() {
		let env = Environment::new(MockEngine::default(), EnvOpts::default());
		let mut session = VpnSession::new(&env, VpnOpts::default());
		let err = session.start_vpn(Duration::from_secs(1)).await.unwrap_err();
		assert!(matches!(err, Error::ContainerNotRunning { .. }));
		assert!(!session.launched());
	}
}
