//! The proxy in forward mode, run as a local child process.

use std::{io, ops::ControlFlow, process::Stdio};

use snafu::ResultExt;
use tokio::{
	net::TcpStream,
	process::{Child, Command},
	time::timeout,
};
use tunprobe_core::{Endpoint, PollPolicy, debug, info, poll_until, warn};

use crate::{Error, ForwardProxySnafu, opts::ForwardOpts};

/// A running forward-mode proxy. Killed on drop if not stopped.
#[derive(Debug)]
pub struct ForwardProxy {
	child: Child,
	opts:  ForwardOpts,
}

impl ForwardProxy {
	/// Spawn `<binary> -D <listen> -p <port> -i <key> <destination>` and wait
	/// until the SOCKS5 port accepts connections.
	pub async fn spawn(opts: ForwardOpts) -> Result<Self, Error> {
		let child = Command::new(&opts.binary)
			.arg("-D")
			.arg(opts.listen.to_string())
			.arg("-p")
			.arg(opts.ssh_port.to_string())
			.arg("-i")
			.arg(&opts.key_path)
			.arg(&opts.destination)
			.env("RUST_LOG", &opts.log_level)
			.stdin(Stdio::null())
			.kill_on_drop(true)
			.spawn()
			.context(ForwardProxySnafu {
				detail: format!("cannot spawn {}", opts.binary.display()),
			})?;
		let mut proxy = Self { child, opts };

		if let Err(err) = proxy.wait_listening().await {
			let _ = proxy.child.start_kill();
			let _ = proxy.child.wait().await;
			return Err(err);
		}
		info!(target: "[FWD] START", "forward proxy pid {:?} listening on {}", proxy.child.id(), proxy.opts.listen);
		Ok(proxy)
	}

	async fn wait_listening(&mut self) -> Result<(), Error> {
		let policy = PollPolicy::new(self.opts.poll_interval, self.opts.ready_timeout);
		let host = self.opts.listen.host();
		let port = self.opts.listen.port();
		let child = &mut self.child;

		let res = poll_until(policy, || {
			let exited = child.try_wait();
			async move {
				match exited {
					Ok(Some(status)) => return ControlFlow::Break(Err(io::Error::other(format!("exited early with {status}")))),
					Ok(None) => {}
					Err(err) => return ControlFlow::Break(Err(err)),
				}
				match TcpStream::connect((host, port)).await {
					Ok(_) => ControlFlow::Break(Ok(())),
					Err(err) => ControlFlow::Continue(err),
				}
			}
		})
		.await;

		match res {
			Ok(outcome) => outcome.context(ForwardProxySnafu {
				detail: format!("{} did not start", self.opts.binary.display()),
			}),
			Err(elapsed) => Err(elapsed
				.last
				.unwrap_or_else(|| io::Error::from(io::ErrorKind::TimedOut)))
			.context(ForwardProxySnafu {
				detail: format!("{} not accepting connections within {:?}", self.opts.listen, policy.timeout),
			}),
		}
	}

	pub fn endpoint(&self) -> &Endpoint {
		&self.opts.listen
	}

	pub fn pid(&self) -> Option<u32> {
		self.child.id()
	}

	/// Interrupt, wait out the grace period, then kill.
	pub async fn stop(mut self) -> Result<(), Error> {
		let Some(pid) = self.child.id() else {
			// already reaped
			return Ok(());
		};
		let interrupted = Command::new("kill")
			.args(["-INT", &pid.to_string()])
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.status()
			.await;
		if let Err(err) = interrupted {
			debug!(target: "[FWD] STOP", "cannot interrupt pid {pid}: {err}");
		}

		match timeout(self.opts.grace_period, self.child.wait()).await {
			Ok(status) => {
				let status = status.context(ForwardProxySnafu {
					detail: format!("cannot reap pid {pid}"),
				})?;
				info!(target: "[FWD] STOP", "forward proxy pid {pid} exited with {status}");
			}
			Err(_) => {
				warn!(target: "[FWD] STOP", "pid {pid} ignored SIGINT for {:?}, killing", self.opts.grace_period);
				self.child.kill().await.context(ForwardProxySnafu {
					detail: format!("cannot kill pid {pid}"),
				})?;
			}
		}
		Ok(())
	}
}
