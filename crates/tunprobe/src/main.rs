use std::time::{Duration, Instant};

use clap::{CommandFactory as _, Parser as _};
use eyre::ensure;
use tunprobe_core::{info, warn};
use tunprobe_env::{Environment, ExecCommand, ForwardProxy, VpnSession, opts::SERVER_ROLE};
use tunprobe_test::{
	concurrent_echo, default_route_via_tun, echo_round_trip, ip_forward_enabled, masquerade_present, random_payload,
};

use crate::{
	cli::{Cli, Commands},
	conf::{persistent::PersistentConfig, runtime::Config},
};

mod cli;
mod conf;
mod log;

#[tokio::main]
async fn main() -> eyre::Result<()> {
	color_eyre::install()?;
	let cli = Cli::parse();
	log::init_log(cli.log_level)?;

	if cli.version {
		const VER: &str = match option_env!("TUNPROBE_OVERRIDE_VERSION") {
			Some(v) => v,
			None => env!("CARGO_PKG_VERSION"),
		};
		println!("tunprobe {VER}");
		return Ok(());
	}
	if let Some(work_dir) = &cli.work_dir {
		std::env::set_current_dir(work_dir)?;
	}

	let Some(command) = cli.command else {
		Cli::command().print_help()?;
		return Ok(());
	};

	if let Commands::Init { format, output } = &command {
		let path = output.clone().unwrap_or_else(|| {
			cli.config_dir
				.clone()
				.unwrap_or_default()
				.join(format!("config.{}", format.extension()))
		});
		PersistentConfig::default().export_to_file(&path, *format)?;
		info!(target: "[MAIN]", "default configuration written to {}", path.display());
		return Ok(());
	}

	let config = Config::from_persist(PersistentConfig::load(cli.config, cli.config_dir)?);
	run(command, config).await
}

async fn run(command: Commands, config: Config) -> eyre::Result<()> {
	match command {
		Commands::Init { .. } => Ok(()),
		Commands::Up => up(config).await,
		Commands::Down => {
			let mut env = Environment::docker(config.env)?;
			env.stop().await.into_result()?;
			Ok(())
		}
		Commands::Exec { role, shell, command } => {
			let env = attached(config).await?;
			let command = if shell {
				ExecCommand::Shell(command.join(" "))
			} else {
				ExecCommand::Argv(command)
			};
			let output = env.exec_in(&role, command).await?;
			print!("{}", output.output);
			if !output.success() {
				std::process::exit(i32::try_from(output.exit_code).unwrap_or(1));
			}
			Ok(())
		}
		Commands::Logs { role } => {
			let env = Environment::docker(config.env)?;
			print!("{}", env.logs(&role).await?);
			Ok(())
		}
		Commands::VpnUp { deadline } => {
			let deadline = deadline.map(Duration::from_secs).unwrap_or(config.vpn.deadline);
			let vpn = config.vpn.clone();
			let env = attached(config).await?;
			let mut session = VpnSession::new(&env, vpn);
			if let Err(err) = session.start_vpn(deadline).await {
				if let tunprobe_env::Error::TunnelEstablishFailed { logs, .. } = &err {
					eprintln!("--- proxy log ---\n{logs}");
				}
				return Err(err.into());
			}
			println!("tunnel {} up in {}", session.opts().tun_name, session.opts().role);
			Ok(())
		}
		Commands::VpnDown { wait } => {
			let vpn = config.vpn.clone();
			let env = attached(config).await?;
			let mut session = VpnSession::new(&env, vpn);
			session.stop_vpn().await?;
			if let Some(secs) = wait {
				session.wait_stopped(Duration::from_secs(secs)).await?;
			}
			Ok(())
		}
		Commands::VpnStatus => vpn_status(config).await,
		Commands::VpnLogs => {
			let vpn = config.vpn.clone();
			let env = attached(config).await?;
			print!("{}", VpnSession::new(&env, vpn).get_logs().await?);
			Ok(())
		}
		Commands::SocksEcho {
			host,
			port,
			size,
			clients,
		} => {
			let client = config.socks_client();
			let host = host.unwrap_or_else(|| config.socks.echo_host.clone());
			let port = port.unwrap_or(config.socks.echo_port);
			let started = Instant::now();
			if clients > 1 {
				concurrent_echo(&client, &host, port, clients, size, config.socks.deadline).await?;
			} else {
				let payload = random_payload(size);
				let echoed = echo_round_trip(&client, &host, port, &payload, config.socks.deadline).await?;
				ensure!(echoed == payload, "echo through {} came back altered", client.endpoint());
			}
			println!(
				"{clients} x {size} bytes echoed by {host}:{port} via {} in {:?}",
				client.endpoint(),
				started.elapsed()
			);
			Ok(())
		}
		Commands::Forward => {
			let proxy = ForwardProxy::spawn(config.forward).await?;
			println!("forward proxy listening on {}, Ctrl-C to stop", proxy.endpoint());
			tokio::signal::ctrl_c().await?;
			proxy.stop().await?;
			Ok(())
		}
	}
}

async fn attached(config: Config) -> eyre::Result<Environment> {
	let mut env = Environment::docker(config.env)?;
	env.attach().await?;
	Ok(env)
}

async fn up(config: Config) -> eyre::Result<()> {
	let mut env = Environment::docker(config.env)?;
	if let Err(err) = env.start().await {
		let report = env.stop().await;
		if !report.is_clean() {
			warn!(target: "[MAIN]", "cleanup after failed start incomplete: {report}");
		}
		return Err(err.into());
	}
	for role in &env.opts().roles {
		if let Some(handle) = env.handle(&role.name) {
			println!("{}\t{}\t{}", role.name, handle.name, handle.ipv4);
		}
	}
	Ok(())
}

async fn vpn_status(config: Config) -> eyre::Result<()> {
	let vpn = config.vpn.clone();
	let env = attached(config).await?;
	let session = VpnSession::new(&env, vpn);
	let role = &session.opts().role;

	let yes_no = |flag: bool| if flag { "yes" } else { "no" };
	println!("process running:    {}", yes_no(session.is_running().await?));
	println!("tunnel interface:   {}", yes_no(session.tunnel_ready().await?));
	println!(
		"default route:      {}",
		yes_no(default_route_via_tun(&env, role, &session.opts().tun_name).await?)
	);
	println!("server forwarding:  {}", yes_no(ip_forward_enabled(&env, SERVER_ROLE).await?));
	println!("server masquerade:  {}", yes_no(masquerade_present(&env, SERVER_ROLE).await?));
	Ok(())
}
