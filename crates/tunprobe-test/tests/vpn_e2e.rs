//! The proxy in VPN mode between two containers. All tests need Docker, the
//! `x2ssh-vpn-server` / `x2ssh-vpn-client` images and a release build of the
//! proxy at `target/release/x2ssh`.

use std::time::Duration;

use tunprobe_env::{
	EnvOpts, Environment, Error, ExecCommand, Expect, VpnOpts, VpnSession,
	opts::{CLIENT_ROLE, SERVER_ROLE},
};
use tunprobe_test::{
	binary_executable, default_route_via_tun, ip_forward_enabled, masquerade_present, ssh_reachable, sshd_running,
	tcp_echo_in, tools_present, tun_device_accessible, vpn_udp_echo, with_environment,
};

const MASQUERADE_RULE: &str = "iptables -t nat -S POSTROUTING | grep -q MASQUERADE";

#[test_log::test(tokio::test(flavor = "multi_thread"))]
#[ignore = "requires docker"]
async fn test_environment_comes_up_and_down() -> eyre::Result<()> {
	let mut env = Environment::docker(EnvOpts::default())?;

	with_environment(&mut env, async |env: &Environment| {
		assert!(tools_present(env, CLIENT_ROLE, &["ip", "iptables", "nc", "ping", "ssh"]).await?);
		assert!(sshd_running(env, SERVER_ROLE).await?);
		assert!(ssh_reachable(env, CLIENT_ROLE, &VpnOpts::default()).await?);
		for role in [CLIENT_ROLE, SERVER_ROLE] {
			assert!(tun_device_accessible(env, role).await?, "/dev/net/tun missing in {role}");
		}
		assert!(binary_executable(env, CLIENT_ROLE, "/usr/local/bin/x2ssh").await?);

		let server_ip = env.role_ip(SERVER_ROLE).ok_or_else(|| eyre::eyre!("no server role"))?;
		let echoed = tcp_echo_in(env, CLIENT_ROLE, server_ip, 8080, "plain tcp").await?;
		assert_eq!(echoed.trim(), "plain tcp");

		let uname = env.exec_in(CLIENT_ROLE, ExecCommand::argv(["uname", "-s"])).await?;
		assert!(uname.success());
		assert_eq!(uname.output.trim(), "Linux");
		eyre::Ok(())
	})
	.await?;

	// a second teardown finds nothing and stays quiet
	env.stop().await.into_result()?;
	Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
#[ignore = "requires docker"]
async fn test_vpn_round_trip() -> eyre::Result<()> {
	let mut env = Environment::docker(EnvOpts::default())?;

	with_environment(&mut env, async |env: &Environment| {
		let opts = VpnOpts::default();
		let mut session = VpnSession::new(env, opts.clone());
		session.start_vpn(Duration::from_secs(30)).await?;

		let link = env
			.exec_in(CLIENT_ROLE, ExecCommand::argv(["ip", "link", "show", opts.tun_name.as_str()]))
			.await?;
		assert!(link.success(), "tunnel interface missing: {}", link.output);
		assert!(default_route_via_tun(env, CLIENT_ROLE, &opts.tun_name).await?);
		assert!(ip_forward_enabled(env, SERVER_ROLE).await?);
		assert!(masquerade_present(env, SERVER_ROLE).await?);

		let echoed = vpn_udp_echo(env, CLIENT_ROLE, opts.server_tun_ip, 8081, "vpn_test").await?;
		assert_eq!(echoed.trim(), "vpn_test");

		session.stop_vpn().await?;
		session.wait_stopped(Duration::from_secs(10)).await?;
		env.wait_for(SERVER_ROLE, MASQUERADE_RULE, Expect::Failure, Duration::from_secs(10))
			.await?;
		assert!(!session.launched());
		eyre::Ok(())
	})
	.await
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
#[ignore = "requires docker"]
async fn test_unreachable_server_fails_within_deadline() -> eyre::Result<()> {
	let mut env = Environment::docker(EnvOpts::default())?;

	with_environment(&mut env, async |env: &Environment| {
		let opts = VpnOpts {
			destination: "root@10.10.0.99".to_string(),
			..Default::default()
		};
		let poll = opts.poll_interval;
		let deadline = Duration::from_secs(5);
		let mut session = VpnSession::new(env, opts);

		let started = tokio::time::Instant::now();
		let err = session.start_vpn(deadline).await.unwrap_err();
		// each poll is a pair of container execs, so allow for their latency
		assert!(started.elapsed() < deadline + poll + Duration::from_secs(5));
		match err {
			Error::TunnelEstablishFailed {
				interface_present, ..
			} => assert!(!interface_present),
			other => panic!("unexpected {other:?}"),
		}
		session.stop_vpn().await?;
		eyre::Ok(())
	})
	.await
}
