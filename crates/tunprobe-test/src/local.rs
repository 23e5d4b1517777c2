//! In-process stand-ins for the services of the container topology, so
//! scenarios can run without Docker.

use std::net::{Ipv4Addr, SocketAddr};

use fast_socks5::{
	ReplyError, Socks5Command,
	server::Socks5ServerProtocol,
	util::target_addr::TargetAddr,
};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, TcpStream},
	task::JoinHandle,
};
use tunprobe_core::{debug, warn};

/// TCP echo on an ephemeral loopback port. Each connection is echoed until
/// the peer closes its write side.
pub async fn spawn_tcp_echo() -> eyre::Result<(SocketAddr, JoinHandle<()>)> {
	let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
	let addr = listener.local_addr()?;
	let handle = tokio::spawn(async move {
		while let Ok((mut stream, _)) = listener.accept().await {
			tokio::spawn(async move {
				let (mut reader, mut writer) = stream.split();
				let mut buf = [0u8; 8192];
				loop {
					let n = match reader.read(&mut buf).await {
						Ok(0) | Err(_) => break,
						Ok(n) => n,
					};
					if writer.write_all(&buf[..n]).await.is_err() {
						break;
					}
				}
				let _ = writer.shutdown().await;
			});
		}
	});
	Ok((addr, handle))
}

/// No-auth SOCKS5 server that relays CONNECT requests directly, standing in
/// for the forward mode of the proxy.
pub async fn spawn_socks5_relay() -> eyre::Result<(SocketAddr, JoinHandle<()>)> {
	let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
	let addr = listener.local_addr()?;
	let handle = tokio::spawn(async move {
		while let Ok((stream, peer)) = listener.accept().await {
			tokio::spawn(async move {
				if let Err(err) = relay(stream).await {
					warn!(target: "[RELAY]", "{peer}: {err}");
				}
			});
		}
	});
	Ok((addr, handle))
}

async fn relay(stream: TcpStream) -> eyre::Result<()> {
	let (proto, cmd, target) = Socks5ServerProtocol::accept_no_auth(stream)
		.await?
		.read_command()
		.await?;
	if !matches!(cmd, Socks5Command::TCPConnect) {
		proto.reply_error(&ReplyError::CommandNotSupported).await?;
		eyre::bail!("only CONNECT is relayed");
	}

	let upstream = match &target {
		TargetAddr::Ip(addr) => TcpStream::connect(*addr).await,
		TargetAddr::Domain(domain, port) => TcpStream::connect((domain.as_str(), *port)).await,
	};
	let mut upstream = match upstream {
		Ok(upstream) => upstream,
		Err(err) => {
			proto.reply_error(&ReplyError::ConnectionRefused).await?;
			return Err(err.into());
		}
	};

	let bound = upstream.local_addr()?;
	let mut inner = proto.reply_success(bound).await?;
	debug!(target: "[RELAY]", "relaying to {target:?}");
	tokio::io::copy_bidirectional(&mut inner, &mut upstream).await?;
	Ok(())
}
