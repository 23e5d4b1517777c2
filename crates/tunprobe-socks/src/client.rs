//! SOCKS5 client used to drive the forward mode of the proxy under test.
//!
//! Every `connect` opens its own TCP connection and returns it once the proxy
//! has accepted the CONNECT; from then on the stream is a plain duplex pipe to
//! the target. Nothing is shared between calls, so one client can be cloned
//! into as many tasks as needed.

use std::{io, time::Duration};

use bytes::BytesMut;
use snafu::ResultExt;
use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
	net::TcpStream,
	time::timeout,
};
use tokio_util::codec::Encoder as _;
use tunprobe_core::{Endpoint, TargetHost, debug};

use crate::{
	ConnectFailedSnafu, Error, HandshakeFailedSnafu, ProxyUnreachableSnafu,
	proto::{AddressType, ClientCodec, ClientFrame, METHOD_NO_ACCEPTABLE, METHOD_NO_AUTH, MIN_REPLY_LEN, ReplyCode, VERSION},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Socks5ClientOpts {
	/// Bound on opening the TCP connection to the proxy.
	pub connect_timeout:   Duration,
	/// Bound on each of the two request/reply exchanges.
	pub handshake_timeout: Duration,
}

impl Default for Socks5ClientOpts {
	fn default() -> Self {
		Self {
			connect_timeout:   Duration::from_secs(10),
			handshake_timeout: Duration::from_secs(10),
		}
	}
}

#[derive(Debug, Clone)]
pub struct Socks5Client {
	endpoint: Endpoint,
	opts:     Socks5ClientOpts,
}

enum Reply {
	Accepted,
	Rejected(ReplyCode),
	Short(usize),
}

impl Socks5Client {
	pub fn new(endpoint: Endpoint) -> Self {
		Self::with_opts(endpoint, Socks5ClientOpts::default())
	}

	pub fn with_opts(endpoint: Endpoint, opts: Socks5ClientOpts) -> Self {
		Self { endpoint, opts }
	}

	pub fn endpoint(&self) -> &Endpoint {
		&self.endpoint
	}

	/// Open a tunnel to `target_host:target_port` through the proxy.
	///
	/// A literal IPv4 host is sent as an IPv4 address, anything else as a
	/// domain name resolved by the proxy.
	pub async fn connect(&self, target_host: &str, target_port: u16) -> Result<TcpStream, Error> {
		let mut request = BytesMut::new();
		ClientCodec.encode(
			ClientFrame::Connect {
				host: TargetHost::parse(target_host),
				port: target_port,
			},
			&mut request,
		)?;

		let mut stream = self.open().await?;
		self.negotiate(&mut stream).await?;
		self.request(&mut stream, &request, target_host, target_port)
			.await?;

		debug!(target: "[SOCKS] CONNECT", "tunnel to {target_host}:{target_port} via {} established", self.endpoint);
		Ok(stream)
	}

	async fn open(&self) -> Result<TcpStream, Error> {
		let addr = (self.endpoint.host(), self.endpoint.port());
		let stream = match timeout(self.opts.connect_timeout, TcpStream::connect(addr)).await {
			Ok(res) => res,
			Err(_) => Err(io::Error::new(
				io::ErrorKind::TimedOut,
				format!("connect timed out after {:?}", self.opts.connect_timeout),
			)),
		}
		.context(ProxyUnreachableSnafu {
			endpoint: self.endpoint.clone(),
		})?;
		stream.set_nodelay(true)?;
		Ok(stream)
	}

	async fn negotiate(&self, stream: &mut TcpStream) -> Result<(), Error> {
		let mut greeting = BytesMut::new();
		ClientCodec.encode(ClientFrame::Greeting, &mut greeting)?;

		let exchange = async {
			stream.write_all(&greeting).await?;
			let mut reply = [0u8; 2];
			stream.read_exact(&mut reply).await?;
			io::Result::Ok(reply)
		};
		let reply = match timeout(self.opts.handshake_timeout, exchange).await {
			Ok(Ok(reply)) => reply,
			Ok(Err(err)) => {
				let detail = if err.kind() == io::ErrorKind::UnexpectedEof {
					"connection closed before method selection".to_string()
				} else {
					err.to_string()
				};
				return HandshakeFailedSnafu {
					endpoint: self.endpoint.clone(),
					reply: None,
					detail,
				}
				.fail();
			}
			Err(_) => {
				return HandshakeFailedSnafu {
					endpoint: self.endpoint.clone(),
					reply:    None,
					detail:   format!("no method selection within {:?}", self.opts.handshake_timeout),
				}
				.fail();
			}
		};

		let detail = match reply {
			[VERSION, METHOD_NO_AUTH] => return Ok(()),
			[VERSION, METHOD_NO_ACCEPTABLE] => "proxy accepted none of the offered methods".to_string(),
			[VERSION, method] => format!("proxy selected unsupported method {method:#04x}"),
			[version, _] => format!("unexpected protocol version {version:#04x}"),
		};
		HandshakeFailedSnafu {
			endpoint: self.endpoint.clone(),
			reply: Some(reply),
			detail,
		}
		.fail()
	}

	async fn request(&self, stream: &mut TcpStream, request: &[u8], target_host: &str, target_port: u16) -> Result<(), Error> {
		let exchange = async {
			stream.write_all(request).await?;

			let mut header = [0u8; 4];
			let got = read_up_to(stream, &mut header).await?;
			if got < header.len() {
				return io::Result::Ok(Reply::Short(got));
			}
			let status = ReplyCode::from(header[1]);
			if status != ReplyCode::Succeeded {
				return Ok(Reply::Rejected(status));
			}

			// Drain the bound address so none of it leaks into the tunnel.
			let atyp = AddressType::from(header[3]);
			let mut received = header.len();
			let domain_len = if atyp == AddressType::Domain {
				match stream.read_u8().await {
					Ok(len) => len,
					Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(Reply::Short(received)),
					Err(err) => return Err(err),
				}
			} else {
				0
			};
			let mut rest = vec![0u8; atyp.remaining_len(domain_len)];
			if atyp == AddressType::Domain {
				// length byte already consumed
				rest.truncate(rest.len() - 1);
				received += 1;
			}
			let got = read_up_to(stream, &mut rest).await?;
			received += got;
			if got < rest.len() || received < MIN_REPLY_LEN {
				return Ok(Reply::Short(received));
			}
			Ok(Reply::Accepted)
		};

		let target = format!("{target_host}:{target_port}");
		let (reply, detail) = match timeout(self.opts.handshake_timeout, exchange).await {
			Ok(Ok(Reply::Accepted)) => return Ok(()),
			Ok(Ok(Reply::Rejected(code))) => (Some(code), format!("proxy replied {code}")),
			Ok(Ok(Reply::Short(n))) => (None, format!("short reply ({n} bytes, need at least {MIN_REPLY_LEN})")),
			Ok(Err(err)) => (None, err.to_string()),
			Err(_) => (None, format!("no reply within {:?}", self.opts.handshake_timeout)),
		};
		ConnectFailedSnafu {
			endpoint: self.endpoint.clone(),
			target,
			reply,
			detail,
		}
		.fail()
	}
}

/// Fill `buf` or stop at EOF; returns how many bytes arrived.
async fn read_up_to<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
	let mut filled = 0;
	while filled < buf.len() {
		let n = reader.read(&mut buf[filled..]).await?;
		if n == 0 {
			break;
		}
		filled += n;
	}
	Ok(filled)
}

#[cfg(test)]
mod tests {
	use std::{net::SocketAddr, time::Instant};

	use tokio::{
		io::{AsyncReadExt, AsyncWriteExt},
		net::TcpListener,
		task::JoinHandle,
	};

	use super::*;

	/// A one-shot peer that reads the greeting, answers with `greeting_reply`,
	/// reads a CONNECT request and answers with `connect_reply`. Returns the
	/// request bytes it saw.
	async fn scripted_proxy(greeting_reply: Vec<u8>, connect_reply: Vec<u8>) -> (SocketAddr, JoinHandle<eyre::Result<Vec<u8>>>) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let handle = tokio::spawn(async move {
			let (mut stream, _) = listener.accept().await?;
			let mut greeting = [0u8; 3];
			stream.read_exact(&mut greeting).await?;
			assert_eq!(greeting, [0x05, 0x01, 0x00]);
			stream.write_all(&greeting_reply).await?;
			if greeting_reply != [0x05, 0x00] {
				return Ok(Vec::new());
			}

			let mut head = [0u8; 5];
			stream.read_exact(&mut head).await?;
			let rest = match head[3] {
				0x01 => 4 - 1 + 2,
				0x03 => head[4] as usize + 2,
				other => panic!("unexpected atyp {other}"),
			};
			let mut request = head.to_vec();
			let mut tail = vec![0u8; rest];
			stream.read_exact(&mut tail).await?;
			request.extend_from_slice(&tail);

			stream.write_all(&connect_reply).await?;
			let _ = stream.write_all(b"after-reply").await;
			// hold the connection until the client is done
			let mut sink = Vec::new();
			let _ = stream.read_to_end(&mut sink).await;
			Ok(request)
		});
		(addr, handle)
	}

	fn client(addr: SocketAddr) -> Socks5Client {
		Socks5Client::with_opts(addr.into(), Socks5ClientOpts {
			connect_timeout:   Duration::from_secs(2),
			handshake_timeout: Duration::from_millis(500),
		})
	}

	const OK_IPV4_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90];

	#[test_log::test(tokio::test)]
	async fn test_ipv4_request_on_the_wire() -> eyre::Result<()> {
		let (addr, peer) = scripted_proxy(vec![0x05, 0x00], OK_IPV4_REPLY.to_vec()).await;
		let mut stream = client(addr).connect("10.10.0.20", 8080).await?;

		let mut buf = [0u8; 11];
		stream.read_exact(&mut buf).await?;
		assert_eq!(&buf, b"after-reply");
		drop(stream);

		let request = peer.await??;
		assert_eq!(request, [0x05, 0x01, 0x00, 0x01, 10, 10, 0, 20, 0x1F, 0x90]);
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn test_domain_request_on_the_wire() -> eyre::Result<()> {
		let (addr, peer) = scripted_proxy(vec![0x05, 0x00], OK_IPV4_REPLY.to_vec()).await;
		let stream = client(addr).connect("echo.internal", 8080).await?;
		drop(stream);

		let request = peer.await??;
		let mut expect = vec![0x05, 0x01, 0x00, 0x03, 13];
		expect.extend_from_slice(b"echo.internal");
		expect.extend_from_slice(&8080u16.to_be_bytes());
		assert_eq!(request, expect);
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn test_domain_bound_address_is_drained() -> eyre::Result<()> {
		let mut reply = vec![0x05, 0x00, 0x00, 0x03, 9];
		reply.extend_from_slice(b"proxy.lan");
		reply.extend_from_slice(&[0x04, 0x38]);
		let (addr, _peer) = scripted_proxy(vec![0x05, 0x00], reply).await;

		let mut stream = client(addr).connect("127.0.0.1", 9).await?;
		let mut buf = [0u8; 11];
		stream.read_exact(&mut buf).await?;
		assert_eq!(&buf, b"after-reply");
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn test_ipv6_bound_address_is_drained() -> eyre::Result<()> {
		let mut reply = vec![0x05, 0x00, 0x00, 0x04];
		reply.extend_from_slice(&[0u8; 16]);
		reply.extend_from_slice(&[0x00, 0x50]);
		let (addr, _peer) = scripted_proxy(vec![0x05, 0x00], reply).await;

		let mut stream = client(addr).connect("127.0.0.1", 9).await?;
		let mut buf = [0u8; 11];
		stream.read_exact(&mut buf).await?;
		assert_eq!(&buf, b"after-reply");
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn test_proxy_unreachable() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		drop(listener);

		let started = Instant::now();
		let err = client(addr).connect("127.0.0.1", 8080).await.unwrap_err();
		assert!(matches!(err, Error::ProxyUnreachable { .. }), "{err:?}");
		assert!(started.elapsed() < Duration::from_secs(3));
	}

	#[test_log::test(tokio::test)]
	async fn test_no_acceptable_method() {
		let (addr, _peer) = scripted_proxy(vec![0x05, 0xFF], Vec::new()).await;
		let err = client(addr).connect("127.0.0.1", 8080).await.unwrap_err();
		match err {
			Error::HandshakeFailed { reply, .. } => assert_eq!(reply, Some([0x05, 0xFF])),
			other => panic!("unexpected {other:?}"),
		}
	}

	#[test_log::test(tokio::test)]
	async fn test_password_method_rejected() {
		let (addr, _peer) = scripted_proxy(vec![0x05, 0x02], Vec::new()).await;
		let err = client(addr).connect("127.0.0.1", 8080).await.unwrap_err();
		assert!(matches!(err, Error::HandshakeFailed { reply: Some([0x05, 0x02]), .. }), "{err:?}");
	}

	#[test_log::test(tokio::test)]
	async fn test_wrong_version_rejected() {
		let (addr, _peer) = scripted_proxy(vec![0x04, 0x00], Vec::new()).await;
		let err = client(addr).connect("127.0.0.1", 8080).await.unwrap_err();
		assert!(matches!(err, Error::HandshakeFailed { reply: Some([0x04, 0x00]), .. }), "{err:?}");
	}

	#[test_log::test(tokio::test)]
	async fn test_closed_during_greeting() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let (mut stream, _) = listener.accept().await.unwrap();
			let mut greeting = [0u8; 3];
			let _ = stream.read_exact(&mut greeting).await;
			// one byte, then hang up
			let _ = stream.write_all(&[0x05]).await;
		});

		let err = client(addr).connect("127.0.0.1", 8080).await.unwrap_err();
		assert!(matches!(err, Error::HandshakeFailed { reply: None, .. }), "{err:?}");
	}

	#[test_log::test(tokio::test)]
	async fn test_silent_proxy_times_out() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let _peer = tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			tokio::time::sleep(Duration::from_secs(5)).await;
			drop(stream);
		});

		let started = Instant::now();
		let err = client(addr).connect("127.0.0.1", 8080).await.unwrap_err();
		assert!(matches!(err, Error::HandshakeFailed { reply: None, .. }), "{err:?}");
		assert!(started.elapsed() < Duration::from_secs(2));
	}

	#[test_log::test(tokio::test)]
	async fn test_proxy_silent_after_greeting_times_out() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let _peer = tokio::spawn(async move {
			let (mut stream, _) = listener.accept().await.unwrap();
			let mut greeting = [0u8; 3];
			stream.read_exact(&mut greeting).await.unwrap();
			stream.write_all(&[0x05, 0x00]).await.unwrap();
			// swallow the request, never answer it
			tokio::time::sleep(Duration::from_secs(5)).await;
			drop(stream);
		});

		let started = Instant::now();
		let err = client(addr).connect("10.10.0.20", 8080).await.unwrap_err();
		match err {
			Error::ConnectFailed { reply, detail, .. } => {
				assert!(reply.is_none());
				assert!(detail.contains("no reply within"), "{detail}");
			}
			other => panic!("unexpected {other:?}"),
		}
		assert!(started.elapsed() < Duration::from_secs(2));
	}

	#[test_log::test(tokio::test)]
	async fn test_connect_refused_by_proxy() {
		let reply = vec![0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
		let (addr, _peer) = scripted_proxy(vec![0x05, 0x00], reply).await;
		let err = client(addr).connect("10.10.0.20", 1).await.unwrap_err();
		assert_eq!(err.reply_code(), Some(ReplyCode::ConnectionRefused));
	}

	#[test_log::test(tokio::test)]
	async fn test_short_connect_reply() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let (mut stream, _) = listener.accept().await.unwrap();
			let mut greeting = [0u8; 3];
			stream.read_exact(&mut greeting).await.unwrap();
			stream.write_all(&[0x05, 0x00]).await.unwrap();
			let mut request = [0u8; 10];
			stream.read_exact(&mut request).await.unwrap();
			// header and part of the address, then close
			stream.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0]).await.unwrap();
		});

		let err = client(addr).connect("127.0.0.1", 8080).await.unwrap_err();
		match err {
			Error::ConnectFailed { reply, detail, .. } => {
				assert!(reply.is_none());
				assert!(detail.contains("6 bytes"), "{detail}");
			}
			other => panic!("unexpected {other:?}"),
		}
	}

	#[test_log::test(tokio::test)]
	async fn test_degenerate_domain_reply_is_short() {
		// empty bound domain: 7 bytes total, below the 10 byte minimum
		let reply = vec![0x05, 0x00, 0x00, 0x03, 0, 0x00, 0x50];
		let (addr, _peer) = scripted_proxy(vec![0x05, 0x00], reply).await;
		let err = client(addr).connect("127.0.0.1", 8080).await.unwrap_err();
		assert!(matches!(err, Error::ConnectFailed { reply: None, .. }), "{err:?}");
	}

	#[test_log::test(tokio::test)]
	async fn test_oversized_domain_fails_before_io() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let err = client(addr).connect(&"x".repeat(300), 80).await.unwrap_err();
		assert!(matches!(err, Error::InvalidTarget { .. }), "{err:?}");
	}
}
