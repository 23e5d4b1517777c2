use std::backtrace::Backtrace;

use snafu::{IntoError, Snafu};
use tunprobe_core::Endpoint;

pub mod client;
pub mod proto;

pub use client::{Socks5Client, Socks5ClientOpts};
pub use proto::ReplyCode;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
	/// No TCP connection to the proxy endpoint could be opened.
	#[snafu(display("SOCKS5 proxy {endpoint} is unreachable"))]
	ProxyUnreachable {
		endpoint:  Endpoint,
		source:    std::io::Error,
		backtrace: Backtrace,
	},
	/// The method-selection exchange did not end with `05 00`.
	#[snafu(display("SOCKS5 handshake with {endpoint} failed: {detail}"))]
	HandshakeFailed {
		endpoint:  Endpoint,
		/// Raw method-selection reply, when both bytes arrived.
		reply:     Option<[u8; 2]>,
		detail:    String,
		backtrace: Backtrace,
	},
	/// The CONNECT reply was short or carried a non-zero status.
	#[snafu(display("SOCKS5 CONNECT to {target} via {endpoint} failed: {detail}"))]
	ConnectFailed {
		endpoint:  Endpoint,
		target:    String,
		/// Status byte of the reply, when the reply header arrived.
		reply:     Option<ReplyCode>,
		detail:    String,
		backtrace: Backtrace,
	},
	#[snafu(display("Cannot encode target {host:?}: {reason}"))]
	InvalidTarget {
		host:      String,
		reason:    &'static str,
		backtrace: Backtrace,
	},
	Io {
		source:    std::io::Error,
		backtrace: Backtrace,
	},
}

impl From<std::io::Error> for Error {
	#[inline(always)]
	fn from(value: std::io::Error) -> Self {
		IoSnafu.into_error(value)
	}
}

impl Error {
	/// Status byte the proxy answered the CONNECT with, if any.
	pub fn reply_code(&self) -> Option<ReplyCode> {
		match self {
			Error::ConnectFailed { reply, .. } => *reply,
			_ => None,
		}
	}
}
