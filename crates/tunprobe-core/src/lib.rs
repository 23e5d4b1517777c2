pub mod log;
pub mod poll;
pub mod types;

pub use poll::{Elapsed, PollPolicy, poll_until};
pub use types::{Endpoint, TargetHost};

#[doc(hidden)]
pub mod __private {
	pub use const_str;
	pub use tracing;
}
