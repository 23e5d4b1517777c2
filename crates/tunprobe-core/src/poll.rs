//! Deadline-bounded polling.
//!
//! External state (container boot, log lines, kernel routes) has no push
//! notification, so every wait in the harness is a probe repeated at a fixed
//! interval until it reports ready or the deadline passes. On expiry the last
//! observed state is handed back so the caller can say which condition was
//! still unmet.

use std::{ops::ControlFlow, time::Duration};

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
	pub interval: Duration,
	pub timeout:  Duration,
}

impl PollPolicy {
	pub const fn new(interval: Duration, timeout: Duration) -> Self {
		Self { interval, timeout }
	}
}

/// The deadline passed before the probe reported ready.
#[derive(Debug, Clone)]
pub struct Elapsed<S> {
	pub waited:   Duration,
	pub attempts: u32,
	/// State reported by the last probe that completed. `None` if no probe
	/// completed, i.e. the first one hung past the cutoff.
	pub last:     Option<S>,
	/// The final probe was cancelled at the cutoff instead of reporting.
	pub overran:  bool,
}

/// Run `probe` every `policy.interval` until it breaks with a value.
///
/// The probe runs at least once. The last sleep is clamped to the remaining
/// time, so the final probe starts at the deadline. A probe still pending at
/// `timeout + interval` is dropped, so the call never returns later than
/// that.
pub async fn poll_until<T, S, F, Fut>(policy: PollPolicy, mut probe: F) -> Result<T, Elapsed<S>>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = ControlFlow<T, S>>,
{
	let started = Instant::now();
	let deadline = started + policy.timeout;
	let cutoff = deadline + policy.interval;
	let mut attempts = 0;
	let mut last = None;

	loop {
		attempts += 1;
		match tokio::time::timeout_at(cutoff, probe()).await {
			Ok(ControlFlow::Break(value)) => return Ok(value),
			Ok(ControlFlow::Continue(state)) => last = Some(state),
			Err(_) => {
				return Err(Elapsed {
					waited: started.elapsed(),
					attempts,
					last,
					overran: true,
				});
			}
		}

		let now = Instant::now();
		if now >= deadline {
			return Err(Elapsed {
				waited: now - started,
				attempts,
				last,
				overran: false,
			});
		}
		tokio::time::sleep(policy.interval.min(deadline - now)).await;
	}
}
