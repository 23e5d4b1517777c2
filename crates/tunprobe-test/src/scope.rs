use std::panic::{AssertUnwindSafe, resume_unwind};

use futures_util::FutureExt as _;
use tunprobe_core::{info, warn};
use tunprobe_env::{ContainerEngine, Environment};

/// Run `scenario` against a freshly started environment and tear it down
/// afterwards, whether the scenario returned, failed or panicked.
///
/// The scenario's own error or panic wins over a teardown failure, which is
/// then only logged. A clean scenario with an incomplete teardown fails with
/// the teardown report.
pub async fn with_environment<E, T, F>(env: &mut Environment<E>, scenario: F) -> eyre::Result<T>
where
	E: ContainerEngine,
	F: AsyncFnOnce(&Environment<E>) -> eyre::Result<T>,
{
	if let Err(err) = env.start().await {
		let report = env.stop().await;
		if !report.is_clean() {
			warn!(target: "[SCOPE]", "cleanup after failed start incomplete: {report}");
		}
		return Err(err.into());
	}

	let outcome = AssertUnwindSafe(scenario(&*env)).catch_unwind().await;
	let report = env.stop().await;

	match outcome {
		Err(panic) => {
			if !report.is_clean() {
				warn!(target: "[SCOPE]", "teardown after panic incomplete: {report}");
			}
			resume_unwind(panic)
		}
		Ok(Err(err)) => {
			if !report.is_clean() {
				warn!(target: "[SCOPE]", "teardown after failure incomplete: {report}");
			}
			Err(err)
		}
		Ok(Ok(value)) => {
			report.into_result()?;
			info!(target: "[SCOPE]", "scenario passed, environment released");
			Ok(value)
		}
	}
}
