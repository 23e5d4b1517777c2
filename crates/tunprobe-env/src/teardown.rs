use std::fmt::Display;

use crate::{Error, TeardownSnafu};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
	/// e.g. `container tunprobe-vpn-client`
	pub resource: String,
	pub detail:   String,
}

/// Outcome of a best-effort teardown. Every resource is attempted, and each one
/// that could not be released leaves an entry here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct TeardownReport {
	failures: Vec<TeardownFailure>,
}

impl TeardownReport {
	pub fn record(&mut self, resource: impl Into<String>, detail: impl Display) {
		self.failures.push(TeardownFailure {
			resource: resource.into(),
			detail:   detail.to_string(),
		});
	}

	pub fn is_clean(&self) -> bool {
		self.failures.is_empty()
	}

	pub fn failures(&self) -> &[TeardownFailure] {
		&self.failures
	}

	pub fn into_result(self) -> Result<(), Error> {
		if self.is_clean() {
			Ok(())
		} else {
			TeardownSnafu { report: self }.fail()
		}
	}
}

impl Display for TeardownReport {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		if self.failures.is_empty() {
			return f.write_str("clean");
		}
		for (i, failure) in self.failures.iter().enumerate() {
			if i > 0 {
				f.write_str("; ")?;
			}
			write!(f, "{}: {}", failure.resource, failure.detail)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_clean_report() {
		let report = TeardownReport::default();
		assert_eq!(report.to_string(), "clean");
		report.into_result().unwrap();
	}

	#[test]
	fn test_failures_are_kept_in_order() {
		let mut report = TeardownReport::default();
		report.record("container a", "boom");
		report.record("network n", "still in use");
		assert_eq!(report.failures().len(), 2);
		assert_eq!(report.to_string(), "container a: boom; network n: still in use");

		match report.into_result() {
			Err(Error::Teardown { report, .. }) => assert_eq!(report.failures()[1].resource, "network n"),
			other => panic!("unexpected {other:?}"),
		}
	}
}
