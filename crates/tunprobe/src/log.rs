use std::io::IsTerminal as _;

use eyre::Context as _;
use time::macros::format_description;
use tracing::{Level, level_filters::LevelFilter};
use tracing_subscriber::{
	filter::Targets, fmt::time::LocalTime, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

/// Overrides the whole filter, in `RUST_LOG` directive syntax.
const FILTER_VAR: &str = "TUNPROBE_LOG";

const HARNESS_CRATES: [&str; 5] = ["tunprobe", "tunprobe_core", "tunprobe_socks", "tunprobe_env", "tunprobe_test"];

/// Docker client internals, chatty at INFO and below.
const ENGINE_CRATES: [&str; 3] = ["bollard", "hyper", "hyper_util"];

/// Logs go to stderr; stdout carries command output (`exec`, `logs`, ...).
pub fn init_log(level: Level) -> eyre::Result<()> {
	let filter = filter(level, std::env::var(FILTER_VAR).ok().as_deref())?;
	let stderr = std::io::stderr();
	let ansi = stderr.is_terminal();
	tracing_subscriber::registry()
		.with(filter)
		.with(
			tracing_subscriber::fmt::layer()
				.with_writer(std::io::stderr)
				.with_ansi(ansi)
				.with_target(true)
				.with_timer(LocalTime::new(format_description!(
					"[hour]:[minute]:[second].[subsecond digits:3]"
				))),
		)
		.try_init()?;
	Ok(())
}

fn filter(level: Level, directives: Option<&str>) -> eyre::Result<Targets> {
	if let Some(directives) = directives.filter(|d| !d.trim().is_empty()) {
		return directives
			.parse()
			.wrap_err_with(|| format!("invalid {FILTER_VAR} value {directives:?}"));
	}
	Ok(Targets::new()
		.with_targets(HARNESS_CRATES.map(|krate| (krate, level)))
		.with_targets(ENGINE_CRATES.map(|krate| (krate, LevelFilter::WARN)))
		.with_default(LevelFilter::INFO))
}
