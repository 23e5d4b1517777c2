//! Logging macros shared by every tunprobe crate.
//!
//! `info!(target: "[ENV] START", ...)` emits an event whose target is the
//! caller's module path followed by the tag, e.g.
//! `tunprobe_env::env [ENV] START`. Subscriber filters match on the module
//! prefix, the tag keeps the output greppable.

#[doc(hidden)]
#[macro_export]
macro_rules! __tagged_event {
	($level:ident, target: $target:expr, $($arg:tt)*) => {
		$crate::__private::tracing::$level!(
			target: $crate::__private::const_str::concat!(module_path!(), " ", $target),
			$($arg)*
		)
	};
	($level:ident, $($arg:tt)*) => {
		$crate::__private::tracing::$level!($($arg)*)
	};
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
		$crate::__tagged_event!(info, $($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
		$crate::__tagged_event!(warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
		$crate::__tagged_event!(error, $($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
		$crate::__tagged_event!(debug, $($arg)*)
    };
}
