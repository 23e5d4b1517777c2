pub mod persistent;
pub mod runtime;
