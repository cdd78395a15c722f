//! Command-line launcher for a Lantern peer node.

pub mod cli;

pub use cli::run;
