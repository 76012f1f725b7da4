//! Invocation of the external `terminal-read` CLI.

pub mod executor;

pub use executor::{PaneFetcher, TermError, TermExecutor};
