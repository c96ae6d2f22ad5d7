//! Command-line interface for jobforge.
//!
//! Provides the `server` command that launches a fetcher, processor pool,
//! and scheduled poller against a Redis-compatible datastore.

mod commands;

pub use commands::{parse_cli, run, run_with_cli};
