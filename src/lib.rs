//! jobforge: a distributed background-job execution engine over a
//! Redis-compatible datastore.
//!
//! Leaves first: job envelope, middleware chain, and handler registry are
//! pure data/composition; the fetcher, retry/death engine, and processor
//! build on them; the scheduled poller and manager coordinate the whole
//! pool and its shutdown.

pub mod cli;
pub mod client;
pub mod config;
pub mod datastore;
pub mod envelope;
pub mod error;
pub mod fetcher;
pub mod manager;
pub mod metrics;
pub mod middleware;
pub mod poller;
pub mod processor;
pub mod registry;
pub mod retry;

pub use client::Client;
pub use config::Config;
pub use datastore::{Datastore, DatastoreError, MemoryDatastore, RedisDatastore};
pub use envelope::Job;
pub use error::{JobError, JobFailure, Outcome, ShutdownMarker};
pub use manager::Manager;
pub use middleware::{Chain, Invocation, Middleware, MiddlewareFactory};
pub use registry::{Handler, HandlerFactory, Registry};
