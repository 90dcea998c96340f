//! A UNIX process-supervision daemon.
//!
//! One long-lived supervisor forks and monitors a fleet of child processes
//! from a configuration file, restarts them with backoff, captures their
//! output into rotating logs, and exposes a control surface over a local
//! HTTP endpoint.

#![warn(unused_crate_dependencies)]
// Test-only dependencies are exercised by the integration tests.
#[cfg(test)]
use assert_cmd as _;
#[cfg(test)]
use predicates as _;

/// CLI parsing.
pub mod cli;

/// Config loading.
pub mod config;

/// Privileged startup: daemonization, pidfile, rlimits.
pub mod daemonize;

/// Child output capture.
pub mod dispatcher;

/// Errors.
pub mod error;

/// Log pipeline and activity log.
pub mod logger;

/// Event loop and timers.
pub mod poller;

/// Per-child state machine.
pub mod process;

/// RPC control surface.
pub mod rpc;

/// Signal dispatch.
pub mod signals;

/// Supervisor daemon.
pub mod supervisor;
