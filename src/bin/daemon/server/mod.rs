//! Server Module
//!
//! This module contains the request path of the mechd daemon: connections and bus messages
//! are accepted, queued to a worker pool, routed to a verb handler and answered.
//!
//! The server module is organized into five components:
//! - acceptor: TCP listener and ZeroMQ ROUTER socket sharing one select loop
//! - workers: fixed pool of tasks serving one request per job
//! - router: verb table, outcomes and the dispatch journal
//! - commands: the generic verb set
//! - envelope: bus message format

/// Acceptor module - multiplexes the listener, the bus and the shutdown signal
pub mod acceptor;

/// Commands module - registers every verb with the router
pub mod commands;

/// Envelope module - `source>destination TYPE body` bus messages
pub mod envelope;

/// Router module - verb lookup, privilege checks and reply formatting
pub mod router;

/// Workers module - bounded job queue drained by worker tasks
pub mod workers;

/// Server tests module - contains tests for the server components
#[cfg(test)]
mod server_tests;
