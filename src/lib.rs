//! MySQL tool server
//!
//! Exposes a single MySQL database to agents as a small catalog of tools spoken over
//! JSON-RPC 2.0 (the Model Context Protocol), on stdio or TCP.
//!
//! # Features
//!
//! - Bounded connection pool with FIFO waiting and lazy connection setup
//! - Schema introspection: tables, columns, indexes and query plans
//! - Read-only SQL execution, with single-row writes behind an explicit opt-in
//! - Structured, machine-readable errors for every failed call

pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod identifier;
pub mod introspect;
pub mod mysql;
pub mod pool;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod statement;
pub mod value;

#[cfg(test)]
mod testing;
