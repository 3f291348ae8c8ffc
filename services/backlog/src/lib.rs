//! Backlog node library crate.
//!
//! # Purpose
//! Hosts a [`backlog_cache::BroadcasterCache`] as a standalone process: configuration
//! loading plus the tracing, metrics and introspection HTTP surface around it.
pub mod config;
pub mod observability;

#[cfg(test)]
mod test_support;
