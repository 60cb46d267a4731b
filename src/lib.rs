//! sandbroker: a sandbox broker for spawning and supervising untrusted
//! worker processes.
//!
//! The broker is the trusted side of the sandbox: it spawns each target
//! suspended with a restrictive security context, attaches it to an
//! isolation container, watches the container's lifecycle events on a
//! dedicated servicing thread, and releases everything exactly once when
//! the last process in the container exits.

pub mod broker;
pub mod cgroup;
pub mod cli;
pub mod container;
pub mod policy;
pub mod target;
pub mod tracker;
pub mod types;
