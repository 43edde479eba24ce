//! Metamorph -- Autonomous Self-Mutation Daemon
//!
//! A daemon that analyzes its own performance, writes versioned code
//! improvements into a sandboxed workspace, hot-patches its data and
//! configuration, and keeps itself up to date from its upstream repo.

pub mod types;
pub mod error;
pub mod config;
pub mod sandbox;
pub mod filter;
pub mod ledger;
pub mod vcs;
pub mod implementer;
pub mod updater;
pub mod patcher;
pub mod notify;
pub mod daemon;
