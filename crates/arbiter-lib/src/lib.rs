//! Core library for Arbiter2
//!
//! Arbiter2 keeps shared interactive login nodes usable: it attributes CPU
//! and memory to logged-in users through the cgroup hierarchy, scores
//! sustained overuse, and applies escalating, time-limited quota penalties.
//! This crate provides:
//! - usage collection from cgroups and /proc
//! - badness scoring and the penalty status machine
//! - quota enforcement against the cgroup filesystem
//! - the shared SQL status store and multi-host synchronization
//! - the tick-driven control loop tying the phases together

pub mod badness;
pub mod collector;
pub mod config;
pub mod enforcer;
pub mod events;
pub mod exitfile;
pub mod highusage;
pub mod models;
pub mod notifier;
pub mod startup;
pub mod status;
pub mod statusdb;
pub mod sysinfo;
pub mod tick;
pub mod user;

pub use config::ArbiterConfig;
pub use models::{Event, ProcessUsage};
pub use sysinfo::SystemSpecs;
pub use tick::{ControlLoop, ExitReason};
