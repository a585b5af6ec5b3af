//! isolator - profile-driven application sandboxing on Linux
//!
//! Resolves a named application profile and an isolation level into a
//! [`policy::Policy`], turns that policy into a [`sandbox::plan::LaunchPlan`]
//! (mounts, devices, namespaces, capabilities, environment, limits), and
//! runs it under bubblewrap with guaranteed cleanup of per-launch state.

pub mod config;
pub mod error;
pub mod policy;
pub mod profile;
pub mod sandbox;
pub mod utils;

pub use error::{IsolatorError, Result, Warning};
