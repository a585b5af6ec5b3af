//! Isolation levels and policy resolution.

pub mod level;
pub mod resolver;

pub use level::{template, CredentialMode, IsolationLevel, Namespace, RestrictionTemplate};
pub use resolver::{resolve, Origin, Overrides, Policy};
