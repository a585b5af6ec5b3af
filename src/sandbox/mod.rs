//! Turning a resolved policy into a running sandbox.
//!
//! | Module | Role |
//! |--------|------|
//! | [`filesystem`] | ordered mount plan, ephemeral home |
//! | [`display`] | Wayland / X11 socket and credential exposure |
//! | [`plan`] | launch requests and the flattened [`plan::LaunchPlan`] |
//! | [`executor`] | the external primitive (bubblewrap) |
//! | [`signals`] | signals queued for forwarding to the child |
//! | [`manager`] | session lifecycle and guaranteed teardown |

pub mod display;
pub mod executor;
pub mod filesystem;
pub mod manager;
pub mod plan;
pub mod signals;
