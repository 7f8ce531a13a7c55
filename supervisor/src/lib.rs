//! Dual-stack cellular connection supervisor. `main.rs` is a thin shell:
//! logger construction, signal registration, and exit-code translation;
//! everything else lives here so `tests/scenarios.rs` can drive the Phase
//! A–D state machine against fake collaborators.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod phases;

pub use collaborators::{Collaborators, RealCollaborators};
pub use error::{Result, SupervisorError};
