//! Nexus integration tests
//!
//! See the driver in the parent directory for how and why this is structured
//! the way it is.

mod background_tasks;
mod propagation;
mod security_groups;
