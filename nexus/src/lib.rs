// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Library interface to the security group side of Nexus
//!
//! This crate owns security groups and their rules, computes the ruleset in
//! effect for each instance, and propagates those rulesets to the host
//! agents that enforce them.

// We only use rustdoc for internal documentation, including private items, so
// it's expected that we'll have links to private items in the docs.
#![allow(rustdoc::private_intra_doc_links)]

pub mod app;
pub mod config; // Public for testing
pub mod context;
pub mod db;

pub use app::test_interfaces::TestInterfaces;
pub use app::Nexus;
pub use config::Config;

#[macro_use]
extern crate slog;
