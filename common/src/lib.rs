// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Security group control plane: common facilities
//!
//! This crate holds the types shared between the control plane (which
//! computes per-instance firewall rulesets and schedules their propagation)
//! and the host-resident agents that enforce them.  Other top-level crates
//! implement the pieces themselves (e.g., `secgroup_nexus` for the control
//! plane and `secgroup_sled_agent` for the simulated host agent).

// We only use rustdoc for internal documentation, including private items, so
// it's expected that we'll have links to private items in the docs.
#![allow(rustdoc::private_intra_doc_links)]

pub mod api;
pub mod typed_uuid;
