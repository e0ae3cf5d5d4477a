// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Library interface to the sled agent's firewall side
//!
//! Only a simulated agent exists here.  It implements the agent half of the
//! ruleset push contract: it applies a pushed ruleset unless it has already
//! applied a newer sequence for the instance, answers, and reports what it
//! has applied when the control plane asks for a resync.

// We only use rustdoc for internal documentation, including private items, so
// it's expected that we'll have links to private items in the docs.
#![allow(rustdoc::private_intra_doc_links)]

// Module for executing the simulated sled agent.
pub mod sim;

#[macro_use]
extern crate slog;
